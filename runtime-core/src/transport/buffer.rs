use std::collections::HashMap;

use uuid::Uuid;

use super::payload::{Payload, ReplyPattern};

/// Replies that arrived before anyone polled for them, keyed by request id.
///
/// Taking matches returns them in arrival order.
#[derive(Debug, Default)]
pub struct ResponseBuffer {
    entries: HashMap<Uuid, (u64, Payload)>,
    next_seq: u64,
}

impl ResponseBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, payload: Payload) {
        let seq = self.next_seq;
        self.next_seq += 1;
        if let Some((_, replaced)) = self.entries.insert(payload.request_id, (seq, payload)) {
            tracing::warn!(
                request_id = %replaced.request_id,
                operation = %replaced.operation,
                "replaced a buffered reply with the same request id"
            );
        }
    }

    /// Remove and return every buffered payload matching `pattern`.
    pub fn take_matching(&mut self, pattern: &ReplyPattern) -> Vec<Payload> {
        let ids: Vec<Uuid> = self
            .entries
            .keys()
            .filter(|id| pattern.matches(id))
            .copied()
            .collect();

        let mut taken: Vec<(u64, Payload)> = ids
            .iter()
            .filter_map(|id| self.entries.remove(id))
            .collect();
        taken.sort_by_key(|(seq, _)| *seq);
        taken.into_iter().map(|(_, payload)| payload).collect()
    }

    /// Remove and return the earliest buffered payload matching `pattern`.
    /// Other matches keep their arrival position.
    pub fn take_first_matching(&mut self, pattern: &ReplyPattern) -> Option<Payload> {
        let id = self
            .entries
            .iter()
            .filter(|(id, _)| pattern.matches(id))
            .min_by_key(|(_, (seq, _))| *seq)
            .map(|(id, _)| *id)?;
        self.entries.remove(&id).map(|(_, payload)| payload)
    }

    pub fn contains(&self, request_id: &Uuid) -> bool {
        self.entries.contains_key(request_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_only_matching() {
        let mut buffer = ResponseBuffer::new();
        let a = Payload::new(0usize, "flush");
        let b = Payload::new(1usize, "flush");
        let (a_id, b_id) = (a.request_id, b.request_id);
        buffer.insert(a);
        buffer.insert(b);

        let taken = buffer.take_matching(&ReplyPattern::exact([b_id]));
        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].request_id, b_id);
        assert!(buffer.contains(&a_id));
        assert!(!buffer.contains(&b_id));
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_arrival_order_preserved() {
        let mut buffer = ResponseBuffer::new();
        let payloads: Vec<Payload> = (0..16usize).map(|i| Payload::new(i, "fetch")).collect();
        let expected: Vec<Uuid> = payloads.iter().map(|p| p.request_id).collect();
        for p in payloads {
            buffer.insert(p);
        }

        let taken: Vec<Uuid> = buffer
            .take_matching(&ReplyPattern::any())
            .iter()
            .map(|p| p.request_id)
            .collect();
        assert_eq!(taken, expected);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_take_first_keeps_later_matches_in_order() {
        let mut buffer = ResponseBuffer::new();
        let payloads: Vec<Payload> = (0..4usize).map(|i| Payload::new(i, "syn")).collect();
        let ids: Vec<Uuid> = payloads.iter().map(|p| p.request_id).collect();
        for p in payloads {
            buffer.insert(p);
        }

        let pattern = ReplyPattern::exact([ids[3], ids[1], ids[2]]);
        let first = buffer.take_first_matching(&pattern).unwrap();
        assert_eq!(first.request_id, ids[1]);

        // A later arrival must not overtake the remaining matches
        let late = Payload::new(9usize, "syn");
        buffer.insert(late);

        let rest: Vec<Uuid> = buffer
            .take_matching(&pattern)
            .iter()
            .map(|p| p.request_id)
            .collect();
        assert_eq!(rest, vec![ids[2], ids[3]]);
        assert!(buffer.take_first_matching(&pattern).is_none());
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn test_no_match_leaves_buffer_untouched() {
        let mut buffer = ResponseBuffer::new();
        buffer.insert(Payload::new(0usize, "flush"));
        assert!(buffer
            .take_matching(&ReplyPattern::exact([Uuid::new_v4()]))
            .is_empty());
        assert_eq!(buffer.len(), 1);
    }
}
