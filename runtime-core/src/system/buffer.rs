//! Bounded buffer of samples flowing through the dataflow graph.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use crate::error::{Result, RuntimeError};
use crate::system::data::{SampleId, SampleMeta};

#[derive(Debug)]
struct Slot {
    sample: SampleMeta,
    keys: HashSet<String>,
    consumed_by: HashSet<String>,
}

#[derive(Debug, Default)]
struct BufferState {
    slots: BTreeMap<usize, Slot>,
    next_index: usize,
}

/// Samples taken for one model function call.
#[derive(Debug, Clone)]
pub struct BufferBatch {
    pub indices: Vec<usize>,
    pub samples: Vec<SampleMeta>,
}

impl BufferBatch {
    pub fn ids(&self) -> Vec<SampleId> {
        self.samples.iter().map(|s| s.id).collect()
    }
}

/// Holds at most `max_size` samples. A sample is evicted once every consumer
/// node has taken it.
#[derive(Debug)]
pub struct SequenceBuffer {
    state: Mutex<BufferState>,
    changed: Notify,
    max_size: usize,
    consumers: HashSet<String>,
}

impl SequenceBuffer {
    /// `consumers` names every graph node that will take samples.
    pub fn new<I, S>(max_size: usize, consumers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            state: Mutex::new(BufferState::default()),
            changed: Notify::new(),
            max_size,
            consumers: consumers.into_iter().map(Into::into).collect(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BufferState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn size(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Insert `samples`, waiting while they do not fit. Returns their slot
    /// indices.
    pub async fn put_batch(&self, samples: Vec<SampleMeta>) -> Result<Vec<usize>> {
        let n = samples.len();
        if n > self.max_size {
            return Err(RuntimeError::buffer(format!(
                "batch of {} samples can never fit in a buffer of {}",
                n, self.max_size
            )));
        }

        let mut samples = Some(samples);
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if state.slots.len() + n <= self.max_size {
                    let mut indices = Vec::with_capacity(n);
                    for sample in samples.take().into_iter().flatten() {
                        let index = state.next_index;
                        state.next_index += 1;
                        state.slots.insert(
                            index,
                            Slot {
                                keys: sample.keys.iter().cloned().collect(),
                                sample,
                                consumed_by: HashSet::new(),
                            },
                        );
                        indices.push(index);
                    }
                    drop(state);
                    self.changed.notify_waiters();
                    return Ok(indices);
                }
            }

            notified.await;
        }
    }

    /// Wait for `n_seqs` samples carrying every key in `input_keys` that
    /// `node` has not consumed yet, and mark them consumed by `node`.
    pub async fn get_batch_for_rpc(
        &self,
        node: &str,
        input_keys: &[String],
        n_seqs: usize,
    ) -> Result<BufferBatch> {
        if n_seqs > self.max_size {
            return Err(RuntimeError::buffer(format!(
                "node '{}' needs {} samples but the buffer holds at most {}",
                node, n_seqs, self.max_size
            )));
        }

        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(batch) = self.try_take(node, input_keys, n_seqs) {
                return Ok(batch);
            }

            notified.await;
        }
    }

    fn try_take(&self, node: &str, input_keys: &[String], n_seqs: usize) -> Option<BufferBatch> {
        let mut state = self.lock();
        let indices: Vec<usize> = state
            .slots
            .iter()
            .filter(|(_, slot)| {
                !slot.consumed_by.contains(node)
                    && input_keys.iter().all(|k| slot.keys.contains(k))
            })
            .map(|(&i, _)| i)
            .take(n_seqs)
            .collect();
        if indices.len() < n_seqs {
            return None;
        }

        let mut samples = Vec::with_capacity(n_seqs);
        let mut evicted = false;
        for index in &indices {
            let Some(slot) = state.slots.get_mut(index) else {
                continue;
            };
            slot.consumed_by.insert(node.to_string());
            samples.push(slot.sample.clone());
            if self.consumers.iter().all(|c| slot.consumed_by.contains(c)) {
                state.slots.remove(index);
                evicted = true;
            }
        }
        drop(state);

        if evicted {
            self.changed.notify_waiters();
        }
        Some(BufferBatch { indices, samples })
    }

    /// Record that `keys` are now available for the samples at `indices`.
    /// Slots evicted in the meantime are skipped.
    pub fn amend_batch(&self, indices: &[usize], keys: &[String]) {
        {
            let mut state = self.lock();
            for index in indices {
                if let Some(slot) = state.slots.get_mut(index) {
                    slot.keys.extend(keys.iter().cloned());
                }
            }
        }
        self.changed.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    fn samples(ids: std::ops::Range<u64>) -> Vec<SampleMeta> {
        ids.map(|id| SampleMeta::new(id, ["prompts"])).collect()
    }

    fn keys(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_put_assigns_increasing_indices() {
        let buffer = SequenceBuffer::new(8, ["gen"]);
        assert_eq!(buffer.put_batch(samples(0..3)).await.unwrap(), vec![0, 1, 2]);
        assert_eq!(buffer.put_batch(samples(3..5)).await.unwrap(), vec![3, 4]);
        assert_eq!(buffer.size(), 5);
        assert_eq!(buffer.max_size(), 8);
    }

    #[tokio::test]
    async fn test_oversized_batch_rejected() {
        let buffer = SequenceBuffer::new(2, ["gen"]);
        let err = buffer.put_batch(samples(0..3)).await.unwrap_err();
        assert!(matches!(err, RuntimeError::Buffer { .. }));
        assert_eq!(buffer.size(), 0);
    }

    #[tokio::test]
    async fn test_put_blocks_until_space_frees() {
        let buffer = Arc::new(SequenceBuffer::new(4, ["train"]));
        buffer.put_batch(samples(0..4)).await.unwrap();

        let producer = {
            let buffer = buffer.clone();
            tokio::spawn(async move { buffer.put_batch(samples(4..6)).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!producer.is_finished());
        assert_eq!(buffer.size(), 4);

        // The only consumer takes two samples; they are evicted
        let batch = buffer.get_batch_for_rpc("train", &keys(&["prompts"]), 2).await.unwrap();
        assert_eq!(batch.ids(), vec![0, 1]);

        let indices = tokio::time::timeout(Duration::from_secs(1), producer)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(indices, vec![4, 5]);
        assert_eq!(buffer.size(), 4);
    }

    #[tokio::test]
    async fn test_consumer_waits_for_amended_keys() {
        let buffer = Arc::new(SequenceBuffer::new(8, ["gen", "train"]));
        buffer.put_batch(samples(0..2)).await.unwrap();

        let gen = buffer.get_batch_for_rpc("gen", &keys(&["prompts"]), 2).await.unwrap();

        let consumer = {
            let buffer = buffer.clone();
            tokio::spawn(async move {
                buffer
                    .get_batch_for_rpc("train", &keys(&["prompts", "seqs"]), 2)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!consumer.is_finished());

        buffer.amend_batch(&gen.indices, &keys(&["seqs"]));
        let train = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(train.indices, gen.indices);

        // Consumed by every node
        assert_eq!(buffer.size(), 0);
    }

    #[tokio::test]
    async fn test_node_never_takes_a_sample_twice() {
        let buffer = SequenceBuffer::new(8, ["a", "b"]);
        buffer.put_batch(samples(0..3)).await.unwrap();

        let first = buffer.get_batch_for_rpc("a", &keys(&["prompts"]), 2).await.unwrap();
        assert_eq!(first.ids(), vec![0, 1]);
        assert!(buffer.try_take("a", &keys(&["prompts"]), 2).is_none());

        let second = buffer.try_take("a", &keys(&["prompts"]), 1).unwrap();
        assert_eq!(second.ids(), vec![2]);
        // Still waiting for "b"
        assert_eq!(buffer.size(), 3);
    }

    #[tokio::test]
    async fn test_request_larger_than_buffer_rejected() {
        let buffer = SequenceBuffer::new(2, ["a"]);
        assert!(buffer.get_batch_for_rpc("a", &[], 3).await.is_err());
    }
}
