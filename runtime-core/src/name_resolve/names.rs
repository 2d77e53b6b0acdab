//! Key layout of the name-resolve tree.

pub const USER_NAMESPACE: &str = "dtr";

/// Subentries under this key count connected workers.
pub const PUBSUB_BARRIER: &str = "__pubsub_barrier__";

/// Address of the coordinator's inbound channel.
pub const MASTER_RECV: &str = "master_recv";

/// Address of the coordinator's outbound channel to worker `index`.
pub fn master_send(index: usize) -> String {
    format!("master_send_{}", index)
}

pub fn trial_root(experiment: &str, trial: &str) -> String {
    format!("{}/{}/{}", USER_NAMESPACE, experiment, trial)
}

pub fn request_reply_stream_root(experiment: &str, trial: &str) -> String {
    format!("{}/request_reply_stream", trial_root(experiment, trial))
}

pub fn request_reply_stream(experiment: &str, trial: &str, stream: &str) -> String {
    format!("{}/{}", request_reply_stream_root(experiment, trial), stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        assert_eq!(
            request_reply_stream("ppo", "t0", &master_send(3)),
            "dtr/ppo/t0/request_reply_stream/master_send_3"
        );
        assert!(crate::name_resolve::in_subtree(
            &request_reply_stream("ppo", "t0", PUBSUB_BARRIER),
            &trial_root("ppo", "t0"),
        ));
    }
}
