//! Shared state coordinating the concurrent parts of one execution step.

use std::collections::HashSet;

use tokio::sync::{Mutex, Semaphore};

use crate::error::{Result, RuntimeError};
use crate::system::data::SampleId;

/// Counting signal: every `signal` releases exactly one `wait`.
#[derive(Debug)]
pub struct CompletionCounter {
    permits: Semaphore,
}

impl CompletionCounter {
    pub fn new() -> Self {
        Self {
            permits: Semaphore::new(0),
        }
    }

    pub fn signal(&self) {
        self.permits.add_permits(1);
    }

    /// Wait for, and consume, one signal.
    pub async fn wait(&self) -> Result<()> {
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| RuntimeError::graph("completion counter closed"))?;
        permit.forget();
        Ok(())
    }

    /// Signals not yet consumed.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

impl Default for CompletionCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
pub struct ControlState {
    /// Samples whose terminal nodes have finished this step.
    pub ids_to_clear: HashSet<SampleId>,
    /// Samples cleared since the dataset epoch began.
    pub used_hash_vals_this_epoch: HashSet<SampleId>,
}

#[derive(Debug, Default)]
pub struct RpcControl {
    pub state: Mutex<ControlState>,
    /// One signal per node whose requests have been issued.
    pub topo_level_count: CompletionCounter,
    /// One signal per terminal node that finished.
    pub train_count: CompletionCounter,
}

impl RpcControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget the samples used in the finished epoch.
    pub async fn reset_epoch(&self) {
        self.state.lock().await.used_hash_vals_this_epoch.clear();
    }
}
