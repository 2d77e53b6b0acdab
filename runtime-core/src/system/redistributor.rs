//! Where each sample's data lives, and how to move it where it is needed.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{Result, RuntimeError};
use crate::system::data::SampleId;

/// One transfer: worker `src` sends `key` of samples `ids` to worker `dst`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedistribStep {
    pub src: usize,
    pub dst: usize,
    pub key: String,
    pub ids: Vec<SampleId>,
}

/// Per-worker record of which sample keys are held, and whether the holder
/// owns them (produced or loaded them) or holds a copy.
#[derive(Debug)]
pub struct GlobalStorageTracker {
    storages: RwLock<Vec<HashMap<SampleId, HashMap<String, bool>>>>,
}

impl GlobalStorageTracker {
    pub fn new(n_workers: usize) -> Self {
        Self {
            storages: RwLock::new(vec![HashMap::new(); n_workers]),
        }
    }

    /// Record that `worker` holds `key` for `ids`. Ownership, once recorded,
    /// is not downgraded by a later copy.
    pub async fn add_data(
        &self,
        worker: usize,
        ids: &[SampleId],
        key: &str,
        is_owner: bool,
    ) -> Result<()> {
        let mut storages = self.storages.write().await;
        let n_workers = storages.len();
        let storage = storages.get_mut(worker).ok_or_else(|| {
            RuntimeError::redistribution(format!(
                "worker {} out of range ({} workers)",
                worker, n_workers
            ))
        })?;
        for &id in ids {
            let owner = storage
                .entry(id)
                .or_default()
                .entry(key.to_string())
                .or_insert(false);
            *owner |= is_owner;
        }
        Ok(())
    }

    /// Forget every record of `ids` on every worker.
    pub async fn clear_data(&self, ids: &[SampleId]) {
        let mut storages = self.storages.write().await;
        for storage in storages.iter_mut() {
            for id in ids {
                storage.remove(id);
            }
        }
    }

    /// `(worker, is_owner)` for each holder of `key` of sample `id`.
    pub async fn holders(&self, id: SampleId, key: &str) -> Vec<(usize, bool)> {
        let storages = self.storages.read().await;
        holders_in(&storages, id, key)
    }

    /// Number of `(worker, sample)` records.
    pub async fn n_records(&self) -> usize {
        self.storages.read().await.iter().map(HashMap::len).sum()
    }
}

fn holders_in(
    storages: &[HashMap<SampleId, HashMap<String, bool>>],
    id: SampleId,
    key: &str,
) -> Vec<(usize, bool)> {
    storages
        .iter()
        .enumerate()
        .filter_map(|(worker, storage)| {
            storage
                .get(&id)
                .and_then(|keys| keys.get(key))
                .map(|&owner| (worker, owner))
        })
        .collect()
}

/// Computes transfers from the tracker's current state.
#[derive(Debug, Clone)]
pub struct RedistribPlanner {
    tracker: Arc<GlobalStorageTracker>,
}

impl RedistribPlanner {
    pub fn new(tracker: Arc<GlobalStorageTracker>) -> Self {
        Self { tracker }
    }

    /// Steps that bring every key of every sample to every destination that
    /// lacks it. Steps are grouped by destination.
    ///
    /// # Errors
    ///
    /// Returns a `Redistribution` error if some sample key is held nowhere.
    pub async fn plan(
        &self,
        dests: &[usize],
        keys: &[String],
        ids: &[SampleId],
    ) -> Result<Vec<RedistribStep>> {
        let dests: BTreeSet<usize> = dests.iter().copied().collect();
        let storages = self.tracker.storages.read().await;

        let mut grouped: BTreeMap<(usize, usize, &str), Vec<SampleId>> = BTreeMap::new();
        for key in keys {
            for &id in ids {
                let holders = holders_in(&storages, id, key);
                let src = holders
                    .iter()
                    .find(|(_, owner)| *owner)
                    .or_else(|| holders.first())
                    .map(|&(worker, _)| worker)
                    .ok_or_else(|| {
                        RuntimeError::redistribution(format!(
                            "no worker holds key '{}' of sample {}",
                            key, id
                        ))
                    })?;

                for &dst in &dests {
                    if holders.iter().any(|&(w, _)| w == dst) {
                        continue;
                    }
                    grouped.entry((dst, src, key.as_str())).or_default().push(id);
                }
            }
        }

        Ok(grouped
            .into_iter()
            .map(|((dst, src, key), ids)| RedistribStep {
                src,
                dst,
                key: key.to_string(),
                ids,
            })
            .collect())
    }
}
