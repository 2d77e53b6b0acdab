//! Drives one graph node through one execution step.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use crate::dfg::MfcNode;
use crate::error::{Result, RuntimeError};
use crate::system::buffer::SequenceBuffer;
use crate::system::control::RpcControl;
use crate::system::data::{DataTransferPlan, MfcRequest, SampleId};
use crate::system::redistributor::{GlobalStorageTracker, RedistribPlanner};
use crate::transport::{CoordinatorEndpoint, Handler, Hook, Payload, ShardId};

/// Name of the pre-hook carrying the redistribution plan, and of the
/// standalone request sent to source-only workers.
pub const DATA_TRANSFER: &str = "data_transfer";

pub struct ModelFunctionCall {
    node: MfcNode,
    /// `(shard, worker)`, sorted by shard.
    shards: Vec<(ShardId, usize)>,
    dp_size: usize,
    stream: Arc<CoordinatorEndpoint>,
    buffer: Arc<SequenceBuffer>,
    tracker: Arc<GlobalStorageTracker>,
    planner: RedistribPlanner,
    ctrl: Arc<RpcControl>,
}

impl ModelFunctionCall {
    /// # Errors
    ///
    /// Fails if `shards` is empty or its data-parallel ranks are not
    /// `0..dp_size`.
    pub fn new(
        node: MfcNode,
        mut shards: Vec<(ShardId, usize)>,
        stream: Arc<CoordinatorEndpoint>,
        buffer: Arc<SequenceBuffer>,
        tracker: Arc<GlobalStorageTracker>,
        ctrl: Arc<RpcControl>,
    ) -> Result<Self> {
        if shards.is_empty() {
            return Err(RuntimeError::graph(format!(
                "node '{}' has no shards of model '{}' assigned",
                node.name(),
                node.def.model_name
            )));
        }
        shards.sort();

        let dp_ranks: BTreeSet<u32> = shards.iter().map(|(s, _)| s.dp_rank).collect();
        let dp_size = dp_ranks.len();
        if dp_ranks.iter().copied().ne(0..dp_size as u32) {
            return Err(RuntimeError::graph(format!(
                "model '{}' has non-contiguous data-parallel ranks {:?}",
                node.def.model_name, dp_ranks
            )));
        }

        Ok(Self {
            node,
            shards,
            dp_size,
            stream,
            buffer,
            planner: RedistribPlanner::new(tracker.clone()),
            tracker,
            ctrl,
        })
    }

    pub fn node(&self) -> &MfcNode {
        &self.node
    }

    /// Workers hosting a shard of data-parallel rank `dp_rank`.
    fn workers_of_dp(&self, dp_rank: usize) -> Vec<usize> {
        let workers: BTreeSet<usize> = self
            .shards
            .iter()
            .filter(|(s, _)| s.dp_rank as usize == dp_rank)
            .map(|&(_, w)| w)
            .collect();
        workers.into_iter().collect()
    }

    /// Execute the node once: take a batch, move its inputs into place,
    /// call every shard and record what they produced.
    pub async fn run(&self) -> Result<()> {
        let def = &self.node.def;
        let batch = self
            .buffer
            .get_batch_for_rpc(&def.name, &def.input_keys, def.n_seqs)
            .await?;
        let start = Instant::now();
        let ids = batch.ids();
        let chunks = split_ids(&ids, self.dp_size);

        let mut plan = DataTransferPlan::default();
        for (dp_rank, chunk) in chunks.iter().enumerate() {
            let dests = self.workers_of_dp(dp_rank);
            let steps = self.planner.plan(&dests, &def.input_keys, chunk).await?;
            for step in &steps {
                self.tracker
                    .add_data(step.dst, &step.ids, &step.key, false)
                    .await?;
            }
            plan.steps.extend(steps);
        }

        let transfer_hook = Hook::new(DATA_TRANSFER).with_data(&plan)?;
        let mut payloads = Vec::with_capacity(self.shards.len());
        for (shard, _) in &self.shards {
            let request = MfcRequest {
                node: def.name.clone(),
                ids: chunks[shard.dp_rank as usize].clone(),
                input_keys: def.input_keys.clone(),
                output_keys: def.output_keys.clone(),
            };
            payloads.push(
                Payload::new(shard.clone(), def.interface.as_str())
                    .with_data(&request)?
                    .with_pre_hook(transfer_hook.clone()),
            );
        }

        // Sources outside this node's workers must take part in the transfer
        let node_workers: BTreeSet<usize> = self.shards.iter().map(|&(_, w)| w).collect();
        let extra_sources: BTreeSet<usize> = plan
            .steps
            .iter()
            .map(|s| s.src)
            .filter(|src| !node_workers.contains(src))
            .collect();
        for src in extra_sources {
            payloads.push(Payload::new(Handler::Worker(src), DATA_TRANSFER).with_data(&plan)?);
        }

        tracing::debug!(
            node = %def.name,
            n_seqs = ids.len(),
            n_requests = payloads.len(),
            n_transfers = plan.steps.len(),
            "issuing model function call"
        );
        let request_ids = self.stream.request_payloads(payloads, true).await?;
        self.ctrl.topo_level_count.signal();

        self.stream.gather_async(&request_ids).await?;

        for (dp_rank, chunk) in chunks.iter().enumerate() {
            for worker in self.workers_of_dp(dp_rank) {
                for key in &def.output_keys {
                    self.tracker.add_data(worker, chunk, key, true).await?;
                }
            }
        }
        self.buffer.amend_batch(&batch.indices, &def.output_keys);

        if self.node.is_dst() {
            self.ctrl.state.lock().await.ids_to_clear.extend(ids.iter().copied());
            self.ctrl.train_count.signal();
        }

        tracing::info!(
            node = %def.name,
            interface = %def.interface,
            n_seqs = ids.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "model function call finished"
        );
        Ok(())
    }
}

/// Split `ids` into `n` contiguous chunks whose sizes differ by at most one.
pub fn split_ids(ids: &[SampleId], n: usize) -> Vec<Vec<SampleId>> {
    let n = n.max(1);
    let base = ids.len() / n;
    let extra = ids.len() % n;
    let mut chunks = Vec::with_capacity(n);
    let mut offset = 0;
    for i in 0..n {
        let len = base + usize::from(i < extra);
        chunks.push(ids[offset..offset + len].to_vec());
        offset += len;
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_ids() {
        assert_eq!(split_ids(&[1, 2, 3, 4, 5], 2), vec![vec![1, 2, 3], vec![4, 5]]);
        assert_eq!(split_ids(&[1, 2], 3), vec![vec![1], vec![2], vec![]]);
        assert_eq!(split_ids(&[1, 2, 3], 1), vec![vec![1, 2, 3]]);
        assert_eq!(split_ids(&[], 2), vec![Vec::<SampleId>::new(), vec![]]);
    }
}
