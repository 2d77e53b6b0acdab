//! Runs every node of the dataflow graph for one execution step.
//!
//! A step joins four concurrent activities on the calling task:
//!
//! - one [`ModelFunctionCall`] per node,
//! - the loader, which fetches samples until the largest node can run,
//! - the flush driver, which tells workers to flush once a whole
//!   topological level has been issued,
//! - the drain driver, which clears worker caches once every terminal node
//!   has finished.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use futures::future::try_join_all;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use uuid::Uuid;

use crate::config::{ExecutorConfig, ShardPlacement};
use crate::dfg::DataflowGraph;
use crate::error::{Result, RuntimeError};
use crate::system::buffer::SequenceBuffer;
use crate::system::control::RpcControl;
use crate::system::data::{DataBatchMeta, SampleId, SampleMeta};
use crate::system::function_call::ModelFunctionCall;
use crate::system::redistributor::GlobalStorageTracker;
use crate::transport::{encode, CoordinatorEndpoint, Handler};

/// Where the current step is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepPhase {
    Idle,
    /// Samples are being fetched; nodes may already run.
    Loading,
    Executing,
    /// Terminal nodes finished; caches are being cleared.
    Draining,
    Done,
}

pub struct FunctionExecutor {
    graph: DataflowGraph,
    func_calls: Vec<ModelFunctionCall>,
    stream: Arc<CoordinatorEndpoint>,
    buffer: Arc<SequenceBuffer>,
    tracker: Arc<GlobalStorageTracker>,
    ctrl: Arc<RpcControl>,
    data_handlers: Vec<Handler>,
    shuffle_dataset: bool,
    rng: Mutex<StdRng>,
    load_retry_interval: Duration,
    phase: Mutex<StepPhase>,
    /// Replies to flush and clear broadcasts, collected at the end of a step.
    pending_acks: Mutex<Vec<Uuid>>,
    epoch_finished: AtomicBool,
    steps: AtomicU64,
}

impl FunctionExecutor {
    /// # Errors
    ///
    /// Fails with a `Graph` error if some node has no shard placed, and with
    /// a `Config` error if there is no data source or the buffer cannot hold
    /// the largest node's batch.
    pub fn new(
        graph: DataflowGraph,
        placement: &[ShardPlacement],
        n_data_sources: usize,
        stream: Arc<CoordinatorEndpoint>,
        config: &ExecutorConfig,
    ) -> Result<Self> {
        if n_data_sources == 0 {
            return Err(RuntimeError::config("at least one data source is required"));
        }
        if config.buffer_max_size < graph.max_n_seqs() {
            return Err(RuntimeError::config(format!(
                "buffer_max_size {} is smaller than the largest n_seqs {}",
                config.buffer_max_size,
                graph.max_n_seqs()
            )));
        }

        let buffer = Arc::new(SequenceBuffer::new(
            config.buffer_max_size,
            graph.nodes().iter().map(|n| n.name().to_string()),
        ));
        let tracker = Arc::new(GlobalStorageTracker::new(stream.n_workers()));
        let ctrl = Arc::new(RpcControl::new());

        let func_calls = graph
            .nodes()
            .iter()
            .map(|node| {
                let shards = placement
                    .iter()
                    .filter(|p| p.model_name == node.def.model_name)
                    .map(|p| (p.shard_id(), p.worker))
                    .collect();
                ModelFunctionCall::new(
                    node.clone(),
                    shards,
                    stream.clone(),
                    buffer.clone(),
                    tracker.clone(),
                    ctrl.clone(),
                )
            })
            .collect::<Result<Vec<_>>>()?;

        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Ok(Self {
            graph,
            func_calls,
            stream,
            buffer,
            tracker,
            ctrl,
            data_handlers: (0..n_data_sources).map(Handler::data).collect(),
            shuffle_dataset: config.shuffle_dataset,
            rng: Mutex::new(rng),
            load_retry_interval: config.load_retry_interval(),
            phase: Mutex::new(StepPhase::Idle),
            pending_acks: Mutex::new(Vec::new()),
            epoch_finished: AtomicBool::new(false),
            steps: AtomicU64::new(0),
        })
    }

    pub fn graph(&self) -> &DataflowGraph {
        &self.graph
    }

    pub fn buffer(&self) -> &Arc<SequenceBuffer> {
        &self.buffer
    }

    pub fn tracker(&self) -> &Arc<GlobalStorageTracker> {
        &self.tracker
    }

    pub fn ctrl(&self) -> &Arc<RpcControl> {
        &self.ctrl
    }

    pub fn phase(&self) -> StepPhase {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Completed steps.
    pub fn steps(&self) -> u64 {
        self.steps.load(Ordering::Relaxed)
    }

    fn set_phase(&self, phase: StepPhase) {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner) = phase;
    }

    fn pending_acks(&self) -> MutexGuard<'_, Vec<Uuid>> {
        self.pending_acks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn all_workers(&self) -> Vec<Handler> {
        (0..self.stream.n_workers()).map(Handler::Worker).collect()
    }

    /// Fetch from every data source until the buffer holds enough samples
    /// for the largest node.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateSampleId` if a sample id arrives twice; nothing from
    /// the offending round is inserted.
    pub async fn load_data(&self) -> Result<()> {
        let target = self.graph.max_n_seqs();
        let mut received: HashSet<SampleId> = HashSet::new();

        while self.buffer.size() < target {
            let replies = self
                .stream
                .call_async(&self.data_handlers, "fetch", Vec::new())
                .await?;

            let mut loaded: Vec<(usize, Vec<SampleMeta>)> = Vec::new();
            for (handler, reply) in self.data_handlers.iter().zip(&replies) {
                let Some(meta) = reply.decode_data::<DataBatchMeta>()? else {
                    continue;
                };
                if meta.is_final_batch {
                    self.epoch_finished.store(true, Ordering::Relaxed);
                }
                if meta.samples.is_empty() {
                    continue;
                }
                for sample in &meta.samples {
                    if !received.insert(sample.id) {
                        return Err(RuntimeError::DuplicateSampleId { id: sample.id });
                    }
                }
                loaded.push((self.stream.route_to(handler)?, meta.samples));
            }

            if loaded.is_empty() {
                tokio::time::sleep(self.load_retry_interval).await;
                continue;
            }

            for (worker, samples) in &loaded {
                let mut by_key: BTreeMap<&str, Vec<SampleId>> = BTreeMap::new();
                for sample in samples {
                    for key in &sample.keys {
                        by_key.entry(key.as_str()).or_default().push(sample.id);
                    }
                }
                for (key, ids) in by_key {
                    self.tracker.add_data(*worker, &ids, key, true).await?;
                }
            }

            let mut samples: Vec<SampleMeta> =
                loaded.into_iter().flat_map(|(_, samples)| samples).collect();
            if self.shuffle_dataset {
                samples.shuffle(&mut *self.rng.lock().unwrap_or_else(PoisonError::into_inner));
            }
            let n_loaded = samples.len();
            self.buffer.put_batch(samples).await?;

            tracing::info!(
                n_loaded,
                buffer_size = self.buffer.size(),
                target,
                "loaded samples from data sources"
            );
        }
        Ok(())
    }

    /// Broadcast `flush` once all nodes of each topological level have been
    /// issued, level by level.
    pub async fn flush_calls(&self) -> Result<()> {
        let handlers = self.all_workers();
        for (level, width) in self.graph.topo_widths().into_iter().enumerate() {
            for _ in 0..width {
                self.ctrl.topo_level_count.wait().await?;
            }
            tracing::info!(level, width, "flushing function calls of DFG level");
            let ids = self.stream.request(&handlers, "flush", Vec::new(), true).await?;
            self.pending_acks().extend(ids);
        }
        Ok(())
    }

    /// Wait for every terminal node, then clear the worker caches.
    pub async fn finish_traverse(&self) -> Result<()> {
        for _ in self.graph.leaves() {
            self.ctrl.train_count.wait().await?;
        }
        self.set_phase(StepPhase::Draining);
        self.clear_data_cache().await
    }

    /// Tell every worker to drop the samples finished this step and forget
    /// where they were stored.
    pub async fn clear_data_cache(&self) -> Result<()> {
        let mut state = self.ctrl.state.lock().await;
        let mut ids: Vec<SampleId> = state.ids_to_clear.drain().collect();
        ids.sort_unstable();
        state.used_hash_vals_this_epoch.extend(ids.iter().copied());

        let handlers = self.all_workers();
        let data = encode(&ids)?;
        let datas = vec![Some(data); handlers.len()];
        let request_ids = self
            .stream
            .request(&handlers, "clear_data_cache", datas, true)
            .await?;
        self.tracker.clear_data(&ids).await;
        let n_used = state.used_hash_vals_this_epoch.len();
        drop(state);

        if self.epoch_finished.swap(false, Ordering::Relaxed) {
            tracing::info!(n_used, "dataset epoch finished");
            self.ctrl.reset_epoch().await;
        }

        self.pending_acks().extend(request_ids);
        tracing::debug!(n_cleared = ids.len(), "cleared data cache");
        Ok(())
    }

    /// Run one full pass over the graph.
    pub async fn execute_step(&self) -> Result<()> {
        let start = Instant::now();
        self.set_phase(StepPhase::Loading);

        let run_calls = try_join_all(self.func_calls.iter().map(|fc| fc.run()));
        let load = async {
            self.load_data().await?;
            if self.phase() == StepPhase::Loading {
                self.set_phase(StepPhase::Executing);
            }
            Ok::<_, RuntimeError>(())
        };
        tokio::try_join!(run_calls, self.flush_calls(), load, self.finish_traverse())?;

        let acks = std::mem::take(&mut *self.pending_acks());
        self.stream.gather_async(&acks).await?;

        self.set_phase(StepPhase::Done);
        let step = self.steps.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::info!(
            step,
            elapsed_ms = start.elapsed().as_millis() as u64,
            buffer_size = self.buffer.size(),
            "execution step finished"
        );
        Ok(())
    }
}
