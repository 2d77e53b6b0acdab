//! Worker that fabricates sample metadata instead of running models.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::watch;

use runtime_core::name_resolve;
use runtime_core::system::{
    DataBatchMeta, DataTransferPlan, MfcRequest, SampleId, SampleMeta, DATA_TRANSFER,
};
use runtime_core::transport::{encode, Hook};
use runtime_core::{
    DataflowGraph, Payload, RequestHandler, Result, RuntimeConfig, RuntimeError, WorkerEndpoint,
    WorkerServer,
};

/// Sample ids of data rank `r` start at `r * ID_STRIDE`.
const ID_STRIDE: SampleId = 1 << 32;

struct SyntheticWorker {
    index: usize,
    dataset_keys: Vec<String>,
    batch_size: u64,
    samples_per_epoch: u64,
    /// Next sequence number per data rank.
    cursors: HashMap<usize, u64>,
}

impl SyntheticWorker {
    fn fetch(&mut self, dp_rank: usize) -> DataBatchMeta {
        let cursor = self.cursors.entry(dp_rank).or_insert(0);
        let start = *cursor;
        let end = (start + self.batch_size).min(self.samples_per_epoch);
        let samples = (start..end)
            .map(|seq| SampleMeta::new(dp_rank as SampleId * ID_STRIDE + seq, self.dataset_keys.clone()))
            .collect();
        let is_final_batch = end >= self.samples_per_epoch;
        *cursor = if is_final_batch { 0 } else { end };
        DataBatchMeta {
            dp_rank,
            samples,
            is_final_batch,
        }
    }
}

#[async_trait]
impl RequestHandler for SyntheticWorker {
    async fn handle(&mut self, request: &Payload) -> Result<Option<Vec<u8>>> {
        match request.operation.as_str() {
            "fetch" => {
                let dp_rank = request.handler.data_rank().ok_or_else(|| {
                    RuntimeError::config(format!("fetch sent to non-data handler {}", request.handler))
                })?;
                let batch = self.fetch(dp_rank);
                tracing::debug!(
                    worker = self.index,
                    dp_rank,
                    n_samples = batch.samples.len(),
                    is_final_batch = batch.is_final_batch,
                    "served fetch"
                );
                Ok(Some(encode(&batch)?))
            }
            "flush" | "clear_data_cache" | DATA_TRANSFER => {
                tracing::debug!(worker = self.index, operation = %request.operation, "ok");
                Ok(None)
            }
            operation => {
                let call = request
                    .decode_data::<MfcRequest>()?
                    .ok_or_else(|| RuntimeError::serialization("model function call without data"))?;
                tracing::info!(
                    worker = self.index,
                    handler = %request.handler,
                    interface = operation,
                    node = %call.node,
                    n_seqs = call.ids.len(),
                    outputs = ?call.output_keys,
                    "model function call"
                );
                Ok(None)
            }
        }
    }

    async fn run_hook(&mut self, hook: &Hook, _request: &Payload) -> Result<()> {
        if hook.name == DATA_TRANSFER {
            if let Some(plan) = hook.decode_data::<DataTransferPlan>()? {
                for step in plan.steps_for(self.index) {
                    tracing::debug!(
                        worker = self.index,
                        src = step.src,
                        dst = step.dst,
                        key = %step.key,
                        n_ids = step.ids.len(),
                        "transfer"
                    );
                }
            }
        }
        Ok(())
    }
}

/// Connect worker `index` and serve until Ctrl-C or the coordinator leaves.
pub async fn run_worker(config: RuntimeConfig, index: usize, samples_per_epoch: u64) -> Result<()> {
    let graph = DataflowGraph::build(config.graph.mfcs.clone())?;
    let n_sources = config.graph.data_workers.len().max(1);
    let batch_size = (graph.max_n_seqs() / n_sources).max(1) as u64;

    let resolver = name_resolve::from_config(&config.name_resolve)?;
    let endpoint = WorkerEndpoint::connect(resolver, &config, index).await?;
    tracing::info!(worker = index, batch_size, "worker connected");

    let handler = SyntheticWorker {
        index,
        dataset_keys: graph.dataset_keys(),
        batch_size,
        samples_per_epoch: samples_per_epoch.max(1),
        cursors: HashMap::new(),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                let _ = shutdown_tx.send(true);
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for Ctrl-C");
                // Keep the sender alive so the worker is not shut down
                std::future::pending::<()>().await;
                drop(shutdown_tx);
            }
        }
    });

    match WorkerServer::new(endpoint, handler, shutdown_rx).run().await {
        Ok(_) => Ok(()),
        Err(RuntimeError::Transport { message, .. }) if message.contains("closed") => {
            tracing::info!(worker = index, "coordinator closed the stream");
            Ok(())
        }
        Err(e) => Err(e),
    }
}
