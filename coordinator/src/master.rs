use std::sync::Arc;
use std::time::Instant;

use runtime_core::config::NameResolveBackend;
use runtime_core::name_resolve::{self, names};
use runtime_core::{CoordinatorEndpoint, DataflowGraph, FunctionExecutor, Result, RuntimeConfig};

/// Bind the request-reply stream, wait for every worker and execute
/// `steps` graph steps.
pub async fn run_master(config: RuntimeConfig, steps: u64) -> Result<()> {
    if config.name_resolve.backend == NameResolveBackend::Memory {
        tracing::warn!("memory name-resolve backend only reaches workers in this process");
    }
    let resolver = name_resolve::from_config(&config.name_resolve)?;
    let exp = &config.experiment;
    resolver
        .clear_subtree(&names::trial_root(&exp.experiment_name, &exp.trial_name))
        .await?;

    let graph = DataflowGraph::build(config.graph.mfcs.clone())?;
    let n_workers = config.graph.n_workers();
    tracing::info!(
        experiment = %exp.experiment_name,
        trial = %exp.trial_name,
        n_nodes = graph.len(),
        n_workers,
        "waiting for workers"
    );

    let stream = Arc::new(
        CoordinatorEndpoint::bind(resolver, &config, n_workers, config.graph.routing()).await?,
    );
    let executor = FunctionExecutor::new(
        graph,
        &config.graph.shards,
        config.graph.data_workers.len(),
        stream.clone(),
        &config.executor,
    )?;

    for step in 0..steps {
        let start = Instant::now();
        executor.execute_step().await?;
        tracing::info!(
            step,
            buffered = executor.buffer().size(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "step finished"
        );
    }

    drop(executor);
    match Arc::try_unwrap(stream) {
        Ok(stream) => stream.close().await,
        Err(_) => {
            tracing::warn!("stream still shared at shutdown, leaving addresses to expire");
            Ok(())
        }
    }
}
