//! Real endpoints on loopback with scripted workers.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::try_join_all;
use tokio::sync::watch;

use crate::config::RuntimeConfig;
use crate::error::Result;
use crate::name_resolve::{MemoryNameResolver, NameResolver};
use crate::system::data::{DataBatchMeta, MfcRequest, SampleId, SampleMeta};
use crate::system::worker::{RequestHandler, WorkerServer};
use crate::transport::{encode, CoordinatorEndpoint, Handler, Hook, Payload, WorkerEndpoint};

#[derive(Debug, Clone)]
pub(crate) struct Event {
    pub worker: usize,
    pub operation: String,
    pub ids: Option<Vec<SampleId>>,
}

type EventLog = Arc<Mutex<Vec<Event>>>;

/// Serves `fetch` from scripted batches and accepts everything else.
struct MockWorker {
    index: usize,
    /// Remaining batches per data-parallel rank.
    datasets: HashMap<usize, VecDeque<Vec<SampleMeta>>>,
    log: EventLog,
}

impl MockWorker {
    fn record(&self, operation: impl Into<String>, ids: Option<Vec<SampleId>>) {
        self.log.lock().unwrap().push(Event {
            worker: self.index,
            operation: operation.into(),
            ids,
        });
    }
}

#[async_trait]
impl RequestHandler for MockWorker {
    async fn handle(&mut self, request: &Payload) -> Result<Option<Vec<u8>>> {
        match request.operation.as_str() {
            "fetch" => {
                self.record("fetch", None);
                let Some(dp_rank) = request.handler.data_rank() else {
                    return Ok(None);
                };
                match self.datasets.get_mut(&dp_rank).and_then(VecDeque::pop_front) {
                    Some(samples) => Ok(Some(encode(&DataBatchMeta {
                        dp_rank,
                        samples,
                        is_final_batch: false,
                    })?)),
                    None => Ok(None),
                }
            }
            "clear_data_cache" => {
                let ids = request.decode_data::<Vec<SampleId>>()?;
                self.record("clear_data_cache", ids);
                Ok(None)
            }
            "flush" | "data_transfer" => {
                self.record(request.operation.as_str(), None);
                Ok(None)
            }
            operation => {
                let ids = request.decode_data::<MfcRequest>()?.map(|r| r.ids);
                self.record(operation, ids);
                Ok(None)
            }
        }
    }

    async fn run_hook(&mut self, hook: &Hook, _request: &Payload) -> Result<()> {
        self.record(format!("hook:{}", hook.name), None);
        Ok(())
    }
}

pub(crate) struct MockCluster {
    pub stream: Arc<CoordinatorEndpoint>,
    log: EventLog,
    _shutdown: watch::Sender<bool>,
}

impl MockCluster {
    /// Requests with `operation` seen by any worker.
    pub fn count(&self, operation: &str) -> usize {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.operation == operation)
            .count()
    }

    /// Sample ids of each `operation` request seen by `worker`, in order.
    pub fn ids_seen(&self, worker: usize, operation: &str) -> Vec<Vec<SampleId>> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.worker == worker && e.operation == operation)
            .filter_map(|e| e.ids.clone())
            .collect()
    }
}

pub(crate) fn test_config() -> RuntimeConfig {
    let mut config = RuntimeConfig::default();
    config.transport.bind_host = Some("127.0.0.1".to_string());
    config.transport.peer_wait_timeout_secs = 5;
    config.transport.barrier_poll_interval_ms = 5;
    config.transport.async_poll_interval_ms = 1;
    config
}

/// Start `n_workers` mock workers. `datasets[r]` lists the batches data
/// source `r` returns, one per `fetch`.
pub(crate) async fn start_cluster(
    n_workers: usize,
    routing: HashMap<Handler, usize>,
    datasets: Vec<Vec<Vec<SampleMeta>>>,
) -> MockCluster {
    let resolver: Arc<dyn NameResolver> = Arc::new(MemoryNameResolver::new());
    let config = test_config();

    let workers = (0..n_workers).map(|i| {
        let resolver = resolver.clone();
        let config = config.clone();
        async move { WorkerEndpoint::connect(resolver, &config, i).await }
    });
    let (stream, workers) = tokio::join!(
        CoordinatorEndpoint::bind(resolver.clone(), &config, n_workers, routing),
        try_join_all(workers),
    );
    let stream = Arc::new(stream.unwrap());

    let datasets: HashMap<usize, VecDeque<Vec<SampleMeta>>> = datasets
        .into_iter()
        .enumerate()
        .map(|(rank, batches)| (rank, batches.into_iter().collect()))
        .collect();
    let log: EventLog = Arc::new(Mutex::new(Vec::new()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    for (index, endpoint) in workers.unwrap().into_iter().enumerate() {
        let handler = MockWorker {
            index,
            datasets: datasets.clone(),
            log: log.clone(),
        };
        let server = WorkerServer::new(endpoint, handler, shutdown_rx.clone());
        tokio::spawn(server.run());
    }

    MockCluster {
        stream,
        log,
        _shutdown: shutdown_tx,
    }
}

/// Poll `condition` until it holds. Panics after two seconds.
pub(crate) async fn wait_until(condition: impl Fn() -> bool) {
    let start = Instant::now();
    while !condition() {
        assert!(start.elapsed() < Duration::from_secs(2), "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
