//! Worker side of the request-reply stream.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::codec;
use super::net;
use super::payload::Payload;
use crate::config::RuntimeConfig;
use crate::error::{Result, RuntimeError};
use crate::name_resolve::{names, NameResolver};

const ADDRESS_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A worker's connection to the coordinator.
pub struct WorkerEndpoint {
    index: usize,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    inbound: mpsc::UnboundedReceiver<Result<Payload>>,
    /// Requests that arrived while waiting for an ack.
    pending: VecDeque<Payload>,
    max_frame_bytes: usize,
    tasks: Vec<JoinHandle<()>>,
}

impl WorkerEndpoint {
    /// Look up the coordinator's addresses, connect, and register with the
    /// barrier.
    ///
    /// Fails with [`RuntimeError::TimeoutWaitingForPeer`] if the coordinator
    /// does not publish its addresses within the configured timeout.
    pub async fn connect(
        resolver: Arc<dyn NameResolver>,
        config: &RuntimeConfig,
        index: usize,
    ) -> Result<Self> {
        let experiment = &config.experiment;
        let transport = &config.transport;
        let stream = |name: &str| {
            names::request_reply_stream(&experiment.experiment_name, &experiment.trial_name, name)
        };
        let timeout = Some(transport.peer_wait_timeout());
        let poll_interval = transport.barrier_poll_interval().min(ADDRESS_POLL_INTERVAL);

        let recv_address = resolver
            .wait(&stream(names::MASTER_RECV), timeout, poll_interval)
            .await
            .map_err(|e| {
                tracing::error!(worker = index, "timed out waiting for the coordinator's receive channel");
                e
            })?;
        let send_address = resolver
            .wait(&stream(&names::master_send(index)), timeout, poll_interval)
            .await
            .map_err(|e| {
                tracing::error!(worker = index, "timed out waiting for the coordinator's send channel");
                e
            })?;

        let downstream = connect_to(&send_address).await?;
        let upstream = connect_to(&recv_address).await?;

        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let max_frame_bytes = transport.max_frame_bytes;
        let tasks = vec![
            tokio::spawn(read_downstream(downstream, in_tx, max_frame_bytes, index)),
            tokio::spawn(write_upstream(upstream, out_rx, index)),
        ];

        let host = net::host_ip(transport).await?;
        resolver
            .add_subentry(
                &stream(names::PUBSUB_BARRIER),
                &host,
                Some(transport.barrier_ttl()),
            )
            .await?;

        tracing::info!(worker = index, %recv_address, %send_address, "connected to coordinator");
        Ok(Self {
            index,
            outbound: out_tx,
            inbound: in_rx,
            pending: VecDeque::new(),
            max_frame_bytes,
            tasks,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Send a payload to the coordinator.
    pub fn post(&self, mut payload: Payload) -> Result<Uuid> {
        payload.send_time = Some(chrono::Utc::now());
        let frame = codec::encode_frame(&payload, self.max_frame_bytes)?;
        self.outbound
            .send(frame)
            .map_err(|_| RuntimeError::transport("channel to coordinator is closed"))?;
        Ok(payload.request_id)
    }

    /// Reply to `request` with `data`.
    pub fn reply(&self, request: &Payload, data: Option<Vec<u8>>) -> Result<Uuid> {
        self.post(Payload::reply_to(request).with_raw_data(data))
    }

    /// Next request from the coordinator.
    pub async fn poll(&mut self, block: bool) -> Result<Payload> {
        if let Some(payload) = self.pending.pop_front() {
            return Ok(payload);
        }
        if block {
            match self.inbound.recv().await {
                Some(result) => result,
                None => Err(RuntimeError::transport("connection to coordinator closed")),
            }
        } else {
            match self.inbound.try_recv() {
                Ok(result) => result,
                Err(TryRecvError::Empty) => Err(RuntimeError::NoMessageYet),
                Err(TryRecvError::Disconnected) => {
                    Err(RuntimeError::transport("connection to coordinator closed"))
                }
            }
        }
    }

    /// Complete the handshake for `request`: send its syn and wait for the
    /// matching ack. No-op for requests sent with `no_sync`.
    pub async fn acknowledge(&mut self, request: &Payload) -> Result<()> {
        if request.no_sync {
            return Ok(());
        }
        self.post(Payload::new(request.handler.clone(), "syn").with_request_id(request.syn_reply_id))?;

        loop {
            let payload = match self.inbound.recv().await {
                Some(result) => result?,
                None => return Err(RuntimeError::transport("connection to coordinator closed")),
            };
            if payload.request_id == request.ack_reply_id {
                return Ok(());
            }
            self.pending.push_back(payload);
        }
    }
}

impl Drop for WorkerEndpoint {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn connect_to(address: &str) -> Result<TcpStream> {
    let stream = TcpStream::connect(address).await.map_err(|e| {
        RuntimeError::transport_with_source(format!("failed to connect to {}", address), e)
    })?;
    if let Err(e) = stream.set_nodelay(true) {
        tracing::warn!(address, error = %e, "failed to set TCP_NODELAY");
    }
    Ok(stream)
}

async fn read_downstream(
    mut stream: TcpStream,
    tx: mpsc::UnboundedSender<Result<Payload>>,
    max_frame_bytes: usize,
    index: usize,
) {
    loop {
        match codec::read_frame(&mut stream, max_frame_bytes).await {
            Ok(Some(payload)) => {
                if tx.send(Ok(payload)).is_err() {
                    return;
                }
            }
            Ok(None) => {
                tracing::debug!(worker = index, "coordinator closed the channel");
                return;
            }
            Err(e) => {
                tracing::error!(worker = index, error = %e, "downstream channel failed");
                let _ = tx.send(Err(e));
                return;
            }
        }
    }
}

async fn write_upstream(
    mut stream: TcpStream,
    mut frames: mpsc::UnboundedReceiver<Vec<u8>>,
    index: usize,
) {
    while let Some(frame) = frames.recv().await {
        if let Err(e) = codec::write_frame(&mut stream, &frame).await {
            tracing::error!(worker = index, error = %e, "upstream channel failed");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::name_resolve::MemoryNameResolver;

    #[tokio::test]
    async fn test_times_out_without_coordinator() {
        let resolver: Arc<dyn NameResolver> = Arc::new(MemoryNameResolver::new());
        let mut config = RuntimeConfig::default();
        config.transport.peer_wait_timeout_secs = 1;
        config.transport.barrier_poll_interval_ms = 10;

        let err = WorkerEndpoint::connect(resolver, &config, 0)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RuntimeError::TimeoutWaitingForPeer { .. }));
    }
}
