//! Coordinator side of the request-reply stream.
//!
//! The coordinator owns one outbound channel per worker and a single inbound
//! channel shared by all workers. Replies are matched to requests by request
//! id; replies nobody is polling for yet wait in a [`ResponseBuffer`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::try_join_all;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::task::{JoinHandle, JoinSet};
use uuid::Uuid;

use super::buffer::ResponseBuffer;
use super::codec;
use super::net;
use super::payload::{Handler, Payload, ReplyPattern};
use crate::config::RuntimeConfig;
use crate::error::{Result, RuntimeError};
use crate::name_resolve::{names, NameResolver};
use crate::retry::{retry_async, RetryConfig, RetryResult};

struct Inbox {
    receiver: mpsc::UnboundedReceiver<Result<Payload>>,
    buffer: ResponseBuffer,
}

/// The coordinator's request-reply endpoint.
pub struct CoordinatorEndpoint {
    stream_root: String,
    n_workers: usize,
    routing: HashMap<Handler, usize>,
    outbound: Vec<mpsc::UnboundedSender<Vec<u8>>>,
    inbox: Mutex<Inbox>,
    recv_address: SocketAddr,
    max_frame_bytes: usize,
    poll_retry: RetryConfig,
    async_poll_interval: Duration,
    resolver: Arc<dyn NameResolver>,
    published: Vec<String>,
    tasks: Vec<JoinHandle<()>>,
}

impl CoordinatorEndpoint {
    /// Open channels for `n_workers` workers, publish their addresses and
    /// wait until every worker has joined the barrier.
    ///
    /// `routing` maps shard and named handlers to worker indices.
    pub async fn bind(
        resolver: Arc<dyn NameResolver>,
        config: &RuntimeConfig,
        n_workers: usize,
        routing: HashMap<Handler, usize>,
    ) -> Result<Self> {
        if let Some((handler, &index)) = routing.iter().find(|(_, &i)| i >= n_workers) {
            return Err(RuntimeError::config(format!(
                "handler {} routed to worker {} but only {} workers exist",
                handler, index, n_workers
            )));
        }

        let experiment = &config.experiment;
        let transport = &config.transport;
        let stream_root =
            names::request_reply_stream_root(&experiment.experiment_name, &experiment.trial_name);
        let host = net::host_ip(transport).await?;

        let mut endpoint = Self {
            stream_root,
            n_workers,
            routing,
            outbound: Vec::with_capacity(n_workers),
            inbox: Mutex::new(Inbox {
                // Replaced once the inbound listener is up
                receiver: mpsc::unbounded_channel().1,
                buffer: ResponseBuffer::new(),
            }),
            recv_address: SocketAddr::from(([127, 0, 0, 1], 0)),
            max_frame_bytes: transport.max_frame_bytes,
            poll_retry: RetryConfig::from(transport),
            async_poll_interval: transport.async_poll_interval(),
            resolver,
            published: Vec::new(),
            tasks: Vec::new(),
        };

        for index in 0..n_workers {
            let listener = bind_listener(&host).await?;
            let address = local_address(&listener)?;
            let (tx, rx) = mpsc::unbounded_channel();
            endpoint.outbound.push(tx);
            endpoint
                .tasks
                .push(tokio::spawn(serve_outbound(listener, rx, index)));
            endpoint
                .publish(&names::master_send(index), &address.to_string())
                .await?;
        }

        let listener = bind_listener(&host).await?;
        endpoint.recv_address = local_address(&listener)?;
        let (tx, rx) = mpsc::unbounded_channel();
        endpoint.inbox_lock().receiver = rx;
        endpoint.tasks.push(tokio::spawn(accept_inbound(
            listener,
            tx,
            endpoint.max_frame_bytes,
        )));
        let recv_address = endpoint.recv_address.to_string();
        endpoint.publish(names::MASTER_RECV, &recv_address).await?;

        endpoint.wait_for_workers(transport.barrier_poll_interval()).await?;
        Ok(endpoint)
    }

    async fn publish(&mut self, stream: &str, address: &str) -> Result<()> {
        let key = format!("{}/{}", self.stream_root, stream);
        self.resolver.add(&key, address, None, false).await?;
        tracing::debug!(key = %key, address, "published stream address");
        self.published.push(key);
        Ok(())
    }

    async fn wait_for_workers(&self, poll_interval: Duration) -> Result<()> {
        let barrier = format!("{}/{}", self.stream_root, names::PUBSUB_BARRIER);
        let start = Instant::now();
        loop {
            let joined = self.resolver.get_subtree(&barrier).await?.len();
            if joined >= self.n_workers {
                tracing::info!(
                    n_workers = self.n_workers,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "all workers connected to the request-reply stream"
                );
                return Ok(());
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    fn inbox_lock(&self) -> MutexGuard<'_, Inbox> {
        self.inbox.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn n_workers(&self) -> usize {
        self.n_workers
    }

    /// Address of the shared inbound channel.
    pub fn recv_address(&self) -> SocketAddr {
        self.recv_address
    }

    /// Number of replies received but not yet claimed.
    pub fn pending_replies(&self) -> usize {
        self.inbox_lock().buffer.len()
    }

    /// Worker index a handler is delivered to.
    pub fn route_to(&self, handler: &Handler) -> Result<usize> {
        match handler {
            Handler::Worker(index) if *index < self.n_workers => Ok(*index),
            Handler::Worker(index) => Err(RuntimeError::transport(format!(
                "worker index {} out of range ({} workers)",
                index, self.n_workers
            ))),
            other => self
                .routing
                .get(other)
                .copied()
                .ok_or_else(|| RuntimeError::transport(format!("no route for handler {}", other))),
        }
    }

    /// Send one payload without waiting. Returns its request id.
    pub fn post(&self, mut payload: Payload) -> Result<Uuid> {
        let index = self.route_to(&payload.handler)?;
        payload.send_time = Some(Utc::now());
        let frame = codec::encode_frame(&payload, self.max_frame_bytes)?;
        self.outbound[index].send(frame).map_err(|_| {
            RuntimeError::transport(format!("outbound channel to worker {} is closed", index))
        })?;
        Ok(payload.request_id)
    }

    /// Send one request per handler. `datas` is either empty or holds one
    /// entry per handler.
    ///
    /// Unless `no_sync` is set, returns only after every handler has received
    /// its request and been acknowledged.
    pub async fn request(
        &self,
        handlers: &[Handler],
        operation: &str,
        datas: Vec<Option<Vec<u8>>>,
        no_sync: bool,
    ) -> Result<Vec<Uuid>> {
        if !datas.is_empty() && datas.len() != handlers.len() {
            return Err(RuntimeError::transport(format!(
                "{} handlers but {} data entries for '{}'",
                handlers.len(),
                datas.len(),
                operation
            )));
        }
        let mut datas = datas.into_iter();
        let payloads = handlers
            .iter()
            .map(|h| Payload::new(h.clone(), operation).with_raw_data(datas.next().flatten()))
            .collect();
        self.request_payloads(payloads, no_sync).await
    }

    /// Like [`request`](Self::request) for fully built payloads.
    pub async fn request_payloads(
        &self,
        mut payloads: Vec<Payload>,
        no_sync: bool,
    ) -> Result<Vec<Uuid>> {
        let Some(first) = payloads.first() else {
            return Ok(Vec::new());
        };
        let operation = first.operation.clone();
        let start = Instant::now();

        for p in &mut payloads {
            p.no_sync = no_sync;
        }
        let handshakes: Vec<(Handler, Uuid, Uuid)> = payloads
            .iter()
            .map(|p| (p.handler.clone(), p.syn_reply_id, p.ack_reply_id))
            .collect();

        let mut request_ids = Vec::with_capacity(payloads.len());
        for payload in payloads {
            request_ids.push(self.post(payload)?);
        }

        if !no_sync {
            for (_, syn_id, _) in &handshakes {
                self.poll(&ReplyPattern::exact([*syn_id]), true).await?;
            }
            for (handler, _, ack_id) in handshakes {
                self.post(Payload::new(handler, "ack").with_request_id(ack_id))?;
            }
        }

        tracing::debug!(
            operation = %operation,
            n_requests = request_ids.len(),
            no_sync,
            elapsed_us = start.elapsed().as_micros() as u64,
            "posted requests"
        );
        Ok(request_ids)
    }

    /// Scan the buffer, then drain the inbound channel one message at a time
    /// until something matches. With `first_only`, only the earliest match
    /// is taken and later ones keep their place in the buffer.
    fn poll_nonblock(&self, pattern: &ReplyPattern, first_only: bool) -> Result<Vec<Payload>> {
        let mut inbox = self.inbox_lock();
        let take = |buffer: &mut ResponseBuffer| -> Vec<Payload> {
            if first_only {
                buffer.take_first_matching(pattern).into_iter().collect()
            } else {
                buffer.take_matching(pattern)
            }
        };

        let matched = take(&mut inbox.buffer);
        if !matched.is_empty() {
            return Ok(matched);
        }

        loop {
            match inbox.receiver.try_recv() {
                Ok(Ok(payload)) => {
                    let hit = pattern.matches(&payload.request_id);
                    inbox.buffer.insert(payload);
                    if hit {
                        return Ok(take(&mut inbox.buffer));
                    }
                }
                Ok(Err(e)) => return Err(e),
                Err(TryRecvError::Empty) => return Err(RuntimeError::NoMessageYet),
                Err(TryRecvError::Disconnected) => {
                    return Err(RuntimeError::transport("inbound channel closed"))
                }
            }
        }
    }

    async fn poll_matching(
        &self,
        pattern: &ReplyPattern,
        block: bool,
        first_only: bool,
    ) -> Result<Vec<Payload>> {
        if !block {
            return self.poll_nonblock(pattern, first_only);
        }
        retry_async(&self.poll_retry, move || async move {
            match self.poll_nonblock(pattern, first_only) {
                Ok(batch) => RetryResult::Ok(batch),
                Err(e) if e.is_no_message() => RetryResult::Retry,
                Err(e) => RetryResult::Fail(e),
            }
        })
        .await
    }

    /// All currently available replies matching `pattern`, in arrival order.
    ///
    /// A non-blocking call fails with [`RuntimeError::NoMessageYet`] when
    /// nothing matches. A blocking call retries with backoff.
    pub async fn poll_batch(&self, pattern: &ReplyPattern, block: bool) -> Result<Vec<Payload>> {
        self.poll_matching(pattern, block, false).await
    }

    /// The earliest reply matching `pattern`. Further matches stay buffered.
    pub async fn poll(&self, pattern: &ReplyPattern, block: bool) -> Result<Payload> {
        self.poll_matching(pattern, block, true)
            .await?
            .into_iter()
            .next()
            .ok_or(RuntimeError::NoMessageYet)
    }

    /// Poll without blocking the task, sleeping a fixed interval between
    /// attempts so concurrent pollers make progress.
    pub async fn poll_async(&self, pattern: &ReplyPattern) -> Result<Payload> {
        loop {
            match self.poll(pattern, false).await {
                Err(e) if e.is_no_message() => {
                    tokio::time::sleep(self.async_poll_interval).await;
                }
                other => return other,
            }
        }
    }

    /// Replies to `request_ids`, in request order. Worker-reported failures
    /// become errors.
    pub async fn gather(&self, request_ids: &[Uuid]) -> Result<Vec<Payload>> {
        let mut replies = Vec::with_capacity(request_ids.len());
        for id in request_ids {
            replies.push(self.poll(&ReplyPattern::exact([*id]), true).await?.into_result()?);
        }
        Ok(replies)
    }

    /// Concurrent form of [`gather`](Self::gather).
    pub async fn gather_async(&self, request_ids: &[Uuid]) -> Result<Vec<Payload>> {
        let replies = try_join_all(request_ids.iter().map(|id| {
            let pattern = ReplyPattern::exact([*id]);
            async move { self.poll_async(&pattern).await }
        }))
        .await?;
        replies.into_iter().map(Payload::into_result).collect()
    }

    /// Request without handshake, then gather.
    pub async fn call(
        &self,
        handlers: &[Handler],
        operation: &str,
        datas: Vec<Option<Vec<u8>>>,
    ) -> Result<Vec<Payload>> {
        let ids = self.request(handlers, operation, datas, true).await?;
        self.gather(&ids).await
    }

    pub async fn call_async(
        &self,
        handlers: &[Handler],
        operation: &str,
        datas: Vec<Option<Vec<u8>>>,
    ) -> Result<Vec<Payload>> {
        let ids = self.request(handlers, operation, datas, true).await?;
        self.gather_async(&ids).await
    }

    /// Withdraw published addresses and stop the socket tasks.
    pub async fn close(mut self) -> Result<()> {
        for key in std::mem::take(&mut self.published) {
            if let Err(e) = self.resolver.delete(&key).await {
                tracing::warn!(key = %key, error = %e, "failed to withdraw stream address");
            }
        }
        tracing::info!("request-reply stream closed");
        Ok(())
    }
}

impl Drop for CoordinatorEndpoint {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn bind_listener(host: &str) -> Result<TcpListener> {
    TcpListener::bind((host, 0)).await.map_err(|e| {
        RuntimeError::transport_with_source(format!("failed to bind listener on {}", host), e)
    })
}

fn local_address(listener: &TcpListener) -> Result<SocketAddr> {
    listener
        .local_addr()
        .map_err(|e| RuntimeError::transport_with_source("failed to read listener address", e))
}

/// Accept the connection of worker `index` and forward queued frames to it.
async fn serve_outbound(
    listener: TcpListener,
    mut frames: mpsc::UnboundedReceiver<Vec<u8>>,
    index: usize,
) {
    let mut stream = match listener.accept().await {
        Ok((stream, peer)) => {
            tracing::debug!(worker = index, peer = %peer, "worker connected to outbound channel");
            stream
        }
        Err(e) => {
            tracing::error!(worker = index, error = %e, "failed to accept worker connection");
            return;
        }
    };
    if let Err(e) = stream.set_nodelay(true) {
        tracing::warn!(worker = index, error = %e, "failed to set TCP_NODELAY");
    }

    while let Some(frame) = frames.recv().await {
        if let Err(e) = codec::write_frame(&mut stream, &frame).await {
            tracing::error!(worker = index, error = %e, "outbound channel failed");
            return;
        }
    }
}

/// Accept worker connections on the inbound channel and forward their frames.
async fn accept_inbound(
    listener: TcpListener,
    tx: mpsc::UnboundedSender<Result<Payload>>,
    max_frame_bytes: usize,
) {
    // Readers are aborted when this task is
    let mut readers = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::debug!(peer = %peer, "worker connected to inbound channel");
                    readers.spawn(read_inbound(stream, tx.clone(), max_frame_bytes));
                }
                Err(e) => {
                    tracing::error!(error = %e, "failed to accept inbound connection");
                }
            },
            Some(_) = readers.join_next() => {}
        }
    }
}

async fn read_inbound(
    mut stream: TcpStream,
    tx: mpsc::UnboundedSender<Result<Payload>>,
    max_frame_bytes: usize,
) {
    loop {
        match codec::read_frame(&mut stream, max_frame_bytes).await {
            Ok(Some(payload)) => {
                if tx.send(Ok(payload)).is_err() {
                    return;
                }
            }
            Ok(None) => return,
            Err(e) => {
                tracing::error!(error = %e, "inbound channel failed");
                let _ = tx.send(Err(e));
                return;
            }
        }
    }
}
