//! Worker-side request loop.

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::Result;
use crate::transport::{Hook, Payload, WorkerEndpoint};

/// Application logic of a worker.
#[async_trait]
pub trait RequestHandler: Send {
    /// Run the request's operation. The returned bytes become the reply data.
    async fn handle(&mut self, request: &Payload) -> Result<Option<Vec<u8>>>;

    /// Run one pre- or post-hook of `request`.
    async fn run_hook(&mut self, hook: &Hook, request: &Payload) -> Result<()> {
        let _ = (hook, request);
        Ok(())
    }
}

/// Serves requests from the coordinator until shutdown.
pub struct WorkerServer<H> {
    endpoint: WorkerEndpoint,
    handler: H,
    shutdown: watch::Receiver<bool>,
}

impl<H: RequestHandler> WorkerServer<H> {
    pub fn new(endpoint: WorkerEndpoint, handler: H, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            endpoint,
            handler,
            shutdown,
        }
    }

    pub async fn serve_once(&mut self) -> Result<Payload> {
        serve_once(&mut self.endpoint, &mut self.handler).await
    }

    /// Serve until the shutdown flag is raised or the transport fails.
    /// Returns the handler.
    pub async fn run(self) -> Result<H> {
        let Self {
            mut endpoint,
            mut handler,
            mut shutdown,
        } = self;

        loop {
            tokio::select! {
                served = serve_once(&mut endpoint, &mut handler) => {
                    served?;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!(worker = endpoint.index(), "worker shutting down");
                        return Ok(handler);
                    }
                }
            }
        }
    }
}

/// Handle exactly one request: handshake, hooks, operation, reply.
///
/// Failures of the handler are reported to the coordinator in the reply;
/// only transport failures are returned.
pub async fn serve_once<H: RequestHandler>(
    endpoint: &mut WorkerEndpoint,
    handler: &mut H,
) -> Result<Payload> {
    let request = endpoint.poll(true).await?;
    endpoint.acknowledge(&request).await?;

    match run_request(handler, &request).await {
        Ok(data) => {
            endpoint.reply(&request, data)?;
        }
        Err(e) => {
            tracing::warn!(
                worker = endpoint.index(),
                handler = %request.handler,
                operation = %request.operation,
                error = %e,
                "request failed"
            );
            endpoint.post(Payload::reply_to(&request).with_error(e.to_string()))?;
        }
    }
    Ok(request)
}

async fn run_request<H: RequestHandler>(
    handler: &mut H,
    request: &Payload,
) -> Result<Option<Vec<u8>>> {
    for hook in &request.pre_hooks {
        handler.run_hook(hook, request).await?;
    }
    let data = handler.handle(request).await?;
    for hook in &request.post_hooks {
        handler.run_hook(hook, request).await?;
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use super::*;
    use crate::config::RuntimeConfig;
    use crate::error::RuntimeError;
    use crate::name_resolve::{MemoryNameResolver, NameResolver};
    use crate::transport::{CoordinatorEndpoint, Handler};

    #[derive(Default)]
    struct Recorder {
        events: Vec<String>,
    }

    #[async_trait]
    impl RequestHandler for Recorder {
        async fn handle(&mut self, request: &Payload) -> Result<Option<Vec<u8>>> {
            self.events.push(request.operation.clone());
            if request.operation == "fail" {
                return Err(RuntimeError::buffer("out of memory"));
            }
            Ok(request.data.clone())
        }

        async fn run_hook(&mut self, hook: &Hook, _request: &Payload) -> Result<()> {
            self.events.push(format!("hook:{}", hook.name));
            Ok(())
        }
    }

    async fn connect() -> (CoordinatorEndpoint, WorkerEndpoint) {
        let resolver: Arc<dyn NameResolver> = Arc::new(MemoryNameResolver::new());
        let mut config = RuntimeConfig::default();
        config.transport.bind_host = Some("127.0.0.1".to_string());
        config.transport.barrier_poll_interval_ms = 5;
        config.transport.async_poll_interval_ms = 1;
        let (master, worker) = tokio::join!(
            CoordinatorEndpoint::bind(resolver.clone(), &config, 1, HashMap::new()),
            WorkerEndpoint::connect(resolver.clone(), &config, 0),
        );
        (master.unwrap(), worker.unwrap())
    }

    #[tokio::test]
    async fn test_hooks_run_around_handler() {
        let (master, worker) = connect().await;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = tokio::spawn(WorkerServer::new(worker, Recorder::default(), shutdown_rx).run());

        let request = Payload::new(Handler::Worker(0), "train_step")
            .with_pre_hook(Hook::new("data_transfer"))
            .with_post_hook(Hook::new("save"));
        let ids = master.request_payloads(vec![request], false).await.unwrap();
        master.gather(&ids).await.unwrap();

        shutdown_tx.send(true).unwrap();
        let handler = server.await.unwrap().unwrap();
        assert_eq!(
            handler.events,
            vec!["hook:data_transfer", "train_step", "hook:save"]
        );
    }

    #[tokio::test]
    async fn test_handler_failure_becomes_error_reply() {
        let (master, worker) = connect().await;
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let _server = tokio::spawn(WorkerServer::new(worker, Recorder::default(), shutdown_rx).run());

        let err = master
            .call(&[Handler::Worker(0)], "fail", vec![])
            .await
            .unwrap_err();
        match err {
            RuntimeError::Worker { operation, message, .. } => {
                assert_eq!(operation, "fail");
                assert!(message.contains("out of memory"));
            }
            other => panic!("unexpected error: {other}"),
        }

        // The worker keeps serving
        let replies = master
            .call(&[Handler::Worker(0)], "echo", vec![Some(vec![1, 2, 3])])
            .await
            .unwrap();
        assert_eq!(replies[0].data, Some(vec![1, 2, 3]));
    }
}
