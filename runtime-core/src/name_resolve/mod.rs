//! Name-resolve service: a hierarchical key-value store used as the
//! rendezvous point between the coordinator and workers.
//!
//! Keys are `/`-separated paths. A subtree query on `a/b` covers `a/b` itself
//! and every key below `a/b/`, but not `a/bc`.

mod file;
mod memory;
pub mod names;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use uuid::Uuid;

use crate::config::{NameResolveBackend, NameResolveConfig};
use crate::error::{Result, RuntimeError};

pub use file::FileNameResolver;
pub use memory::MemoryNameResolver;

#[async_trait]
pub trait NameResolver: Send + Sync {
    /// Store `value` under `name`.
    ///
    /// Entries with a `keepalive_ttl` vanish once it elapses. Fails if a live
    /// entry exists and `replace` is false.
    async fn add(
        &self,
        name: &str,
        value: &str,
        keepalive_ttl: Option<Duration>,
        replace: bool,
    ) -> Result<()>;

    /// Store `value` under a fresh unique key below `name`. Returns that key.
    async fn add_subentry(
        &self,
        name: &str,
        value: &str,
        keepalive_ttl: Option<Duration>,
    ) -> Result<String> {
        let key = format!("{}/{}", name.trim_end_matches('/'), Uuid::new_v4().simple());
        self.add(&key, value, keepalive_ttl, false).await?;
        Ok(key)
    }

    /// Remove one entry. Fails if it does not exist.
    async fn delete(&self, name: &str) -> Result<()>;

    /// Remove every entry in the subtree. Missing subtrees are not an error.
    async fn clear_subtree(&self, prefix: &str) -> Result<()>;

    async fn get(&self, name: &str) -> Result<Option<String>>;

    /// Values of all live entries in the subtree, ordered by key.
    async fn get_subtree(&self, prefix: &str) -> Result<Vec<String>>;

    /// Keys of all live entries in the subtree, sorted.
    async fn find_subtree(&self, prefix: &str) -> Result<Vec<String>>;

    /// Poll `get` until the entry appears or `timeout` elapses.
    async fn wait(
        &self,
        name: &str,
        timeout: Option<Duration>,
        poll_interval: Duration,
    ) -> Result<String> {
        let start = Instant::now();
        loop {
            if let Some(value) = self.get(name).await? {
                return Ok(value);
            }
            if let Some(timeout) = timeout {
                if start.elapsed() >= timeout {
                    return Err(RuntimeError::timeout_waiting_for_peer(
                        name,
                        timeout.as_secs(),
                    ));
                }
            }
            tokio::time::sleep(poll_interval).await;
        }
    }
}

/// Build the resolver selected by `config`.
pub fn from_config(config: &NameResolveConfig) -> Result<Arc<dyn NameResolver>> {
    let resolver: Arc<dyn NameResolver> = match config.backend {
        NameResolveBackend::Memory => Arc::new(MemoryNameResolver::new()),
        NameResolveBackend::File => Arc::new(FileNameResolver::new(&config.root)?),
    };
    Ok(resolver)
}

/// True if `key` lies in the subtree rooted at `prefix`.
pub(crate) fn in_subtree(key: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    key == prefix
        || (key.len() > prefix.len()
            && key.starts_with(prefix)
            && key.as_bytes()[prefix.len()] == b'/')
}

/// Reject keys that cannot map onto a path tree.
pub(crate) fn validate_key(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(RuntimeError::name_resolve(name, "empty key"));
    }
    if name
        .split('/')
        .any(|seg| seg.is_empty() || seg == "." || seg == "..")
    {
        return Err(RuntimeError::name_resolve(
            name,
            "key segments must be non-empty and not '.' or '..'",
        ));
    }
    Ok(())
}
