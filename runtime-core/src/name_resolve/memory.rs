use std::collections::BTreeMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::{in_subtree, validate_key, NameResolver};
use crate::error::{Result, RuntimeError};

#[derive(Debug, Clone)]
struct NameEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl NameEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |t| now < t)
    }
}

/// In-process resolver for single-host runs and tests.
#[derive(Debug, Default)]
pub struct MemoryNameResolver {
    entries: RwLock<BTreeMap<String, NameEntry>>,
}

impl MemoryNameResolver {
    pub fn new() -> Self {
        Self::default()
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, NameEntry>> {
        self.entries
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, NameEntry>> {
        self.entries
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn live_subtree(&self, prefix: &str) -> Vec<(String, String)> {
        let now = Instant::now();
        self.read()
            .iter()
            .filter(|(k, e)| in_subtree(k, prefix) && e.is_live(now))
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect()
    }
}

#[async_trait]
impl NameResolver for MemoryNameResolver {
    async fn add(
        &self,
        name: &str,
        value: &str,
        keepalive_ttl: Option<Duration>,
        replace: bool,
    ) -> Result<()> {
        validate_key(name)?;
        let now = Instant::now();
        let mut entries = self.write();
        if !replace && entries.get(name).map_or(false, |e| e.is_live(now)) {
            return Err(RuntimeError::name_resolve(name, "entry already exists"));
        }
        entries.insert(
            name.to_string(),
            NameEntry {
                value: value.to_string(),
                expires_at: keepalive_ttl.map(|ttl| now + ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        match self.write().remove(name) {
            Some(e) if e.is_live(Instant::now()) => Ok(()),
            _ => Err(RuntimeError::name_resolve(name, "entry not found")),
        }
    }

    async fn clear_subtree(&self, prefix: &str) -> Result<()> {
        self.write().retain(|k, _| !in_subtree(k, prefix));
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Option<String>> {
        let now = Instant::now();
        let expired = match self.read().get(name) {
            None => return Ok(None),
            Some(e) if e.is_live(now) => return Ok(Some(e.value.clone())),
            Some(_) => true,
        };
        if expired {
            self.write().remove(name);
        }
        Ok(None)
    }

    async fn get_subtree(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self.live_subtree(prefix).into_iter().map(|(_, v)| v).collect())
    }

    async fn find_subtree(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self.live_subtree(prefix).into_iter().map(|(k, _)| k).collect())
    }
}
