//! Name-resolve backend on a shared directory tree.
//!
//! Each key `a/b/c` maps to the file `<root>/a/b/c/ENTRY` holding a TOML
//! record with the value and an optional expiry. Any host that mounts the
//! same root sees the same names.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::fs;
use uuid::Uuid;

use super::{in_subtree, validate_key, NameResolver};
use crate::error::{Result, RuntimeError};

const ENTRY_FILE: &str = "ENTRY";

#[derive(Debug, Serialize, Deserialize)]
struct FileEntry {
    value: String,
    /// Unix milliseconds after which the entry is treated as absent.
    expires_at_ms: Option<i64>,
}

impl FileEntry {
    fn is_live(&self, now_ms: i64) -> bool {
        self.expires_at_ms.map_or(true, |t| now_ms < t)
    }
}

#[derive(Debug, Clone)]
pub struct FileNameResolver {
    root: PathBuf,
}

impl FileNameResolver {
    /// Open (and create if needed) a resolver rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if !root.exists() {
            std::fs::create_dir_all(&root).map_err(|e| {
                RuntimeError::name_resolve_with_source(&root, "failed to create root directory", e)
            })?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, name: &str) -> PathBuf {
        self.root.join(name).join(ENTRY_FILE)
    }

    async fn read_entry(&self, name: &str) -> Result<Option<FileEntry>> {
        let path = self.entry_path(name);
        match fs::read_to_string(&path).await {
            Ok(content) => parse_entry(&path, &content).map(Some),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(RuntimeError::name_resolve_with_source(
                &path,
                "failed to read entry",
                e,
            )),
        }
    }

    /// Remove empty directories from `dir` up to (excluding) the root.
    async fn prune_empty_dirs(&self, mut dir: PathBuf) {
        while dir.starts_with(&self.root) && dir != self.root {
            if fs::remove_dir(&dir).await.is_err() {
                break;
            }
            if !dir.pop() {
                break;
            }
        }
    }

    async fn live_subtree(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let root = self.root.clone();
        let prefix = prefix.trim_end_matches('/').to_string();
        let start = root.join(&prefix);

        let found = tokio::task::spawn_blocking(move || {
            let mut found = Vec::new();
            collect_entries(&root, &start, &mut found)?;
            Ok::<_, io::Error>(found)
        })
        .await
        .map_err(|e| {
            RuntimeError::name_resolve_with_source(
                &self.root,
                "subtree scan task failed",
                io::Error::new(io::ErrorKind::Other, e),
            )
        })?
        .map_err(|e| RuntimeError::name_resolve_with_source(&self.root, "failed to scan subtree", e))?;

        let now_ms = Utc::now().timestamp_millis();
        let mut live = Vec::new();
        for (key, path, content) in found {
            if !in_subtree(&key, &prefix) {
                continue;
            }
            let entry = parse_entry(&path, &content)?;
            if entry.is_live(now_ms) {
                live.push((key, entry.value));
            }
        }
        live.sort();
        Ok(live)
    }
}

fn parse_entry(path: &Path, content: &str) -> Result<FileEntry> {
    toml::from_str(content).map_err(|e| {
        RuntimeError::name_resolve(path.display().to_string(), format!("corrupt entry: {}", e))
    })
}

/// Walk `dir` and collect `(key, path, content)` for every entry file.
fn collect_entries(
    root: &Path,
    dir: &Path,
    out: &mut Vec<(String, PathBuf, String)>,
) -> io::Result<()> {
    let read_dir = match std::fs::read_dir(dir) {
        Ok(rd) => rd,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };

    for item in read_dir {
        let item = item?;
        let path = item.path();
        if item.file_type()?.is_dir() {
            collect_entries(root, &path, out)?;
        } else if item.file_name() == ENTRY_FILE {
            let content = match std::fs::read_to_string(&path) {
                Ok(c) => c,
                // Deleted concurrently
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            };
            let key = dir
                .strip_prefix(root)
                .map(|p| {
                    p.components()
                        .map(|c| c.as_os_str().to_string_lossy().into_owned())
                        .collect::<Vec<_>>()
                        .join("/")
                })
                .unwrap_or_default();
            out.push((key, path, content));
        }
    }
    Ok(())
}

#[async_trait]
impl NameResolver for FileNameResolver {
    async fn add(
        &self,
        name: &str,
        value: &str,
        keepalive_ttl: Option<Duration>,
        replace: bool,
    ) -> Result<()> {
        validate_key(name)?;
        let now_ms = Utc::now().timestamp_millis();

        if !replace {
            if let Some(existing) = self.read_entry(name).await? {
                if existing.is_live(now_ms) {
                    return Err(RuntimeError::name_resolve(name, "entry already exists"));
                }
            }
        }

        let dir = self.root.join(name);
        fs::create_dir_all(&dir).await.map_err(|e| {
            RuntimeError::name_resolve_with_source(&dir, "failed to create entry directory", e)
        })?;

        let entry = FileEntry {
            value: value.to_string(),
            expires_at_ms: keepalive_ttl.map(|ttl| now_ms + ttl.as_millis() as i64),
        };
        let content = toml::to_string(&entry).map_err(|e| {
            RuntimeError::name_resolve(name, format!("failed to encode entry: {}", e))
        })?;

        // Readers never observe a partially written entry
        let tmp = dir.join(format!("{}.{}.tmp", ENTRY_FILE, Uuid::new_v4().simple()));
        fs::write(&tmp, content).await.map_err(|e| {
            RuntimeError::name_resolve_with_source(&tmp, "failed to write entry", e)
        })?;
        let path = dir.join(ENTRY_FILE);
        fs::rename(&tmp, &path).await.map_err(|e| {
            RuntimeError::name_resolve_with_source(&path, "failed to publish entry", e)
        })?;

        tracing::trace!(name, value, "added name entry");
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        validate_key(name)?;
        let path = self.entry_path(name);
        match fs::remove_file(&path).await {
            Ok(()) => {
                self.prune_empty_dirs(self.root.join(name)).await;
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(RuntimeError::name_resolve(name, "entry not found"))
            }
            Err(e) => Err(RuntimeError::name_resolve_with_source(
                &path,
                "failed to delete entry",
                e,
            )),
        }
    }

    async fn clear_subtree(&self, prefix: &str) -> Result<()> {
        validate_key(prefix.trim_end_matches('/'))?;
        let dir = self.root.join(prefix.trim_end_matches('/'));
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(RuntimeError::name_resolve_with_source(
                &dir,
                "failed to clear subtree",
                e,
            )),
        }
    }

    async fn get(&self, name: &str) -> Result<Option<String>> {
        validate_key(name)?;
        let now_ms = Utc::now().timestamp_millis();
        Ok(self
            .read_entry(name)
            .await?
            .filter(|e| e.is_live(now_ms))
            .map(|e| e.value))
    }

    async fn get_subtree(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .live_subtree(prefix)
            .await?
            .into_iter()
            .map(|(_, v)| v)
            .collect())
    }

    async fn find_subtree(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .live_subtree(prefix)
            .await?
            .into_iter()
            .map(|(k, _)| k)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn resolver() -> (TempDir, FileNameResolver) {
        let dir = TempDir::new().unwrap();
        let resolver = FileNameResolver::new(dir.path().join("names")).unwrap();
        (dir, resolver)
    }

    #[tokio::test]
    async fn test_add_get_delete() {
        let (_dir, resolver) = resolver();
        resolver.add("exp/trial/master_recv", "10.0.0.1:4000", None, false).await.unwrap();
        assert_eq!(
            resolver.get("exp/trial/master_recv").await.unwrap().as_deref(),
            Some("10.0.0.1:4000")
        );
        assert!(resolver.add("exp/trial/master_recv", "x", None, false).await.is_err());

        resolver.delete("exp/trial/master_recv").await.unwrap();
        assert_eq!(resolver.get("exp/trial/master_recv").await.unwrap(), None);
        // Empty directories are pruned
        assert!(!resolver.root().join("exp").exists());
        assert!(resolver.delete("exp/trial/master_recv").await.is_err());
    }

    #[tokio::test]
    async fn test_nested_keys_coexist() {
        let (_dir, resolver) = resolver();
        resolver.add("a", "outer", None, false).await.unwrap();
        resolver.add("a/b", "inner", None, false).await.unwrap();
        resolver.add("ab", "sibling", None, false).await.unwrap();

        assert_eq!(resolver.find_subtree("a").await.unwrap(), vec!["a", "a/b"]);
        assert_eq!(resolver.get_subtree("a").await.unwrap(), vec!["outer", "inner"]);
        assert_eq!(resolver.find_subtree("a/b").await.unwrap(), vec!["a/b"]);
        assert!(resolver.find_subtree("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_subentries_and_clear() {
        let (_dir, resolver) = resolver();
        for _ in 0..3 {
            resolver.add_subentry("t/__pubsub_barrier__", "127.0.0.1", None).await.unwrap();
        }
        assert_eq!(resolver.get_subtree("t/__pubsub_barrier__").await.unwrap().len(), 3);

        resolver.clear_subtree("t").await.unwrap();
        assert!(resolver.get_subtree("t").await.unwrap().is_empty());
        resolver.clear_subtree("t").await.unwrap();
    }

    #[tokio::test]
    async fn test_expired_entries_are_invisible() {
        let (_dir, resolver) = resolver();
        resolver
            .add("lease", "v", Some(Duration::from_millis(10)), false)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(resolver.get("lease").await.unwrap().is_none());
        assert!(resolver.find_subtree("lease").await.unwrap().is_empty());
        resolver.add("lease", "w", None, false).await.unwrap();
    }

    #[tokio::test]
    async fn test_two_handles_share_state() {
        let (dir, resolver) = resolver();
        let other = FileNameResolver::new(dir.path().join("names")).unwrap();
        resolver.add("shared", "v", None, false).await.unwrap();
        assert_eq!(other.get("shared").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn test_rejects_escaping_keys() {
        let (_dir, resolver) = resolver();
        assert!(resolver.add("../outside", "v", None, false).await.is_err());
        assert!(resolver.get("a//b").await.is_err());
    }
}
