//! Two-tier schema cache: an in-memory map keyed by server name plus one
//! disk file per server keyed by launch-spec fingerprint.
//!
//! The cache never serves an entry whose fingerprint differs from the
//! current launch spec, and concurrent misses for the same server collapse
//! into a single fetch.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use mcpu_config::LaunchSpec;
use mcpu_core::CoreError;

use crate::rpc::ToolSchema;

/// Narrow fetch seam the pool supplies at construction.
///
/// The cache never holds the pool type itself, which keeps the
/// pool-depends-on-cache / cache-depends-on-pool cycle out of the crate.
#[async_trait]
pub trait ToolFetcher: Send + Sync {
    async fn fetch(
        &self,
        server_name: &str,
        cancellation: CancellationToken,
    ) -> Result<Vec<ToolSchema>, CoreError>;
}

/// Persisted cache record, one file per server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CachedEntry {
    pub fingerprint: String,
    pub server_name: String,
    pub fetched_at: DateTime<Utc>,
    pub tools: Vec<ToolSchema>,
}

pub struct SchemaCache {
    root: PathBuf,
    fetcher: Arc<dyn ToolFetcher>,
    memory: Mutex<HashMap<String, CachedEntry>>,
    flights: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SchemaCache {
    /// Create the cache rooted at `root`, creating the directory eagerly so
    /// an unwritable cache location fails at daemon startup rather than on
    /// first use.
    pub fn new(root: PathBuf, fetcher: Arc<dyn ToolFetcher>) -> Result<Self, CoreError> {
        std::fs::create_dir_all(&root).map_err(|error| {
            CoreError::Internal(format!(
                "cannot create schema cache directory {}: {error}",
                root.display()
            ))
        })?;
        Ok(Self {
            root,
            fetcher,
            memory: Mutex::new(HashMap::new()),
            flights: Mutex::new(HashMap::new()),
        })
    }

    fn entry_path(&self, server_name: &str) -> PathBuf {
        self.root.join(format!("{server_name}.json"))
    }

    /// Return the schemas for `server_name`, valid for the given launch spec.
    ///
    /// Lookup order: memory, then disk, then a fresh `tools/list` through the
    /// fetcher (writing both tiers). Entries whose fingerprint does not match
    /// the current spec are ignored and replaced.
    pub async fn get(
        &self,
        server_name: &str,
        spec: &LaunchSpec,
        cancellation: CancellationToken,
    ) -> Result<Vec<ToolSchema>, CoreError> {
        let fingerprint = spec.fingerprint();

        if let Some(entry) = self.memory_hit(server_name, &fingerprint).await {
            return Ok(entry.tools);
        }

        let flight = {
            let mut flights = self.flights.lock().await;
            flights
                .entry(server_name.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _in_flight = flight.lock().await;

        // A concurrent miss may have filled the cache while this caller
        // waited on the flight lock.
        if let Some(entry) = self.memory_hit(server_name, &fingerprint).await {
            return Ok(entry.tools);
        }

        if let Some(entry) = self.read_disk(server_name) {
            if entry.fingerprint == fingerprint {
                let tools = entry.tools.clone();
                self.memory
                    .lock()
                    .await
                    .insert(server_name.to_string(), entry);
                return Ok(tools);
            }
            tracing::debug!(
                server = server_name,
                "disk cache fingerprint is stale, refetching"
            );
        }

        let tools = self.fetcher.fetch(server_name, cancellation).await?;
        self.store(server_name, fingerprint, tools.clone()).await;
        Ok(tools)
    }

    /// Replace both tiers for one server.
    pub async fn set(&self, server_name: &str, spec: &LaunchSpec, tools: Vec<ToolSchema>) {
        self.store(server_name, spec.fingerprint(), tools).await;
    }

    async fn store(&self, server_name: &str, fingerprint: String, tools: Vec<ToolSchema>) {
        let entry = CachedEntry {
            fingerprint,
            server_name: server_name.to_string(),
            fetched_at: Utc::now(),
            tools,
        };
        self.write_disk(&entry);
        self.memory
            .lock()
            .await
            .insert(server_name.to_string(), entry);
    }

    /// Invalidate one server's entry, or every entry when `None`.
    pub async fn reload(&self, server_name: Option<&str>) {
        match server_name {
            Some(name) => {
                self.memory.lock().await.remove(name);
                let path = self.entry_path(name);
                if path.exists() {
                    if let Err(error) = std::fs::remove_file(&path) {
                        tracing::warn!(server = name, error = %error, "failed to remove cache file");
                    }
                }
            }
            None => {
                self.memory.lock().await.clear();
                if let Ok(entries) = std::fs::read_dir(&self.root) {
                    for file in entries.flatten() {
                        let path = file.path();
                        if path.extension().is_some_and(|ext| ext == "json") {
                            if let Err(error) = std::fs::remove_file(&path) {
                                tracing::warn!(path = %path.display(), error = %error, "failed to remove cache file");
                            }
                        }
                    }
                }
            }
        }
    }

    /// Cached tool count from the memory tier only (no I/O, no fetch).
    pub async fn peek_count(&self, server_name: &str) -> Option<usize> {
        self.memory
            .lock()
            .await
            .get(server_name)
            .map(|entry| entry.tools.len())
    }

    async fn memory_hit(&self, server_name: &str, fingerprint: &str) -> Option<CachedEntry> {
        let memory = self.memory.lock().await;
        memory
            .get(server_name)
            .filter(|entry| entry.fingerprint == fingerprint)
            .cloned()
    }

    fn read_disk(&self, server_name: &str) -> Option<CachedEntry> {
        let path = self.entry_path(server_name);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return None,
            Err(error) => {
                tracing::warn!(path = %path.display(), error = %error, "failed to read cache file");
                return None;
            }
        };
        match serde_json::from_str::<CachedEntry>(&raw) {
            Ok(entry) => Some(entry),
            Err(error) => {
                // Corrupt entries are treated as absent.
                tracing::warn!(path = %path.display(), error = %error, "corrupt cache file ignored");
                None
            }
        }
    }

    fn write_disk(&self, entry: &CachedEntry) {
        let path = self.entry_path(&entry.server_name);
        let result = (|| -> anyhow::Result<()> {
            let mut temp = tempfile::NamedTempFile::new_in(&self.root)?;
            serde_json::to_writer(&mut temp, entry)?;
            temp.flush()?;
            temp.persist(&path)?;
            Ok(())
        })();
        if let Err(error) = result {
            tracing::warn!(path = %path.display(), error = %error, "failed to write cache file, keeping memory tier only");
        }
    }
}

#[cfg(test)]
#[path = "cache_tests.rs"]
mod tests;
