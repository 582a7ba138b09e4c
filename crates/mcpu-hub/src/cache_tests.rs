use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use mcpu_config::LaunchSpec;
use mcpu_core::CoreError;

use super::{CachedEntry, SchemaCache, ToolFetcher};
use crate::rpc::ToolSchema;

struct CountingFetcher {
    calls: AtomicUsize,
    delay: Duration,
}

impl CountingFetcher {
    fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            delay,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ToolFetcher for CountingFetcher {
    async fn fetch(
        &self,
        server_name: &str,
        _cancellation: CancellationToken,
    ) -> Result<Vec<ToolSchema>, CoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(vec![tool(&format!("{server_name}_tool"))])
    }
}

fn tool(name: &str) -> ToolSchema {
    ToolSchema {
        name: name.to_string(),
        title: None,
        description: "A tool.".to_string(),
        input_schema: json!({"type": "object"}),
        output_schema: None,
        annotations: None,
    }
}

fn spec(command: &str) -> LaunchSpec {
    LaunchSpec::new(command)
}

fn new_cache(dir: &std::path::Path, fetcher: Arc<CountingFetcher>) -> SchemaCache {
    SchemaCache::new(dir.join("schemas"), fetcher).unwrap()
}

#[tokio::test]
async fn test_miss_fetches_and_fills_both_tiers() {
    let temp = tempfile::tempdir().unwrap();
    let fetcher = CountingFetcher::new(Duration::ZERO);
    let cache = new_cache(temp.path(), fetcher.clone());
    let spec = spec("srv");

    let tools = cache
        .get("a", &spec, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(tools[0].name, "a_tool");
    assert_eq!(fetcher.calls(), 1);

    // Second lookup is served from memory.
    cache
        .get("a", &spec, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(fetcher.calls(), 1);

    // The disk file carries the current fingerprint.
    let raw = std::fs::read_to_string(temp.path().join("schemas/a.json")).unwrap();
    let entry: CachedEntry = serde_json::from_str(&raw).unwrap();
    assert_eq!(entry.fingerprint, spec.fingerprint());
    assert_eq!(entry.server_name, "a");
}

#[tokio::test]
async fn test_concurrent_misses_single_flight() {
    let temp = tempfile::tempdir().unwrap();
    let fetcher = CountingFetcher::new(Duration::from_millis(100));
    let cache = Arc::new(new_cache(temp.path(), fetcher.clone()));
    let spec = spec("srv");

    let mut handles = Vec::new();
    for _ in 0..4 {
        let cache = cache.clone();
        let spec = spec.clone();
        handles.push(tokio::spawn(async move {
            cache.get("cold", &spec, CancellationToken::new()).await
        }));
    }

    for handle in handles {
        let tools = handle.await.unwrap().unwrap();
        assert_eq!(tools[0].name, "cold_tool");
    }
    assert_eq!(fetcher.calls(), 1);
}

#[tokio::test]
async fn test_fingerprint_mismatch_refetches() {
    let temp = tempfile::tempdir().unwrap();
    let fetcher = CountingFetcher::new(Duration::ZERO);
    let cache = new_cache(temp.path(), fetcher.clone());

    cache
        .get("a", &spec("old"), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(fetcher.calls(), 1);

    // The launch spec changed: both tiers are stale.
    cache
        .get("a", &spec("new"), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(fetcher.calls(), 2);

    let raw = std::fs::read_to_string(temp.path().join("schemas/a.json")).unwrap();
    let entry: CachedEntry = serde_json::from_str(&raw).unwrap();
    assert_eq!(entry.fingerprint, spec("new").fingerprint());
}

#[tokio::test]
async fn test_disk_tier_survives_memory_invalidation() {
    let temp = tempfile::tempdir().unwrap();
    let fetcher = CountingFetcher::new(Duration::ZERO);
    let spec = spec("srv");

    {
        let cache = new_cache(temp.path(), fetcher.clone());
        cache
            .get("a", &spec, CancellationToken::new())
            .await
            .unwrap();
    }

    // A fresh cache (new process) reads the disk tier without fetching.
    let cache = new_cache(temp.path(), fetcher.clone());
    cache
        .get("a", &spec, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(fetcher.calls(), 1);
}

#[tokio::test]
async fn test_reload_invalidates_both_tiers() {
    let temp = tempfile::tempdir().unwrap();
    let fetcher = CountingFetcher::new(Duration::ZERO);
    let cache = new_cache(temp.path(), fetcher.clone());
    let spec = spec("srv");

    cache
        .get("a", &spec, CancellationToken::new())
        .await
        .unwrap();
    cache.reload(Some("a")).await;
    assert!(!temp.path().join("schemas/a.json").exists());
    assert_eq!(cache.peek_count("a").await, None);

    cache
        .get("a", &spec, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(fetcher.calls(), 2);
}

#[tokio::test]
async fn test_corrupt_disk_entry_is_treated_as_absent() {
    let temp = tempfile::tempdir().unwrap();
    let fetcher = CountingFetcher::new(Duration::ZERO);
    let cache = new_cache(temp.path(), fetcher.clone());
    std::fs::write(temp.path().join("schemas/a.json"), "{ not json").unwrap();

    let tools = cache
        .get("a", &spec("srv"), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(tools.len(), 1);
    assert_eq!(fetcher.calls(), 1);
}

#[tokio::test]
async fn test_set_replaces_both_tiers() {
    let temp = tempfile::tempdir().unwrap();
    let fetcher = CountingFetcher::new(Duration::ZERO);
    let cache = new_cache(temp.path(), fetcher.clone());
    let spec = spec("srv");

    cache.set("a", &spec, vec![tool("pinned")]).await;
    let tools = cache
        .get("a", &spec, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(tools[0].name, "pinned");
    assert_eq!(fetcher.calls(), 0);
    assert_eq!(cache.peek_count("a").await, Some(1));
}
