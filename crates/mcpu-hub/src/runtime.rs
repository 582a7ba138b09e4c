//! Construction of the hub stack: one config view, one pool, one cache, one
//! router per process, passed explicitly — no ambient singletons.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use mcpu_config::{ConfigHandle, paths};

use crate::cache::SchemaCache;
use crate::pool::{ConnectionPool, PoolOptions};
use crate::router::Router;

#[derive(Debug, Clone)]
pub struct HubOptions {
    pub request_timeout: Duration,
    pub close_deadline: Duration,
    /// Override for the schema cache root (defaults to the XDG cache dir).
    pub cache_dir: Option<PathBuf>,
    /// Override for the config file (defaults to the XDG config path).
    pub config_path: Option<PathBuf>,
}

impl Default for HubOptions {
    fn default() -> Self {
        let pool = PoolOptions::default();
        Self {
            request_timeout: pool.request_timeout,
            close_deadline: pool.close_deadline,
            cache_dir: None,
            config_path: None,
        }
    }
}

pub struct HubRuntime {
    pub config: Arc<ConfigHandle>,
    pub pool: Arc<ConnectionPool>,
    pub cache: Arc<SchemaCache>,
    pub router: Router,
}

impl std::fmt::Debug for HubRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubRuntime").finish_non_exhaustive()
    }
}

/// Build the full stack. Config and cache problems abort here, at startup.
pub fn build_runtime(options: HubOptions) -> Result<HubRuntime> {
    let config_path = options
        .config_path
        .or_else(paths::config_path)
        .context("failed to resolve config directory")?;
    let config = Arc::new(ConfigHandle::from_path(config_path)?);

    let pool = Arc::new(ConnectionPool::new(
        config.clone(),
        PoolOptions {
            request_timeout: options.request_timeout,
            close_deadline: options.close_deadline,
        },
    ));

    let cache_root = options
        .cache_dir
        .or_else(paths::schema_cache_dir)
        .context("failed to resolve cache directory")?;
    let cache = Arc::new(SchemaCache::new(cache_root, pool.clone())?);

    let router = Router::new(
        config.clone(),
        pool.clone(),
        cache.clone(),
        options.request_timeout,
    );

    Ok(HubRuntime {
        config,
        pool,
        cache,
        router,
    })
}
