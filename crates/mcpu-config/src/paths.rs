//! XDG path resolution for config, schema cache, and daemon runtime files.

use std::path::PathBuf;

/// Canonical XDG app name.
pub const APP_NAME: &str = "mcpu";

fn xdg_override(var: &str) -> Option<PathBuf> {
    std::env::var(var)
        .ok()
        .filter(|v| !v.is_empty())
        .map(|v| PathBuf::from(v).join(APP_NAME))
}

fn effective_uid() -> u32 {
    #[cfg(unix)]
    {
        // SAFETY: `geteuid` has no preconditions and returns caller effective UID.
        unsafe { libc::geteuid() }
    }
    #[cfg(not(unix))]
    {
        0
    }
}

/// Config directory: `$XDG_CONFIG_HOME/mcpu`, else the platform default
/// (`~/.config/mcpu` on Linux).
pub fn config_dir() -> Option<PathBuf> {
    xdg_override("XDG_CONFIG_HOME").or_else(|| {
        directories::ProjectDirs::from("", "", APP_NAME)
            .map(|dirs| dirs.config_dir().to_path_buf())
    })
}

/// Path of the resolved server map: `<config_dir>/config.json`.
pub fn config_path() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join("config.json"))
}

/// Root of the on-disk schema cache: `$XDG_CACHE_HOME/mcpu/schemas`.
pub fn schema_cache_dir() -> Option<PathBuf> {
    xdg_override("XDG_CACHE_HOME")
        .or_else(|| {
            directories::ProjectDirs::from("", "", APP_NAME)
                .map(|dirs| dirs.cache_dir().to_path_buf())
        })
        .map(|dir| dir.join("schemas"))
}

/// Runtime directory for pid/port files and daemon logs:
/// `$XDG_RUNTIME_DIR/mcpu`, falling back to `/tmp/mcpu-<uid>`.
pub fn runtime_dir() -> PathBuf {
    runtime_dir_from(
        std::env::var("XDG_RUNTIME_DIR").ok().as_deref(),
        effective_uid(),
    )
}

fn runtime_dir_from(runtime_root: Option<&str>, uid: u32) -> PathBuf {
    if let Some(runtime_root) = runtime_root.filter(|root| !root.is_empty()) {
        return PathBuf::from(runtime_root).join(APP_NAME);
    }
    PathBuf::from("/tmp").join(format!("{APP_NAME}-{uid}"))
}

pub fn pid_path() -> PathBuf {
    runtime_dir().join("daemon.pid")
}

pub fn port_path() -> PathBuf {
    runtime_dir().join("daemon.port")
}

pub fn daemon_log_dir() -> PathBuf {
    runtime_dir().join("logs")
}
