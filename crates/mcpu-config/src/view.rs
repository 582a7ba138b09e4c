use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, RwLock};

use anyhow::{Context, Result, bail};
use regex::Regex;

use crate::launch::LaunchSpec;
use crate::paths;

static VALID_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9_-]+$").expect("compile server name regex"));

/// Server names must be usable inside MCP tool identifiers.
pub fn is_valid_server_name(name: &str) -> bool {
    VALID_NAME.is_match(name)
}

/// Immutable snapshot of the resolved `server_name -> LaunchSpec` map.
///
/// Readers always observe a complete snapshot; reload builds a fresh view and
/// swaps it in whole via [`ConfigHandle`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConfigView {
    servers: BTreeMap<String, LaunchSpec>,
}

impl ConfigView {
    pub fn new(servers: BTreeMap<String, LaunchSpec>) -> Self {
        Self { servers }
    }

    /// Load from the default config path (`$XDG_CONFIG_HOME/mcpu/config.json`).
    ///
    /// A missing file yields an empty view; a malformed file is an error and
    /// aborts daemon startup.
    pub fn load() -> Result<Self> {
        let path = paths::config_path().context("failed to resolve config directory")?;
        Self::load_from_path(&path)
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::warn!(path = %path.display(), "config file not found, starting with no servers");
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {}", path.display()))?;
        let servers: BTreeMap<String, LaunchSpec> = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config: {}", path.display()))?;

        for (name, spec) in &servers {
            if !is_valid_server_name(name) {
                bail!(
                    "invalid server name '{name}' in {}: must match ^[a-zA-Z0-9_-]+$",
                    path.display()
                );
            }
            if spec.command.trim().is_empty() {
                bail!("server '{name}' in {} has an empty command", path.display());
            }
        }

        Ok(Self::new(servers))
    }

    pub fn lookup(&self, name: &str) -> Option<&LaunchSpec> {
        self.servers.get(name)
    }

    /// Configured server names in deterministic (sorted) order.
    pub fn list(&self) -> Vec<String> {
        self.servers.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}

/// Shared holder for the current [`ConfigView`] snapshot.
///
/// `snapshot` hands out the current `Arc`; `reload` re-reads the file and
/// replaces the snapshot atomically, so no reader observes a partial update.
#[derive(Debug)]
pub struct ConfigHandle {
    path: Option<PathBuf>,
    current: RwLock<Arc<ConfigView>>,
}

impl ConfigHandle {
    pub fn new(view: ConfigView) -> Self {
        Self {
            path: None,
            current: RwLock::new(Arc::new(view)),
        }
    }

    /// Handle bound to a config file so `reload` can re-read it.
    pub fn from_path(path: PathBuf) -> Result<Self> {
        let view = ConfigView::load_from_path(&path)?;
        Ok(Self {
            path: Some(path),
            current: RwLock::new(Arc::new(view)),
        })
    }

    pub fn snapshot(&self) -> Arc<ConfigView> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Re-read the bound config file and swap the snapshot in whole.
    ///
    /// Handles built directly from a view (tests, embedded use) keep their
    /// snapshot unchanged.
    pub fn reload(&self) -> Result<()> {
        let Some(path) = self.path.as_deref() else {
            return Ok(());
        };
        let view = ConfigView::load_from_path(path)?;
        let mut guard = self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Arc::new(view);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn write_config(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("config.json");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_load_missing_file_is_empty_view() {
        let dir = tempfile::tempdir().unwrap();
        let view = ConfigView::load_from_path(&dir.path().join("config.json")).unwrap();
        assert!(view.is_empty());
    }

    #[test]
    fn test_load_parses_servers_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            r#"{
                "zeta": { "command": "npx", "args": ["-y", "zeta-mcp"] },
                "alpha": { "command": "deno", "env": { "TOKEN": "x" } }
            }"#,
        );

        let view = ConfigView::load_from_path(&path).unwrap();
        assert_eq!(view.list(), vec!["alpha".to_string(), "zeta".to_string()]);
        let alpha = view.lookup("alpha").unwrap();
        assert_eq!(alpha.command, "deno");
        assert_eq!(alpha.env.get("TOKEN").map(String::as_str), Some("x"));
        assert!(view.lookup("missing").is_none());
    }

    #[test]
    fn test_load_rejects_invalid_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), r#"{ "bad name": { "command": "x" } }"#);
        let err = ConfigView::load_from_path(&path).unwrap_err();
        assert!(format!("{err:#}").contains("invalid server name"));
    }

    #[test]
    fn test_load_rejects_empty_command() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), r#"{ "a": { "command": "  " } }"#);
        let err = ConfigView::load_from_path(&path).unwrap_err();
        assert!(format!("{err:#}").contains("empty command"));
    }

    #[test]
    fn test_load_rejects_malformed_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), "{ not json");
        let err = ConfigView::load_from_path(&path).unwrap_err();
        assert!(format!("{err:#}").contains("failed to parse config"));
    }

    #[test]
    fn test_reload_swaps_snapshot_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), r#"{ "a": { "command": "x" } }"#);
        let handle = ConfigHandle::from_path(path.clone()).unwrap();

        let before = handle.snapshot();
        assert_eq!(before.list(), vec!["a".to_string()]);

        std::fs::write(
            &path,
            r#"{ "a": { "command": "x" }, "b": { "command": "y" } }"#,
        )
        .unwrap();
        handle.reload().unwrap();

        // The old snapshot is untouched; the new one sees both servers.
        assert_eq!(before.list(), vec!["a".to_string()]);
        assert_eq!(
            handle.snapshot().list(),
            vec!["a".to_string(), "b".to_string()]
        );
    }

    #[test]
    fn test_name_validation() {
        assert!(is_valid_server_name("repo-mix_2"));
        assert!(!is_valid_server_name(""));
        assert!(!is_valid_server_name("a b"));
        assert!(!is_valid_server_name("a.b"));
    }

    #[test]
    fn test_view_handle_without_path_keeps_snapshot_on_reload() {
        let mut servers = BTreeMap::new();
        servers.insert(
            "s".to_string(),
            LaunchSpec {
                command: "x".into(),
                args: vec![],
                env: HashMap::new(),
            },
        );
        let handle = ConfigHandle::new(ConfigView::new(servers));
        handle.reload().unwrap();
        assert_eq!(handle.snapshot().list(), vec!["s".to_string()]);
    }
}
