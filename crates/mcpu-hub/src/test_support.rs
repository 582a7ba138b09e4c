//! Shared fixtures for hub tests: a scriptable stub MCP server and a
//! ready-wired router.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use mcpu_config::{ConfigHandle, ConfigView, LaunchSpec};

use crate::cache::SchemaCache;
use crate::pool::{ConnectionPool, PoolOptions};
use crate::router::Router;

/// Knobs for the stub server script.
#[derive(Debug, Default, Clone)]
pub(crate) struct MockBehavior {
    /// Exit without replying when the first `tools/list` arrives, so the
    /// client observes EOF mid-session.
    pub exit_after_initialize: bool,
    /// Reply to `tools/call` with `isError: true`.
    pub call_is_error: bool,
    /// Sleep this long (seconds, e.g. "0.2") before each `tools/call` reply.
    pub call_delay_secs: Option<&'static str>,
    /// Append one line per `tools/list` request to this file.
    pub list_log: Option<PathBuf>,
    /// Append each raw `tools/call` request line to this file.
    pub call_log: Option<PathBuf>,
}

/// Write a stub MCP server as a small `sh` script and return its path.
pub(crate) fn write_mock_server(dir: &Path, behavior: MockBehavior) -> Result<PathBuf> {
    let path = dir.join("mock-mcp.sh");

    let list_log = behavior
        .list_log
        .as_ref()
        .map(|log| format!("      echo listed >> '{}'\n", log.display()))
        .unwrap_or_default();
    let list_exit = if behavior.exit_after_initialize {
        "      exit 0\n"
    } else {
        ""
    };
    let call_log = behavior
        .call_log
        .as_ref()
        .map(|log| format!("      printf '%s\\n' \"$line\" >> '{}'\n", log.display()))
        .unwrap_or_default();
    let call_delay = behavior
        .call_delay_secs
        .map(|secs| format!("      sleep {secs}\n"))
        .unwrap_or_default();
    let call_reply = if behavior.call_is_error {
        r#"      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"tool blew up"}],"isError":true}}\n' "$id""#
    } else {
        r#"      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"{\\"y\\":2}"}]}}\n' "$id""#
    };

    let script = format!(
        r#"#!/bin/sh
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/.*"id"[ ]*:[ ]*\([^,}}]*\).*/\1/p')
  case "$line" in
    *\"initialize\"*)
      printf '{{"jsonrpc":"2.0","id":%s,"result":{{"protocolVersion":"2024-11-05","capabilities":{{"tools":{{}}}},"serverInfo":{{"name":"mock","version":"0.1.0"}}}}}}\n' "$id"
      ;;
    *\"notifications/initialized\"*)
      ;;
    *\"tools/list\"*)
{list_log}{list_exit}      printf '{{"jsonrpc":"2.0","id":%s,"result":{{"tools":[{{"name":"echo_tool","description":"Echo tool","inputSchema":{{"type":"object","properties":{{}}}}}}]}}}}\n' "$id"
      ;;
    *\"tools/call\"*)
{call_log}{call_delay}{call_reply}
      ;;
  esac
done
"#
    );

    std::fs::write(&path, script)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(&path)?.permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms)?;
    }

    Ok(path)
}

pub(crate) fn mock_spec(script: &Path) -> LaunchSpec {
    LaunchSpec {
        command: "sh".to_string(),
        args: vec![script.to_string_lossy().into_owned()],
        env: Default::default(),
    }
}

/// A router wired to an in-memory config, a fresh pool, and a schema cache
/// rooted under `state_dir`.
pub(crate) fn build_router(servers: Vec<(&str, LaunchSpec)>, state_dir: &Path) -> Router {
    let map: BTreeMap<String, LaunchSpec> = servers
        .into_iter()
        .map(|(name, spec)| (name.to_string(), spec))
        .collect();
    let config = Arc::new(ConfigHandle::new(ConfigView::new(map)));
    let pool = Arc::new(ConnectionPool::new(
        config.clone(),
        PoolOptions {
            request_timeout: Duration::from_secs(5),
            close_deadline: Duration::from_secs(2),
        },
    ));
    let cache = Arc::new(
        SchemaCache::new(state_dir.join("schemas"), pool.clone()).expect("cache dir"),
    );
    Router::new(config, pool, cache, Duration::from_secs(5))
}
