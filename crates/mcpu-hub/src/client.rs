//! One stdio JSON-RPC session to a child MCP server.
//!
//! The client owns the child process and both pipes. Requests are strictly
//! serial: the pool guarantees exclusive access, so the client sends one
//! request and reads until its correlated response arrives, logging and
//! skipping any notifications that interleave. Any I/O error closes the
//! session; the underlying cause is kept so pending callers see it.

use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use mcpu_config::LaunchSpec;
use mcpu_core::CoreError;

use crate::rpc::{CallToolOutcome, JsonRpcRequest, PROTOCOL_VERSION, ToolSchema};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Ready,
    Closed,
}

pub struct McpClient {
    server_name: String,
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    next_id: u64,
    state: SessionState,
    initialize_result: Value,
}

impl McpClient {
    /// Spawn the child per the launch spec and run the initialize handshake.
    ///
    /// The child's stderr is drained into the daemon log. Failure to complete
    /// the handshake within `init_timeout` kills the child and reports a
    /// `connect` error.
    pub async fn connect(
        server_name: &str,
        spec: &LaunchSpec,
        init_timeout: Duration,
    ) -> Result<Self, CoreError> {
        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args);
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        cmd.stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|error| CoreError::Connect {
            server: server_name.to_string(),
            message: format!("failed to spawn '{}': {error}", spec.command),
        })?;

        if let Some(stderr) = child.stderr.take() {
            let name = server_name.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(server = %name, "child stderr: {line}");
                }
            });
        }

        let stdin = child.stdin.take().ok_or_else(|| CoreError::Connect {
            server: server_name.to_string(),
            message: "failed to capture child stdin".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| CoreError::Connect {
            server: server_name.to_string(),
            message: "failed to capture child stdout".to_string(),
        })?;

        let mut client = Self {
            server_name: server_name.to_string(),
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            next_id: 1,
            state: SessionState::Ready,
            initialize_result: Value::Null,
        };

        match tokio::time::timeout(init_timeout, client.initialize()).await {
            Ok(Ok(())) => Ok(client),
            Ok(Err(error)) => {
                client.kill().await;
                Err(error)
            }
            Err(_) => {
                client.kill().await;
                Err(CoreError::Connect {
                    server: server_name.to_string(),
                    message: format!(
                        "initialize did not complete within {}s",
                        init_timeout.as_secs()
                    ),
                })
            }
        }
    }

    async fn initialize(&mut self) -> Result<(), CoreError> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": "mcpu",
                "version": env!("CARGO_PKG_VERSION"),
            },
        });
        let result = self.request("initialize", Some(params)).await?;

        let Some(peer_version) = result.get("protocolVersion").and_then(Value::as_str) else {
            return Err(CoreError::Protocol {
                server: self.server_name.clone(),
                message: "initialize reply did not report a protocol version".to_string(),
            });
        };
        if peer_version != PROTOCOL_VERSION {
            tracing::debug!(
                server = %self.server_name,
                peer_version,
                "peer reports a different MCP protocol version"
            );
        }

        self.notify("notifications/initialized", None).await?;
        self.initialize_result = result;
        Ok(())
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn initialize_result(&self) -> &Value {
        &self.initialize_result
    }

    pub async fn list_tools(&mut self) -> Result<Vec<ToolSchema>, CoreError> {
        let result = self.request("tools/list", Some(json!({}))).await?;
        let tools = result.get("tools").cloned().unwrap_or_else(|| json!([]));
        serde_json::from_value(tools).map_err(|error| CoreError::Protocol {
            server: self.server_name.clone(),
            message: format!("malformed tools/list reply: {error}"),
        })
    }

    pub async fn call_tool(
        &mut self,
        tool: &str,
        arguments: Value,
    ) -> Result<CallToolOutcome, CoreError> {
        let params = json!({ "name": tool, "arguments": arguments });
        let result = self.request("tools/call", Some(params)).await?;
        serde_json::from_value(result).map_err(|error| CoreError::Protocol {
            server: self.server_name.clone(),
            message: format!("malformed tools/call reply: {error}"),
        })
    }

    /// Send one request and read frames until its response arrives.
    async fn request(&mut self, method: &str, params: Option<Value>) -> Result<Value, CoreError> {
        if self.state == SessionState::Closed {
            return Err(self.transport_closed("session already closed"));
        }

        let id = self.next_id;
        self.next_id += 1;
        self.write_frame(&JsonRpcRequest::new(id, method, params))
            .await?;

        loop {
            let line = match self.stdout.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    return Err(self.transport_closed("connection closed by server (EOF)"));
                }
                Err(error) => {
                    return Err(self.transport_closed(&format!("read failed: {error}")));
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            let message: Value = match serde_json::from_str(line.trim()) {
                Ok(message) => message,
                Err(error) => {
                    return Err(CoreError::Protocol {
                        server: self.server_name.clone(),
                        message: format!("invalid JSON-RPC frame from server: {error}"),
                    });
                }
            };

            if let Some(peer_method) = message.get("method").and_then(Value::as_str) {
                if message.get("id").is_none() {
                    // Notification; nothing in the compact surface consumes
                    // these beyond the log.
                    tracing::debug!(server = %self.server_name, method = peer_method, "notification from server");
                    continue;
                }
                // Server-initiated request (sampling, roots). Not supported.
                let reply = crate::rpc::JsonRpcResponse::error(
                    message.get("id").cloned(),
                    -32601,
                    format!("method not supported by mcpu: {peer_method}"),
                );
                self.write_frame(&reply).await?;
                continue;
            }

            if message.get("id") != Some(&Value::from(id)) {
                tracing::warn!(
                    server = %self.server_name,
                    "discarding stale JSON-RPC response: {}",
                    line.trim()
                );
                continue;
            }

            if let Some(error) = message.get("error") {
                let code = error.get("code").and_then(Value::as_i64).unwrap_or(0);
                let text = error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error");
                return Err(CoreError::Protocol {
                    server: self.server_name.clone(),
                    message: format!("{method} failed: {text} (code {code})"),
                });
            }

            return Ok(message.get("result").cloned().unwrap_or(Value::Null));
        }
    }

    async fn notify(&mut self, method: &str, params: Option<Value>) -> Result<(), CoreError> {
        self.write_frame(&JsonRpcRequest::notification(method, params))
            .await
    }

    async fn write_frame<T: serde::Serialize>(&mut self, frame: &T) -> Result<(), CoreError> {
        let mut payload = serde_json::to_vec(frame).map_err(|error| {
            CoreError::Internal(format!("failed to serialize JSON-RPC frame: {error}"))
        })?;
        payload.push(b'\n');

        if let Err(error) = self.stdin.write_all(&payload).await {
            return Err(self.transport_closed(&format!("write failed: {error}")));
        }
        if let Err(error) = self.stdin.flush().await {
            return Err(self.transport_closed(&format!("flush failed: {error}")));
        }
        Ok(())
    }

    fn transport_closed(&mut self, cause: &str) -> CoreError {
        self.state = SessionState::Closed;
        CoreError::Transport {
            server: self.server_name.clone(),
            message: format!("transport closed: {cause}"),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    /// Close the session: drop stdin so the child sees EOF, wait up to
    /// `grace`, then kill.
    pub async fn shutdown(mut self, grace: Duration) {
        self.state = SessionState::Closed;
        drop(self.stdin);
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(_)) => {}
            Ok(Err(error)) => {
                tracing::debug!(server = %self.server_name, error = %error, "failed to wait for child");
            }
            Err(_) => {
                let _ = self.child.kill().await;
            }
        }
    }

    async fn kill(&mut self) {
        self.state = SessionState::Closed;
        let _ = self.child.kill().await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use crate::test_support::{mock_spec, write_mock_server};

    #[tokio::test]
    async fn test_connect_list_and_call() {
        let temp = tempfile::tempdir().unwrap();
        let script = write_mock_server(temp.path(), Default::default()).unwrap();

        let mut client =
            super::McpClient::connect("mock", &mock_spec(&script), Duration::from_secs(5))
                .await
                .unwrap();

        assert!(client.pid().is_some());
        assert!(client.initialize_result().get("serverInfo").is_some());

        let tools = client.list_tools().await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "echo_tool");

        let outcome = client.call_tool("echo_tool", json!({"x": 1})).await.unwrap();
        assert!(!outcome.is_error);
        assert_eq!(outcome.render_payload(), "{\"y\":2}");

        client.shutdown(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn test_connect_fails_for_missing_command() {
        let spec = mcpu_config::LaunchSpec::new("/nonexistent/mcpu-test-binary");
        let error = super::McpClient::connect("ghost", &spec, Duration::from_secs(2))
            .await
            .err()
            .unwrap();
        assert_eq!(error.kind(), "connect");
        assert!(error.to_string().contains("ghost"));
    }

    #[tokio::test]
    async fn test_eof_surfaces_transport_closed() {
        let temp = tempfile::tempdir().unwrap();
        let behavior = crate::test_support::MockBehavior {
            exit_after_initialize: true,
            ..Default::default()
        };
        let script = write_mock_server(temp.path(), behavior).unwrap();

        let mut client =
            super::McpClient::connect("flaky", &mock_spec(&script), Duration::from_secs(5))
                .await
                .unwrap();

        let error = client.list_tools().await.err().unwrap();
        assert_eq!(error.kind(), "transport");
        assert!(client.is_closed());

        // Pending requests after the close keep failing with the same kind.
        let error = client.list_tools().await.err().unwrap();
        assert_eq!(error.kind(), "transport");

        client.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_tool_error_flag_is_preserved() {
        let temp = tempfile::tempdir().unwrap();
        let behavior = crate::test_support::MockBehavior {
            call_is_error: true,
            ..Default::default()
        };
        let script = write_mock_server(temp.path(), behavior).unwrap();

        let mut client =
            super::McpClient::connect("failing", &mock_spec(&script), Duration::from_secs(5))
                .await
                .unwrap();

        let outcome = client.call_tool("echo_tool", json!({})).await.unwrap();
        assert!(outcome.is_error);

        client.shutdown(Duration::from_secs(1)).await;
    }
}
