//! Connection pool: owns every live child MCP client and serialises all
//! traffic to each one.
//!
//! Each server gets a worker task fed by an mpsc queue. The queue is the
//! exclusive handle: commands are processed one at a time in FIFO order, so
//! no two JSON-RPC calls ever overlap on one child's stream and waiters are
//! served fairly. State transitions happen only inside the worker, which
//! linearises them per server; different servers are fully independent.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use mcpu_config::ConfigHandle;
use mcpu_core::CoreError;

use crate::cache::ToolFetcher;
use crate::client::McpClient;
use crate::rpc::{CallToolOutcome, ToolSchema};

const REQUEST_QUEUE_CAPACITY: usize = 64;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_CLOSE_DEADLINE_SECS: u64 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Ready,
    Failed,
    Closing,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub state: ConnectionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<chrono::DateTime<chrono::Utc>>,
}

impl Default for ServerStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            pid: None,
            last_error: None,
            last_activity: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PoolOptions {
    /// Deadline for initialize and for each wire request.
    pub request_timeout: Duration,
    /// Grace period for a child to exit on close before it is killed.
    pub close_deadline: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            close_deadline: Duration::from_secs(DEFAULT_CLOSE_DEADLINE_SECS),
        }
    }
}

pub struct ConnectionPool {
    config: Arc<ConfigHandle>,
    options: PoolOptions,
    slots: Mutex<HashMap<String, SlotHandle>>,
}

#[derive(Clone)]
struct SlotHandle {
    sender: mpsc::Sender<SlotCommand>,
    status: Arc<std::sync::Mutex<ServerStatus>>,
}

enum SlotCommandKind {
    Ensure { recover: bool },
    ListTools,
    CallTool { tool: String, arguments: Value },
    Disconnect,
    Shutdown,
}

struct SlotCommand {
    kind: SlotCommandKind,
    cancellation: CancellationToken,
    respond: oneshot::Sender<Result<SlotResponse, CoreError>>,
}

enum SlotResponse {
    Done,
    Tools(Vec<ToolSchema>),
    Call(CallToolOutcome),
}

impl ConnectionPool {
    pub fn new(config: Arc<ConfigHandle>, options: PoolOptions) -> Self {
        Self {
            config,
            options,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Explicitly drive the server to `ready` (recovers a `failed` slot).
    pub async fn ensure(&self, name: &str) -> Result<(), CoreError> {
        match self
            .request(
                name,
                SlotCommandKind::Ensure { recover: true },
                CancellationToken::new(),
            )
            .await?
        {
            SlotResponse::Done => Ok(()),
            _ => Err(unexpected_response(name)),
        }
    }

    /// Drain the current in-flight request, shut the child down, return the
    /// slot to `disconnected`.
    pub async fn disconnect(&self, name: &str) -> Result<(), CoreError> {
        match self
            .request(name, SlotCommandKind::Disconnect, CancellationToken::new())
            .await?
        {
            SlotResponse::Done => Ok(()),
            _ => Err(unexpected_response(name)),
        }
    }

    pub async fn reconnect(&self, name: &str) -> Result<(), CoreError> {
        self.disconnect(name).await?;
        self.ensure(name).await
    }

    pub async fn list_tools(
        &self,
        name: &str,
        cancellation: CancellationToken,
    ) -> Result<Vec<ToolSchema>, CoreError> {
        match self
            .request(name, SlotCommandKind::ListTools, cancellation)
            .await?
        {
            SlotResponse::Tools(tools) => Ok(tools),
            _ => Err(unexpected_response(name)),
        }
    }

    pub async fn call_tool(
        &self,
        name: &str,
        tool: &str,
        arguments: Value,
        cancellation: CancellationToken,
    ) -> Result<CallToolOutcome, CoreError> {
        match self
            .request(
                name,
                SlotCommandKind::CallTool {
                    tool: tool.to_string(),
                    arguments,
                },
                cancellation,
            )
            .await?
        {
            SlotResponse::Call(outcome) => Ok(outcome),
            _ => Err(unexpected_response(name)),
        }
    }

    pub async fn status(&self, name: &str) -> ServerStatus {
        let slots = self.slots.lock().await;
        slots
            .get(name)
            .map(|slot| slot.status())
            .unwrap_or_default()
    }

    /// Status of every configured server, in config (sorted) order.
    pub async fn states(&self) -> Vec<(String, ServerStatus)> {
        let names = self.config.snapshot().list();
        let slots = self.slots.lock().await;
        names
            .into_iter()
            .map(|name| {
                let status = slots
                    .get(&name)
                    .map(|slot| slot.status())
                    .unwrap_or_default();
                (name, status)
            })
            .collect()
    }

    /// Close every slot; used on daemon shutdown.
    pub async fn shutdown_all(&self) {
        let drained: Vec<(String, SlotHandle)> = {
            let mut slots = self.slots.lock().await;
            slots.drain().collect()
        };
        for (name, slot) in drained {
            let (respond, response) = oneshot::channel();
            let command = SlotCommand {
                kind: SlotCommandKind::Shutdown,
                cancellation: CancellationToken::new(),
                respond,
            };
            if slot.sender.send(command).await.is_ok() {
                let _ = response.await;
            } else {
                tracing::debug!(server = %name, "server worker already stopped");
            }
        }
    }

    async fn slot(&self, name: &str) -> Result<SlotHandle, CoreError> {
        let mut slots = self.slots.lock().await;
        if let Some(slot) = slots.get(name) {
            return Ok(slot.clone());
        }
        if self.config.snapshot().lookup(name).is_none() {
            return Err(CoreError::NotFound(format!("unknown server '{name}'")));
        }

        let (sender, receiver) = mpsc::channel(REQUEST_QUEUE_CAPACITY);
        let status = Arc::new(std::sync::Mutex::new(ServerStatus::default()));
        let worker = SlotWorker {
            name: name.to_string(),
            config: self.config.clone(),
            options: self.options,
            status: status.clone(),
        };
        tokio::spawn(worker.run(receiver));

        let slot = SlotHandle { sender, status };
        slots.insert(name.to_string(), slot.clone());
        Ok(slot)
    }

    async fn request(
        &self,
        name: &str,
        kind: SlotCommandKind,
        cancellation: CancellationToken,
    ) -> Result<SlotResponse, CoreError> {
        let slot = self.slot(name).await?;
        if cancellation.is_cancelled() {
            return Err(CoreError::Cancelled(format!(
                "request for server '{name}' cancelled before enqueue"
            )));
        }

        let (respond, response) = oneshot::channel();
        let command = SlotCommand {
            kind,
            cancellation: cancellation.clone(),
            respond,
        };

        tokio::select! {
            _ = cancellation.cancelled() => {
                return Err(CoreError::Cancelled(format!(
                    "request for server '{name}' cancelled while waiting for the queue"
                )));
            }
            sent = slot.sender.send(command) => {
                if sent.is_err() {
                    return Err(CoreError::Internal(format!("server worker stopped: {name}")));
                }
            }
        }

        tokio::select! {
            _ = cancellation.cancelled() => Err(CoreError::Cancelled(format!(
                "request for server '{name}' cancelled while waiting for a response"
            ))),
            result = response => match result {
                Ok(result) => result,
                Err(_) => Err(CoreError::Internal(format!(
                    "server worker dropped the response channel: {name}"
                ))),
            },
        }
    }
}

impl SlotHandle {
    fn status(&self) -> ServerStatus {
        self.status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

fn unexpected_response(name: &str) -> CoreError {
    CoreError::Internal(format!("unexpected worker response for server '{name}'"))
}

#[async_trait]
impl ToolFetcher for ConnectionPool {
    async fn fetch(
        &self,
        server_name: &str,
        cancellation: CancellationToken,
    ) -> Result<Vec<ToolSchema>, CoreError> {
        self.list_tools(server_name, cancellation).await
    }
}

enum IoOutcome<T> {
    Cancelled,
    TimedOut,
    Done(Result<T, CoreError>),
}

struct SlotWorker {
    name: String,
    config: Arc<ConfigHandle>,
    options: PoolOptions,
    status: Arc<std::sync::Mutex<ServerStatus>>,
}

impl SlotWorker {
    async fn run(self, mut receiver: mpsc::Receiver<SlotCommand>) {
        let mut client: Option<McpClient> = None;

        while let Some(command) = receiver.recv().await {
            match command.kind {
                SlotCommandKind::Shutdown => {
                    self.close_client(&mut client, ConnectionState::Disconnected, None)
                        .await;
                    let _ = command.respond.send(Ok(SlotResponse::Done));
                    break;
                }
                SlotCommandKind::Disconnect => {
                    self.set_state(ConnectionState::Closing, None, None);
                    self.close_client(&mut client, ConnectionState::Disconnected, None)
                        .await;
                    let _ = command.respond.send(Ok(SlotResponse::Done));
                }
                SlotCommandKind::Ensure { recover } => {
                    let result = self
                        .ensure_client(&mut client, recover)
                        .await
                        .map(|_| SlotResponse::Done);
                    let _ = command.respond.send(result);
                }
                SlotCommandKind::ListTools => {
                    let result = self.dispatch_list(&mut client, &command.cancellation).await;
                    let _ = command.respond.send(result);
                }
                SlotCommandKind::CallTool { tool, arguments } => {
                    let result = self
                        .dispatch_call(&mut client, &tool, arguments, &command.cancellation)
                        .await;
                    let _ = command.respond.send(result);
                }
            }
        }

        if let Some(session) = client.take() {
            session.shutdown(self.options.close_deadline).await;
        }
        tracing::debug!(server = %self.name, "server worker stopped");
    }

    /// Make sure a live client exists.
    ///
    /// Lazy first use connects from `disconnected`; a `failed` slot replays
    /// its stored cause unless `recover` is set (explicit connect/reconnect).
    async fn ensure_client(
        &self,
        client: &mut Option<McpClient>,
        recover: bool,
    ) -> Result<(), CoreError> {
        if let Some(existing) = client.as_ref() {
            if !existing.is_closed() {
                return Ok(());
            }
            if let Some(stale) = client.take() {
                stale.shutdown(Duration::ZERO).await;
            }
        }

        if !recover {
            let failed_cause = {
                let status = self.lock_status();
                (status.state == ConnectionState::Failed)
                    .then(|| status.last_error.clone().unwrap_or_default())
            };
            if let Some(cause) = failed_cause {
                return Err(CoreError::Connect {
                    server: self.name.clone(),
                    message: format!(
                        "connection previously failed ({cause}); run 'reconnect {}'",
                        self.name
                    ),
                });
            }
        }

        let Some(spec) = self.config.snapshot().lookup(&self.name).cloned() else {
            self.set_state(ConnectionState::Disconnected, None, None);
            return Err(CoreError::NotFound(format!(
                "unknown server '{}'",
                self.name
            )));
        };

        self.set_state(ConnectionState::Connecting, None, None);
        match McpClient::connect(&self.name, &spec, self.options.request_timeout).await {
            Ok(session) => {
                self.set_state(ConnectionState::Ready, session.pid(), None);
                *client = Some(session);
                Ok(())
            }
            Err(error) => {
                // Never became a connection: the slot stays disconnected and
                // the next use may retry. No retry at this layer.
                self.set_state(ConnectionState::Disconnected, None, Some(error.to_string()));
                Err(error)
            }
        }
    }

    async fn dispatch_list(
        &self,
        client: &mut Option<McpClient>,
        cancellation: &CancellationToken,
    ) -> Result<SlotResponse, CoreError> {
        self.ensure_client(client, false).await?;
        let outcome = {
            let Some(session) = client.as_mut() else {
                return Err(unexpected_response(&self.name));
            };
            let request = session.list_tools();
            tokio::select! {
                _ = cancellation.cancelled() => IoOutcome::Cancelled,
                result = tokio::time::timeout(self.options.request_timeout, request) => match result {
                    Ok(inner) => IoOutcome::Done(inner),
                    Err(_) => IoOutcome::TimedOut,
                }
            }
        };
        self.settle(client, outcome.map_done(SlotResponse::Tools))
            .await
    }

    async fn dispatch_call(
        &self,
        client: &mut Option<McpClient>,
        tool: &str,
        arguments: Value,
        cancellation: &CancellationToken,
    ) -> Result<SlotResponse, CoreError> {
        self.ensure_client(client, false).await?;
        let outcome = {
            let Some(session) = client.as_mut() else {
                return Err(unexpected_response(&self.name));
            };
            let request = session.call_tool(tool, arguments);
            tokio::select! {
                _ = cancellation.cancelled() => IoOutcome::Cancelled,
                result = tokio::time::timeout(self.options.request_timeout, request) => match result {
                    Ok(inner) => IoOutcome::Done(inner),
                    Err(_) => IoOutcome::TimedOut,
                }
            }
        };
        self.settle(client, outcome.map_done(SlotResponse::Call))
            .await
    }

    /// Fold an I/O outcome into the slot state.
    ///
    /// A timed-out or cancelled request leaves an unsynchronised stream
    /// behind, so the connection is closed rather than reused: timeout marks
    /// the slot `failed`, cancellation returns it to `disconnected`.
    async fn settle(
        &self,
        client: &mut Option<McpClient>,
        outcome: IoOutcome<SlotResponse>,
    ) -> Result<SlotResponse, CoreError> {
        match outcome {
            IoOutcome::Done(Ok(response)) => {
                self.lock_status().last_activity = Some(chrono::Utc::now());
                Ok(response)
            }
            IoOutcome::Done(Err(error)) => {
                let broken = matches!(error, CoreError::Transport { .. })
                    || client.as_ref().is_some_and(McpClient::is_closed);
                if broken {
                    if let Some(session) = client.take() {
                        session.shutdown(Duration::ZERO).await;
                    }
                    self.set_state(ConnectionState::Failed, None, Some(error.to_string()));
                }
                Err(error)
            }
            IoOutcome::TimedOut => {
                self.close_client(
                    client,
                    ConnectionState::Failed,
                    Some("request timed out".to_string()),
                )
                .await;
                Err(CoreError::Timeout(format!(
                    "server '{}' did not respond within {}s",
                    self.name,
                    self.options.request_timeout.as_secs()
                )))
            }
            IoOutcome::Cancelled => {
                self.close_client(
                    client,
                    ConnectionState::Disconnected,
                    Some("request cancelled mid-call".to_string()),
                )
                .await;
                Err(CoreError::Cancelled(format!(
                    "request to server '{}' cancelled",
                    self.name
                )))
            }
        }
    }

    async fn close_client(
        &self,
        client: &mut Option<McpClient>,
        next: ConnectionState,
        cause: Option<String>,
    ) {
        if let Some(session) = client.take() {
            session.shutdown(self.options.close_deadline).await;
        }
        self.set_state(next, None, cause);
    }

    fn set_state(&self, state: ConnectionState, pid: Option<u32>, last_error: Option<String>) {
        let mut status = self.lock_status();
        status.state = state;
        status.pid = pid;
        status.last_error = last_error;
    }

    fn lock_status(&self) -> std::sync::MutexGuard<'_, ServerStatus> {
        self.status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<T> IoOutcome<T> {
    fn map_done<U>(self, f: impl FnOnce(T) -> U) -> IoOutcome<U> {
        match self {
            Self::Cancelled => IoOutcome::Cancelled,
            Self::TimedOut => IoOutcome::TimedOut,
            Self::Done(result) => IoOutcome::Done(result.map(f)),
        }
    }
}

#[cfg(test)]
#[path = "pool_tests.rs"]
mod tests;
