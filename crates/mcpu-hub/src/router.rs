//! Command router: interprets the compact command surface and dispatches to
//! the pool, the cache, the batch engine, and the exec subsystem.
//!
//! Every entry point funnels into [`Router::execute`], which never panics or
//! leaks raw transport errors: failures come back as a `CoreResult` wrapping
//! the failing server and step.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use mcpu_config::ConfigHandle;
use mcpu_core::{CoreError, CoreExecutionOptions, CoreResult, ResponseMode};

use crate::args::build_call_arguments;
use crate::cache::SchemaCache;
use crate::exec::MuxDispatcher;
use crate::pool::{ConnectionPool, ConnectionState};
use crate::shape::shape_payload;
use crate::{batch, exec};

/// Unshaped outcome of one batch-legal command.
pub(crate) enum RawOutcome {
    Success(String),
    /// The child reported `isError`: the payload is preserved for the caller.
    ToolFailure { error: CoreError, payload: String },
}

#[derive(Clone)]
pub struct Router {
    config: Arc<ConfigHandle>,
    pool: Arc<ConnectionPool>,
    cache: Arc<SchemaCache>,
    request_timeout: Duration,
}

impl Router {
    pub fn new(
        config: Arc<ConfigHandle>,
        pool: Arc<ConnectionPool>,
        cache: Arc<SchemaCache>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            config,
            pool,
            cache,
            request_timeout,
        }
    }

    pub(crate) fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Run one command; all errors fold into the result shape.
    pub async fn execute(&self, opts: CoreExecutionOptions) -> CoreResult {
        match self.execute_inner(&opts).await {
            Ok(result) => result,
            Err(error) => CoreResult::from(error),
        }
    }

    async fn execute_inner(&self, opts: &CoreExecutionOptions) -> Result<CoreResult, CoreError> {
        let Some(command) = opts.argv.first() else {
            return Err(CoreError::Validation(
                "empty argv: expected a command".to_string(),
            ));
        };

        match command.as_str() {
            "servers" | "tools" | "info" | "call" => {
                let cancellation = CancellationToken::new();
                let outcome = self.execute_raw(opts, &cancellation).await?;
                self.shape_outcome(outcome, opts)
            }
            "connect" => {
                let name = single_name_arg(opts, "connect")?;
                self.pool.ensure(&name).await?;
                Ok(CoreResult::ok(format!("server '{name}' connected")))
            }
            "disconnect" => {
                let name = single_name_arg(opts, "disconnect")?;
                self.pool.disconnect(&name).await?;
                Ok(CoreResult::ok(format!("server '{name}' disconnected")))
            }
            "reconnect" => {
                let name = single_name_arg(opts, "reconnect")?;
                self.pool.reconnect(&name).await?;
                Ok(CoreResult::ok(format!("server '{name}' reconnected")))
            }
            "reload" => self.cmd_reload(opts).await,
            "batch" => batch::run(self, opts).await,
            "exec" => exec::run(self, opts).await,
            other => Err(CoreError::Validation(format!(
                "unknown command '{other}' (expected: servers, connect, disconnect, \
                 reconnect, reload, tools, info, call, batch, exec)"
            ))),
        }
    }

    /// The batch-legal subset: `servers`, `tools`, `info`, `call`.
    ///
    /// This is deliberately a separate entry point — the batch engine calls
    /// it for sub-commands, so a batch can never nest another batch.
    pub(crate) async fn execute_raw(
        &self,
        opts: &CoreExecutionOptions,
        cancellation: &CancellationToken,
    ) -> Result<RawOutcome, CoreError> {
        let Some(command) = opts.argv.first() else {
            return Err(CoreError::Validation(
                "empty argv: expected a command".to_string(),
            ));
        };

        match command.as_str() {
            "servers" => self.cmd_servers().await.map(RawOutcome::Success),
            "tools" => self
                .cmd_tools(&opts.argv[1..], cancellation)
                .await
                .map(RawOutcome::Success),
            "info" => self
                .cmd_info(&opts.argv[1..], cancellation)
                .await
                .map(RawOutcome::Success),
            "call" => self.cmd_call(opts, cancellation).await,
            other => Err(CoreError::Validation(format!(
                "command '{other}' is not allowed here (allowed: call, servers, tools, info)"
            ))),
        }
    }

    fn shape_outcome(
        &self,
        outcome: RawOutcome,
        opts: &CoreExecutionOptions,
    ) -> Result<CoreResult, CoreError> {
        match outcome {
            RawOutcome::Success(payload) => {
                let mode = response_mode_for(opts)?;
                let shaped = shape_payload(&payload, mode, opts.output_dir.as_deref())?;
                Ok(CoreResult::ok(shaped.render()))
            }
            RawOutcome::ToolFailure { error, payload } => {
                Ok(CoreResult::failed_with_output(&error, payload))
            }
        }
    }

    async fn cmd_servers(&self) -> Result<String, CoreError> {
        let mut entries = Vec::new();
        for (name, status) in self.pool.states().await {
            let mut entry = json!({ "name": name, "state": status.state });
            if let Some(pid) = status.pid {
                entry["pid"] = pid.into();
            }
            if let Some(count) = self.cache.peek_count(&name).await {
                entry["tools"] = count.into();
            }
            if let Some(last_error) = status.last_error {
                entry["lastError"] = last_error.into();
            }
            if let Some(last_activity) = status.last_activity {
                entry["lastActivity"] = last_activity.to_rfc3339().into();
            }
            entries.push(entry);
        }
        Ok(Value::Array(entries).to_string())
    }

    /// Compact per-server tool listing; full descriptors come from `info`.
    async fn cmd_tools(
        &self,
        names: &[String],
        cancellation: &CancellationToken,
    ) -> Result<String, CoreError> {
        let snapshot = self.config.snapshot();
        let targets: Vec<String> = if names.is_empty() {
            self.pool
                .states()
                .await
                .into_iter()
                .filter(|(_, status)| status.state == ConnectionState::Ready)
                .map(|(name, _)| name)
                .collect()
        } else {
            names.to_vec()
        };

        let mut listing = serde_json::Map::new();
        for name in targets {
            let spec = snapshot
                .lookup(&name)
                .ok_or_else(|| CoreError::NotFound(format!("unknown server '{name}'")))?;
            let tools = self.cache.get(&name, spec, cancellation.child_token()).await?;
            let compact: Vec<Value> = tools
                .iter()
                .map(|tool| json!({ "name": tool.name, "description": tool.brief() }))
                .collect();
            listing.insert(name, Value::Array(compact));
        }
        Ok(Value::Object(listing).to_string())
    }

    /// Full descriptors for one server's tools (all of them, or a selection).
    async fn cmd_info(
        &self,
        args: &[String],
        cancellation: &CancellationToken,
    ) -> Result<String, CoreError> {
        let Some(name) = args.first() else {
            return Err(CoreError::Validation(
                "info requires a server name".to_string(),
            ));
        };
        let snapshot = self.config.snapshot();
        let spec = snapshot
            .lookup(name)
            .ok_or_else(|| CoreError::NotFound(format!("unknown server '{name}'")))?;
        let tools = self.cache.get(name, spec, cancellation.child_token()).await?;

        let selected: Vec<&crate::rpc::ToolSchema> = if args.len() > 1 {
            args[1..]
                .iter()
                .map(|wanted| {
                    tools.iter().find(|tool| &tool.name == wanted).ok_or_else(|| {
                        CoreError::NotFound(format!(
                            "tool '{wanted}' not found on server '{name}'"
                        ))
                    })
                })
                .collect::<Result<_, _>>()?
        } else {
            tools.iter().collect()
        };

        serde_json::to_string(&selected)
            .map_err(|error| CoreError::Internal(format!("failed to serialize tool info: {error}")))
    }

    /// `call <server> <tool> [--flags]`: parse, lookup, dispatch through the
    /// pool (which enforces handle exclusivity), classify the outcome.
    async fn cmd_call(
        &self,
        opts: &CoreExecutionOptions,
        cancellation: &CancellationToken,
    ) -> Result<RawOutcome, CoreError> {
        if opts.argv.len() < 3 {
            return Err(CoreError::Validation(
                "call requires a server name and a tool name".to_string(),
            ));
        }
        let server = opts.argv[1].clone();
        let tool = opts.argv[2].clone();

        let arguments = if params_are_call_arguments(opts) {
            match opts.params.clone() {
                Some(params) if params.is_object() => params,
                Some(_) => {
                    return Err(CoreError::Validation(
                        "call params must be a JSON object of tool arguments".to_string(),
                    ));
                }
                None => json!({}),
            }
        } else {
            build_call_arguments(&opts.argv[3..], opts.stdin_data.as_deref())?
        };

        if self.config.snapshot().lookup(&server).is_none() {
            return Err(CoreError::NotFound(format!("unknown server '{server}'")));
        }

        let call_timeout = call_timeout_for(opts).unwrap_or(self.request_timeout);
        let call_token = cancellation.child_token();
        let call = self
            .pool
            .call_tool(&server, &tool, arguments, call_token.clone());

        match tokio::time::timeout(call_timeout, call).await {
            Err(_) => {
                call_token.cancel();
                Err(CoreError::Timeout(format!(
                    "call to '{server}.{tool}' timed out after {}ms",
                    call_timeout.as_millis()
                )))
            }
            Ok(Err(error)) => Err(error),
            Ok(Ok(outcome)) => {
                let payload = outcome.render_payload();
                if outcome.is_error {
                    Ok(RawOutcome::ToolFailure {
                        error: CoreError::Tool { server, tool },
                        payload,
                    })
                } else {
                    Ok(RawOutcome::Success(payload))
                }
            }
        }
    }

    /// `reload`: clear the schema cache (one server, or everything plus a
    /// fresh config snapshot).
    async fn cmd_reload(&self, opts: &CoreExecutionOptions) -> Result<CoreResult, CoreError> {
        match opts.argv.get(1) {
            Some(name) => {
                if self.config.snapshot().lookup(name).is_none() {
                    return Err(CoreError::NotFound(format!("unknown server '{name}'")));
                }
                self.cache.reload(Some(name)).await;
                Ok(CoreResult::ok(format!(
                    "schema cache cleared for server '{name}'"
                )))
            }
            None => {
                self.config.reload().map_err(|error| {
                    CoreError::Internal(format!("config reload failed: {error:#}"))
                })?;
                self.cache.reload(None).await;
                let count = self.config.snapshot().len();
                Ok(CoreResult::ok(format!(
                    "config reloaded ({count} servers), schema cache cleared"
                )))
            }
        }
    }
}

/// In the facade path `call` receives its arguments object via `params`;
/// inline flags and piped stdin take precedence when present.
fn params_are_call_arguments(opts: &CoreExecutionOptions) -> bool {
    opts.argv.first().map(String::as_str) == Some("call")
        && opts.argv.len() <= 3
        && opts.stdin_data.is_none()
        && opts.params.is_some()
}

fn response_mode_for(opts: &CoreExecutionOptions) -> Result<ResponseMode, CoreError> {
    if params_are_call_arguments(opts) {
        return Ok(ResponseMode::Auto);
    }
    match opts
        .params
        .as_ref()
        .and_then(|params| params.get("response_mode"))
        .and_then(Value::as_str)
    {
        Some(raw) => raw.parse(),
        None => Ok(ResponseMode::Auto),
    }
}

fn call_timeout_for(opts: &CoreExecutionOptions) -> Option<Duration> {
    if params_are_call_arguments(opts) {
        return None;
    }
    opts.params
        .as_ref()
        .and_then(|params| params.get("timeout_ms"))
        .and_then(Value::as_u64)
        .map(Duration::from_millis)
}

fn single_name_arg(opts: &CoreExecutionOptions, command: &str) -> Result<String, CoreError> {
    if opts.argv.len() != 2 {
        return Err(CoreError::Validation(format!(
            "{command} requires exactly one server name"
        )));
    }
    Ok(opts.argv[1].clone())
}

#[async_trait]
impl MuxDispatcher for Router {
    async fn dispatch(&self, opts: CoreExecutionOptions) -> CoreResult {
        if opts.argv.first().map(String::as_str) == Some("exec") {
            return CoreResult::from(CoreError::Validation(
                "exec is not allowed from exec".to_string(),
            ));
        }
        self.execute(opts).await
    }
}

#[cfg(test)]
#[path = "router_tests.rs"]
mod tests;
