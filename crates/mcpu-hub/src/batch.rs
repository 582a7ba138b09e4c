//! Batch engine: fan out many sub-commands with per-server serialization and
//! a global concurrency cap.
//!
//! Calls are grouped by target server; groups run as independent tasks under
//! a semaphore, while sub-calls inside a group run serially in lexicographic
//! id order. Individual failures never abort the batch.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use mcpu_core::{CoreError, CoreExecutionOptions, CoreResult, ResponseMode};

use crate::router::{RawOutcome, Router};
use crate::shape::shape_payload;

pub const MAX_BATCH_SIZE: usize = 50;
pub const MAX_CONCURRENT_SERVERS: usize = 10;

/// Group key for `servers` and server-less `tools` sub-calls. These share
/// one group and therefore serialise; documented behaviour, kept as-is.
const GLOBAL_GROUP: &str = "__global__";

const ALLOWED_COMMANDS: [&str; 4] = ["call", "servers", "tools", "info"];
const MUTATING_COMMANDS: [&str; 5] = [
    "connect",
    "disconnect",
    "reconnect",
    "reload",
    "setConfig",
];

/// Grace period for groups to observe cancellation after the deadline.
const CANCEL_DRAIN: Duration = Duration::from_secs(1);

#[derive(Debug, Deserialize)]
struct BatchParams {
    calls: BTreeMap<String, BatchCall>,
    #[serde(default)]
    response_mode: Option<ResponseMode>,
    #[serde(default, alias = "timeout_ms")]
    timeout: Option<u64>,
    #[serde(default)]
    max_parallel_servers: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
struct BatchCall {
    argv: Vec<String>,
    #[serde(default)]
    params: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchCallResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub truncated: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BatchOutput {
    pub summary: BatchSummary,
    pub order: Vec<String>,
    pub results: BTreeMap<String, BatchCallResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saved_files: Option<Vec<PathBuf>>,
    #[serde(
        rename = "timedOut",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub timed_out: Option<bool>,
}

pub(crate) async fn run(
    router: &Router,
    opts: &CoreExecutionOptions,
) -> Result<CoreResult, CoreError> {
    let params = parse_params(opts)?;
    validate(&params)?;

    let cap = params
        .max_parallel_servers
        .unwrap_or(MAX_CONCURRENT_SERVERS)
        .max(1);
    let groups = group_by_server(&params.calls);
    if groups.len() > cap {
        return Err(CoreError::Validation(format!(
            "batch targets {} distinct servers, exceeds limit {cap}",
            groups.len()
        )));
    }

    let mode = params.response_mode.unwrap_or_default();
    let order: Vec<String> = params.calls.keys().cloned().collect();
    let results: Arc<Mutex<BTreeMap<String, BatchCallResult>>> =
        Arc::new(Mutex::new(BTreeMap::new()));
    let cancellation = CancellationToken::new();
    let semaphore = Arc::new(Semaphore::new(cap));
    let mut tasks = JoinSet::new();

    for (server, group) in groups {
        let router = router.clone();
        let results = results.clone();
        let cancellation = cancellation.clone();
        let semaphore = semaphore.clone();
        let cwd = opts.cwd.clone();
        let output_dir = opts.output_dir.clone();

        tasks.spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return;
            };
            tracing::debug!(group = %server, calls = group.len(), "batch group started");
            for (id, call) in group {
                if cancellation.is_cancelled() {
                    break;
                }
                let sub_opts = CoreExecutionOptions {
                    argv: call.argv,
                    params: call.params,
                    cwd: cwd.clone(),
                    stdin_data: None,
                    output_dir: output_dir.clone(),
                };
                let outcome = router.execute_raw(&sub_opts, &cancellation).await;
                let entry = shape_sub_result(outcome, mode, output_dir.as_deref());
                results.lock().await.insert(id, entry);
            }
        });
    }

    let timed_out = match params.timeout {
        Some(ms) => {
            let deadline = Duration::from_millis(ms);
            let drained = async {
                while tasks.join_next().await.is_some() {}
            };
            match tokio::time::timeout(deadline, drained).await {
                Ok(()) => false,
                Err(_) => {
                    cancellation.cancel();
                    let drain_rest = async {
                        while tasks.join_next().await.is_some() {}
                    };
                    if tokio::time::timeout(CANCEL_DRAIN, drain_rest).await.is_err() {
                        tasks.abort_all();
                        while tasks.join_next().await.is_some() {}
                    }
                    true
                }
            }
        }
        None => {
            while let Some(joined) = tasks.join_next().await {
                if let Err(error) = joined {
                    tracing::warn!(error = %error, "batch group task failed");
                }
            }
            false
        }
    };

    let mut map = {
        let mut guard = results.lock().await;
        std::mem::take(&mut *guard)
    };
    for id in &order {
        map.entry(id.clone()).or_insert_with(|| BatchCallResult {
            success: false,
            output: None,
            error: Some("cancelled: batch deadline exceeded".to_string()),
            file: None,
            truncated: None,
        });
    }

    let succeeded = map.values().filter(|entry| entry.success).count();
    let saved: BTreeSet<PathBuf> = map.values().filter_map(|entry| entry.file.clone()).collect();
    let output = BatchOutput {
        summary: BatchSummary {
            total: order.len(),
            succeeded,
            failed: order.len() - succeeded,
        },
        order,
        results: map,
        saved_files: (!saved.is_empty()).then(|| saved.into_iter().collect()),
        timed_out: timed_out.then_some(true),
    };

    let body = serde_json::to_string(&output)
        .map_err(|error| CoreError::Internal(format!("failed to serialize batch output: {error}")))?;
    Ok(CoreResult::ok(body))
}

fn parse_params(opts: &CoreExecutionOptions) -> Result<BatchParams, CoreError> {
    let Some(params) = opts.params.clone() else {
        return Err(CoreError::Validation(
            "batch requires params with a 'calls' map".to_string(),
        ));
    };
    serde_json::from_value(params)
        .map_err(|error| CoreError::Validation(format!("malformed batch params: {error}")))
}

fn validate(params: &BatchParams) -> Result<(), CoreError> {
    if params.calls.is_empty() {
        return Err(CoreError::Validation("batch contains no calls".to_string()));
    }
    if params.calls.len() > MAX_BATCH_SIZE {
        return Err(CoreError::Validation(format!(
            "batch size {} exceeds limit {MAX_BATCH_SIZE}",
            params.calls.len()
        )));
    }

    for (id, call) in &params.calls {
        let Some(command) = call.argv.first() else {
            return Err(CoreError::Validation(format!("call '{id}': empty argv")));
        };
        if command == "batch" {
            return Err(CoreError::Validation(format!(
                "call '{id}': nested batch is not allowed"
            )));
        }
        if MUTATING_COMMANDS.contains(&command.as_str()) {
            return Err(CoreError::Validation(format!(
                "call '{id}': mutating command '{command}' is not allowed in batch"
            )));
        }
        if !ALLOWED_COMMANDS.contains(&command.as_str()) {
            return Err(CoreError::Validation(format!(
                "call '{id}': command '{command}' is not allowed in batch \
                 (allowed: call, servers, tools, info)"
            )));
        }
        if matches!(command.as_str(), "call" | "info") && call.argv.len() < 2 {
            return Err(CoreError::Validation(format!(
                "call '{id}': '{command}' requires a server name"
            )));
        }
    }
    Ok(())
}

/// Target server for grouping: 2nd positional for `call`/`info`, optional 2nd
/// for `tools`, the global sentinel otherwise.
fn extract_server(argv: &[String]) -> &str {
    match argv.first().map(String::as_str) {
        Some("call") | Some("info") => argv.get(1).map(String::as_str).unwrap_or(GLOBAL_GROUP),
        Some("tools") => argv.get(1).map(String::as_str).unwrap_or(GLOBAL_GROUP),
        _ => GLOBAL_GROUP,
    }
}

/// Group calls by server; ids inside each group keep their lexicographic
/// order (the `BTreeMap` iteration order of the input).
fn group_by_server(
    calls: &BTreeMap<String, BatchCall>,
) -> BTreeMap<String, Vec<(String, BatchCall)>> {
    let mut groups: BTreeMap<String, Vec<(String, BatchCall)>> = BTreeMap::new();
    for (id, call) in calls {
        let server = extract_server(&call.argv).to_string();
        groups
            .entry(server)
            .or_default()
            .push((id.clone(), call.clone()));
    }
    groups
}

fn shape_sub_result(
    outcome: Result<RawOutcome, CoreError>,
    mode: ResponseMode,
    output_dir: Option<&Path>,
) -> BatchCallResult {
    match outcome {
        Ok(RawOutcome::Success(payload)) => match shape_payload(&payload, mode, output_dir) {
            Ok(shaped) => BatchCallResult {
                success: true,
                output: Some(match &shaped.inline {
                    Some(inline) => serde_json::from_str(inline)
                        .unwrap_or_else(|_| Value::String(inline.clone())),
                    None => Value::String(shaped.preview.clone().unwrap_or_default()),
                }),
                error: None,
                file: shaped.file,
                truncated: shaped.truncated.then_some(true),
            },
            Err(error) => BatchCallResult {
                success: false,
                output: None,
                error: Some(error.to_string()),
                file: None,
                truncated: None,
            },
        },
        Ok(RawOutcome::ToolFailure { error, payload }) => BatchCallResult {
            success: false,
            output: serde_json::from_str(&payload)
                .ok()
                .or(Some(Value::String(payload))),
            error: Some(error.to_string()),
            file: None,
            truncated: None,
        },
        Err(error) => BatchCallResult {
            success: false,
            output: None,
            error: Some(error.to_string()),
            file: None,
            truncated: None,
        },
    }
}

#[cfg(test)]
#[path = "batch_tests.rs"]
mod tests;
