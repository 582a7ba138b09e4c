//! Exec subsystem: run a short user script in a worker process with an
//! IPC-mediated `mcpuMux` callback into the router.
//!
//! The worker is a `node` process in its own process group (so a timeout
//! kill takes the whole tree), started from a generated bootstrap that
//! injects `mcpuMux(opts)` and a cwd-scoped `mcpuRequire`. IPC is
//! newline-delimited JSON: the worker sends `mux` requests with monotone ids
//! and one final `done`; the daemon replies with `result` frames, possibly
//! out of order since each mux request is dispatched on its own task.
//!
//! Isolation is process separation and cwd scoping only; the worker is not
//! prevented from touching the filesystem or network.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use mcpu_core::{CoreError, CoreExecutionOptions, CoreResult, EXIT_ERROR};

use crate::router::Router;

pub const DEFAULT_EXEC_TIMEOUT_MS: u64 = 30_000;
const WORKER_RUNTIME: &str = "node";
const REAP_GRACE: Duration = Duration::from_secs(3);

/// Seam through which worker `mux` requests re-enter the command surface.
///
/// Boxing the dispatch future here is what lets exec and the router call
/// each other without an infinitely recursive future type.
#[async_trait]
pub trait MuxDispatcher: Send + Sync {
    async fn dispatch(&self, opts: CoreExecutionOptions) -> CoreResult;
}

#[derive(Debug, Deserialize)]
struct ExecParams {
    #[serde(default)]
    file: Option<String>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    cwd: Option<String>,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

/// Worker -> daemon frames.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum WorkerMessage {
    Mux {
        id: u64,
        #[serde(default)]
        argv: Option<Vec<String>>,
        #[serde(default)]
        params: Option<Value>,
        #[serde(default)]
        batch: Option<Value>,
    },
    Done {
        #[serde(default)]
        value: Option<Value>,
        #[serde(default)]
        error: Option<String>,
    },
}

pub(crate) async fn run(
    router: &Router,
    opts: &CoreExecutionOptions,
) -> Result<CoreResult, CoreError> {
    let Some(raw_params) = opts.params.clone() else {
        return Err(CoreError::Validation(
            "exec requires params with 'code' or 'file'".to_string(),
        ));
    };
    let params: ExecParams = serde_json::from_value(raw_params)
        .map_err(|error| CoreError::Validation(format!("malformed exec params: {error}")))?;

    let cwd = params
        .cwd
        .map(PathBuf::from)
        .or_else(|| opts.cwd.clone())
        .map(Ok)
        .unwrap_or_else(|| {
            std::env::current_dir()
                .map_err(|error| CoreError::Internal(format!("cannot resolve cwd: {error}")))
        })?;

    let code = match (params.code, params.file) {
        (Some(_), Some(_)) | (None, None) => {
            return Err(CoreError::Validation(
                "exec requires exactly one of 'code' or 'file'".to_string(),
            ));
        }
        (Some(code), None) => code,
        (None, Some(file)) => {
            let path = resolve_against(&cwd, &file);
            std::fs::read_to_string(&path).map_err(|error| {
                CoreError::NotFound(format!("exec file '{}': {error}", path.display()))
            })?
        }
    };

    let timeout_ms = params.timeout_ms.unwrap_or(DEFAULT_EXEC_TIMEOUT_MS);
    let dispatcher: Arc<dyn MuxDispatcher> = Arc::new(router.clone());
    run_worker(dispatcher, &code, &cwd, timeout_ms, opts).await
}

async fn run_worker(
    dispatcher: Arc<dyn MuxDispatcher>,
    code: &str,
    cwd: &Path,
    timeout_ms: u64,
    parent: &CoreExecutionOptions,
) -> Result<CoreResult, CoreError> {
    let node = which::which(WORKER_RUNTIME).map_err(|_| {
        CoreError::Internal(format!(
            "'{WORKER_RUNTIME}' not found in PATH (required by exec)"
        ))
    })?;

    let mut script_file = tempfile::Builder::new()
        .prefix("mcpu-exec-")
        .suffix(".cjs")
        .tempfile()
        .map_err(|error| CoreError::Internal(format!("cannot create worker script: {error}")))?;
    script_file
        .write_all(render_bootstrap(code, cwd).as_bytes())
        .and_then(|_| script_file.flush())
        .map_err(|error| CoreError::Internal(format!("cannot write worker script: {error}")))?;

    let mut cmd = Command::new(node);
    cmd.arg(script_file.path())
        .current_dir(cwd)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);
    // SAFETY: setsid is async-signal-safe and runs before exec; it puts the
    // worker in its own process group so the timeout kill reaps the tree.
    #[cfg(unix)]
    unsafe {
        cmd.pre_exec(|| {
            libc::setsid();
            Ok(())
        });
    }

    let mut child = cmd
        .spawn()
        .map_err(|error| CoreError::Internal(format!("failed to spawn exec worker: {error}")))?;

    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!("exec worker stderr: {line}");
            }
        });
    }
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| CoreError::Internal("failed to capture worker stdin".to_string()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| CoreError::Internal("failed to capture worker stdout".to_string()))?;
    let mut reader = BufReader::new(stdout).lines();

    // Mux replies land here from concurrent dispatch tasks; a single writer
    // task owns the pipe.
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        let mut stdin = stdin;
        while let Some(line) = reply_rx.recv().await {
            if stdin.write_all(line.as_bytes()).await.is_err()
                || stdin.write_all(b"\n").await.is_err()
                || stdin.flush().await.is_err()
            {
                break;
            }
        }
    });

    let deadline = Duration::from_millis(timeout_ms);
    let driven = tokio::time::timeout(
        deadline,
        drive(dispatcher, &mut reader, reply_tx.clone(), parent),
    )
    .await;
    drop(reply_tx);

    let result = match driven {
        Err(_) => {
            // Pending mux replies are dropped with the worker.
            kill_worker_group(&child);
            let _ = child.kill().await;
            Err(CoreError::Timeout(format!(
                "exec timed out after {timeout_ms}ms"
            )))
        }
        Ok(done) => {
            if tokio::time::timeout(REAP_GRACE, child.wait()).await.is_err() {
                kill_worker_group(&child);
                let _ = child.kill().await;
            }
            done
        }
    };

    writer.abort();
    result
}

/// Read worker frames until `done`, dispatching each `mux` request on its
/// own task so user code can fan out concurrently.
async fn drive(
    dispatcher: Arc<dyn MuxDispatcher>,
    reader: &mut tokio::io::Lines<BufReader<tokio::process::ChildStdout>>,
    reply_tx: mpsc::UnboundedSender<String>,
    parent: &CoreExecutionOptions,
) -> Result<CoreResult, CoreError> {
    loop {
        let line = match reader.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                return Err(CoreError::Internal(
                    "exec worker closed its pipe before reporting a result".to_string(),
                ));
            }
            Err(error) => {
                return Err(CoreError::Internal(format!(
                    "failed to read from exec worker: {error}"
                )));
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let message: WorkerMessage = match serde_json::from_str(line.trim()) {
            Ok(message) => message,
            Err(error) => {
                tracing::warn!(error = %error, "discarding malformed exec worker frame");
                continue;
            }
        };

        match message {
            WorkerMessage::Done { value, error } => {
                return Ok(finish(value, error));
            }
            WorkerMessage::Mux {
                id,
                argv,
                params,
                batch,
            } => {
                let request = build_mux_options(argv, params, batch, parent);
                let dispatcher = dispatcher.clone();
                let reply_tx = reply_tx.clone();
                tokio::spawn(async move {
                    let reply = match request {
                        Err(message) => json!({ "type": "result", "id": id, "error": message }),
                        Ok(opts) => mux_reply(id, dispatcher.dispatch(opts).await),
                    };
                    let _ = reply_tx.send(reply.to_string());
                });
            }
        }
    }
}

fn finish(value: Option<Value>, error: Option<String>) -> CoreResult {
    if let Some(error) = error {
        return CoreResult {
            success: false,
            output: None,
            error: Some(format!("exec script error: {error}")),
            exit_code: EXIT_ERROR,
        };
    }
    let output = match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(text)) => text,
        Some(other) => other.to_string(),
    };
    CoreResult::ok(output)
}

/// Turn one worker mux frame into router options, inheriting the exec
/// request's cwd and spill directory.
fn build_mux_options(
    argv: Option<Vec<String>>,
    params: Option<Value>,
    batch: Option<Value>,
    parent: &CoreExecutionOptions,
) -> Result<CoreExecutionOptions, String> {
    let (argv, params) = if let Some(calls) = batch {
        let mut merged = match params {
            Some(Value::Object(map)) => map,
            Some(_) => return Err("mux batch params must be a JSON object".to_string()),
            None => serde_json::Map::new(),
        };
        merged.insert("calls".to_string(), calls);
        (vec!["batch".to_string()], Some(Value::Object(merged)))
    } else {
        let argv = argv.unwrap_or_default();
        if argv.is_empty() {
            return Err("mux requires 'argv' or 'batch'".to_string());
        }
        (argv, params)
    };

    Ok(CoreExecutionOptions {
        argv,
        params,
        cwd: parent.cwd.clone(),
        stdin_data: None,
        output_dir: parent.output_dir.clone(),
    })
}

/// `{id, result}` on success (parsed back to JSON where possible),
/// `{id, error}` otherwise.
fn mux_reply(id: u64, result: CoreResult) -> Value {
    if result.success {
        let output = result.output.unwrap_or_default();
        let parsed: Value =
            serde_json::from_str(&output).unwrap_or_else(|_| Value::String(output));
        json!({ "type": "result", "id": id, "result": parsed })
    } else {
        json!({
            "type": "result",
            "id": id,
            "error": result.error.unwrap_or_else(|| "unknown error".to_string()),
        })
    }
}

fn resolve_against(cwd: &Path, file: &str) -> PathBuf {
    let path = Path::new(file);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    }
}

fn kill_worker_group(child: &tokio::process::Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: signals the process group the worker created via setsid.
        unsafe {
            libc::killpg(pid as libc::pid_t, libc::SIGKILL);
        }
    }
}

/// The worker bootstrap: readline IPC, the injected `mcpuMux` and
/// `mcpuRequire`, and the user code wrapped in an async function.
fn render_bootstrap(code: &str, cwd: &Path) -> String {
    const TEMPLATE: &str = r#"'use strict';
const readline = require('node:readline');
const { createRequire } = require('node:module');
const path = require('node:path');

const pending = new Map();
let nextId = 1;

function send(message) {
  process.stdout.write(JSON.stringify(message) + '\n');
}

function mcpuMux(opts) {
  return new Promise((resolve, reject) => {
    const id = nextId++;
    pending.set(id, { resolve, reject });
    send(Object.assign({ type: 'mux', id }, opts));
  });
}

const mcpuRequire = createRequire(path.join(__MCPU_CWD_JSON__, '__mcpu_anchor__.js'));

const rl = readline.createInterface({ input: process.stdin, terminal: false });
rl.on('line', (line) => {
  let message;
  try {
    message = JSON.parse(line);
  } catch {
    return;
  }
  if (message.type !== 'result') return;
  const entry = pending.get(message.id);
  if (!entry) return;
  pending.delete(message.id);
  if (message.error !== undefined && message.error !== null) {
    entry.reject(new Error(message.error));
  } else {
    entry.resolve(message.result);
  }
});

const body = '"use strict"; return (async () => {\n' + __MCPU_CODE_JSON__ + '\n})();';
const run = new Function('mcpuMux', 'mcpuRequire', body);
Promise.resolve()
  .then(() => run(mcpuMux, mcpuRequire))
  .then((value) => {
    const message = { type: 'done' };
    if (value !== undefined) message.value = value;
    send(message);
    process.exit(0);
  })
  .catch((error) => {
    send({ type: 'done', error: String((error && error.stack) || error) });
    process.exit(1);
  });
"#;

    let cwd_json =
        serde_json::to_string(&cwd.to_string_lossy()).unwrap_or_else(|_| "\".\"".to_string());
    let code_json = serde_json::to_string(code).unwrap_or_else(|_| "\"\"".to_string());
    TEMPLATE
        .replace("__MCPU_CWD_JSON__", &cwd_json)
        .replace("__MCPU_CODE_JSON__", &code_json)
}

#[cfg(test)]
#[path = "exec_tests.rs"]
mod tests;
