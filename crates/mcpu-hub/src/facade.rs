//! MCP facade: expose the compact command surface as tools on a single
//! stdio MCP endpoint.
//!
//! Besides the generic `mux` tool (`{argv, params?}`), the per-command tool
//! forms map their arguments onto argv construction and route through the
//! same router. Every response is wrapped as
//! `{content:[{type:"text", text:<CoreResult json>}], isError}`.

use anyhow::{Context, Result, bail};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use mcpu_core::CoreExecutionOptions;

use crate::router::Router;
use crate::rpc::{JsonRpcRequest, JsonRpcResponse, PROTOCOL_VERSION};

/// Serve MCP over this process's stdio until EOF.
pub async fn run_facade(router: Router) -> Result<()> {
    tracing::info!("serving MCP facade on stdio");
    serve_connection(router, tokio::io::stdin(), tokio::io::stdout()).await
}

pub(crate) async fn serve_connection<R, W>(router: Router, reader: R, writer: W) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut writer = writer;

    while let Some(line) = lines
        .next_line()
        .await
        .context("failed to read MCP request line")?
    {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let request: JsonRpcRequest = match serde_json::from_str(trimmed) {
            Ok(request) => request,
            Err(error) => {
                let response =
                    JsonRpcResponse::error(None, -32700, format!("parse error: {error}"));
                write_json_line(&mut writer, &response).await?;
                continue;
            }
        };

        if request.is_notification() {
            tracing::debug!(method = %request.method, "notification");
            continue;
        }

        let response = handle_request(&router, request).await;
        write_json_line(&mut writer, &response).await?;
    }

    tracing::info!("MCP facade shutting down");
    Ok(())
}

async fn handle_request(router: &Router, request: JsonRpcRequest) -> JsonRpcResponse {
    let id = request.id.clone();
    match request.method.as_str() {
        "initialize" => JsonRpcResponse::result(
            id,
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": { "tools": {} },
                "serverInfo": {
                    "name": "mcpu",
                    "version": env!("CARGO_PKG_VERSION"),
                },
            }),
        ),
        "tools/list" => JsonRpcResponse::result(id, json!({ "tools": tool_definitions() })),
        "tools/call" => match handle_tool_call(router, request.params).await {
            Ok(result) => JsonRpcResponse::result(id, result),
            Err(error) => JsonRpcResponse::error(id, -32603, error.to_string()),
        },
        "ping" => JsonRpcResponse::result(id, json!({})),
        "shutdown" => JsonRpcResponse::result(id, json!({})),
        other => JsonRpcResponse::error(id, -32601, format!("method not found: {other}")),
    }
}

#[derive(Serialize)]
struct ToolDefinition {
    name: String,
    description: String,
    #[serde(rename = "inputSchema")]
    input_schema: Value,
}

fn tool_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: "mux".to_string(),
            description: "Run any mcpu command: argv selects the command \
                          (servers, tools, info, call, batch, exec), params carries \
                          command-specific options."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "argv": {
                        "type": "array",
                        "items": { "type": "string" },
                        "description": "Command and arguments, e.g. [\"call\", \"repomix\", \"pack\"]"
                    },
                    "params": {
                        "type": "object",
                        "description": "Command-specific parameters (batch calls, exec code, call arguments)"
                    }
                },
                "required": ["argv"]
            }),
        },
        ToolDefinition {
            name: "servers".to_string(),
            description: "List configured MCP servers with connection state.".to_string(),
            input_schema: json!({ "type": "object", "properties": {} }),
        },
        ToolDefinition {
            name: "tools".to_string(),
            description: "Compact tool listing for one server (or all connected servers)."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "server": { "type": "string", "description": "Server name (optional)" }
                }
            }),
        },
        ToolDefinition {
            name: "info".to_string(),
            description: "Full tool descriptors (schemas included) for one server.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "server": { "type": "string" },
                    "tools": {
                        "type": "array",
                        "items": { "type": "string" },
                        "description": "Restrict to these tool names"
                    }
                },
                "required": ["server"]
            }),
        },
        ToolDefinition {
            name: "call".to_string(),
            description: "Invoke one tool on one server.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "server": { "type": "string" },
                    "tool": { "type": "string" },
                    "arguments": { "type": "object", "description": "Tool arguments" }
                },
                "required": ["server", "tool"]
            }),
        },
    ]
}

async fn handle_tool_call(router: &Router, params: Option<Value>) -> Result<Value> {
    let params = params.context("missing params for tools/call")?;
    let name = params
        .get("name")
        .and_then(Value::as_str)
        .context("missing tool name")?;
    let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

    let mut opts = build_options(name, &arguments)?;
    opts.cwd = std::env::current_dir().ok();
    opts.output_dir = opts.cwd.clone();

    let result = router.execute(opts).await;
    let text =
        serde_json::to_string(&result).context("failed to serialize command result")?;
    Ok(json!({
        "content": [ { "type": "text", "text": text } ],
        "isError": !result.success,
    }))
}

fn build_options(tool: &str, arguments: &Value) -> Result<CoreExecutionOptions> {
    let string_arg = |key: &str| -> Option<String> {
        arguments
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
    };

    let opts = match tool {
        "mux" => {
            let argv: Vec<String> = serde_json::from_value(
                arguments.get("argv").cloned().context("mux requires 'argv'")?,
            )
            .context("mux 'argv' must be an array of strings")?;
            CoreExecutionOptions {
                argv,
                params: arguments.get("params").cloned(),
                ..Default::default()
            }
        }
        "servers" => CoreExecutionOptions::from_argv(["servers"]),
        "tools" => {
            let mut argv = vec!["tools".to_string()];
            if let Some(server) = string_arg("server") {
                argv.push(server);
            }
            CoreExecutionOptions {
                argv,
                ..Default::default()
            }
        }
        "info" => {
            let server = string_arg("server").context("info requires 'server'")?;
            let mut argv = vec!["info".to_string(), server];
            if let Some(tools) = arguments.get("tools").and_then(Value::as_array) {
                argv.extend(tools.iter().filter_map(Value::as_str).map(str::to_string));
            }
            CoreExecutionOptions {
                argv,
                ..Default::default()
            }
        }
        "call" => {
            let server = string_arg("server").context("call requires 'server'")?;
            let tool_name = string_arg("tool").context("call requires 'tool'")?;
            CoreExecutionOptions {
                argv: vec!["call".to_string(), server, tool_name],
                params: arguments.get("arguments").cloned(),
                ..Default::default()
            }
        }
        other => bail!("unknown tool: {other}"),
    };
    Ok(opts)
}

async fn write_json_line<W: AsyncWrite + Unpin>(
    writer: &mut W,
    response: &JsonRpcResponse,
) -> Result<()> {
    let payload =
        serde_json::to_string(response).context("failed to serialize JSON-RPC response")?;
    writer
        .write_all(payload.as_bytes())
        .await
        .context("failed to write JSON-RPC response")?;
    writer
        .write_all(b"\n")
        .await
        .context("failed to write JSON-RPC delimiter")?;
    writer.flush().await.context("failed to flush JSON-RPC response")
}
