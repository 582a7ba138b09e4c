//! Thin HTTP bridge: forward argv envelopes to the daemon and relay the
//! result. The daemon does the work; this side only reads the port file,
//! ships `{argv, params?, cwd}`, and mirrors the exit code.

use std::io::{IsTerminal, Read};

use anyhow::{Context, Result, bail};
use serde_json::{Value, json};

use mcpu_config::paths;
use mcpu_core::CoreResult;

fn read_port() -> Result<u16> {
    let path = paths::port_path();
    let raw = std::fs::read_to_string(&path).with_context(|| {
        format!(
            "mcpu daemon is not running (no port file at {}); start it with 'mcpu serve'",
            path.display()
        )
    })?;
    raw.trim()
        .parse()
        .with_context(|| format!("invalid port file: {}", path.display()))
}

fn daemon_url(port: u16, route: &str) -> String {
    format!("http://127.0.0.1:{port}{route}")
}

/// Forward one compact command; returns the exit code to mirror.
pub async fn forward(argv: Vec<String>) -> Result<i32> {
    let command = argv.first().cloned().unwrap_or_default();
    let port = read_port()?;
    let url = daemon_url(port, "/cli");

    let mut body = json!({
        "argv": argv,
        "cwd": std::env::current_dir().ok(),
    });

    if !std::io::stdin().is_terminal() {
        let mut data = String::new();
        std::io::stdin()
            .read_to_string(&mut data)
            .context("failed to read piped stdin")?;
        if !data.trim().is_empty() {
            // batch/exec take piped JSON as their params; call takes it as
            // the raw arguments object.
            if matches!(command.as_str(), "batch" | "exec") {
                let params: Value = serde_json::from_str(&data)
                    .with_context(|| format!("piped stdin for '{command}' must be JSON params"))?;
                body["params"] = params;
            } else {
                body["stdinData"] = Value::String(data);
            }
        }
    }

    let response = reqwest::Client::new()
        .post(&url)
        .json(&body)
        .send()
        .await
        .with_context(|| format!("failed to reach mcpu daemon at {url}"))?;
    if !response.status().is_success() {
        bail!("daemon rejected the request: {}", response.status());
    }

    let result: CoreResult = response
        .json()
        .await
        .context("malformed daemon response")?;
    if let Some(output) = &result.output {
        if !output.is_empty() {
            println!("{output}");
        }
    }
    if let Some(error) = &result.error {
        eprintln!("error: {error}");
    }
    Ok(result.exit_code)
}

pub async fn status() -> Result<()> {
    let port = match read_port() {
        Ok(port) => port,
        Err(_) => {
            println!("mcpu daemon is not running");
            return Ok(());
        }
    };

    let url = daemon_url(port, "/healthz");
    match reqwest::get(&url).await {
        Ok(response) if response.status().is_success() => {
            let body: Value = response.json().await.context("malformed health response")?;
            let servers = body["servers"].as_array().map(Vec::len).unwrap_or(0);
            println!(
                "mcpu daemon is running at http://127.0.0.1:{port} \
                 (pid={}, uptime={}s, {servers} servers)",
                body["pid"], body["uptime_secs"]
            );
        }
        _ => {
            println!("mcpu daemon is not responding at {url} (stale port file?)");
        }
    }
    Ok(())
}

pub async fn stop() -> Result<()> {
    let port = read_port()?;
    let url = daemon_url(port, "/shutdown");
    let response = reqwest::Client::new()
        .post(&url)
        .send()
        .await
        .with_context(|| format!("failed to reach mcpu daemon at {url}"))?;
    if !response.status().is_success() {
        bail!("daemon refused to stop: {}", response.status());
    }
    println!("mcpu daemon stop signal sent");
    Ok(())
}
