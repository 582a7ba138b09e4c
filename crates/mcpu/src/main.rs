use anyhow::Result;
use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod bridge;
mod cli;

use cli::{Cli, Commands};
use mcpu_hub::runtime::{HubOptions, build_runtime};
use mcpu_hub::serve::DaemonOptions;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_logging(matches!(cli.command, Commands::Serve { .. }))?;

    match cli.command {
        Commands::Serve { port, bind, config } => {
            mcpu_hub::serve::run_daemon(DaemonOptions {
                bind,
                port,
                config_path: config,
            })
            .await?;
        }
        Commands::Status => {
            bridge::status().await?;
        }
        Commands::Stop => {
            bridge::stop().await?;
        }
        Commands::Mcp { config } => {
            let runtime = build_runtime(HubOptions {
                config_path: config,
                ..Default::default()
            })?;
            let pool = runtime.pool.clone();
            mcpu_hub::facade::run_facade(runtime.router).await?;
            pool.shutdown_all().await;
        }
        Commands::Forward(argv) => {
            let exit_code = bridge::forward(argv).await?;
            std::process::exit(exit_code);
        }
    }

    Ok(())
}

/// Stderr logging everywhere; the daemon also keeps a rolling file log under
/// the runtime dir.
fn init_logging(daemon: bool) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    if daemon {
        let log_dir = mcpu_config::paths::daemon_log_dir();
        std::fs::create_dir_all(&log_dir)?;
        let appender = tracing_appender::rolling::daily(&log_dir, "daemon.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::from_default_env())
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .with(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(non_blocking),
            )
            .try_init()
            .ok();
        Ok(Some(guard))
    } else {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init()
            .ok();
        Ok(None)
    }
}
