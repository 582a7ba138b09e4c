use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "mcpu", version)]
#[command(about = "Multiplexing proxy for MCP servers")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the proxy daemon on loopback
    Serve {
        /// Port to bind; 0 picks an ephemeral port recorded in the port file
        #[arg(long, default_value_t = 0)]
        port: u16,

        /// Bind address
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,

        /// Config file override (defaults to the XDG config path)
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Show whether the daemon is running
    Status,

    /// Stop the running daemon
    Stop,

    /// Serve the MCP facade on stdio (register this with your MCP host)
    Mcp {
        /// Config file override (defaults to the XDG config path)
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Any compact command is forwarded to the daemon verbatim:
    /// servers | connect | disconnect | reconnect | reload | tools | info |
    /// call | batch | exec
    #[command(external_subcommand)]
    Forward(Vec<String>),
}
