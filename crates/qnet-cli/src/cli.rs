//! Clap CLI definitions for the QNet node.

use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
\x1b[1;36mExamples:\x1b[0m
  qnet-node --node-id alpha                          Listen on 0.0.0.0:7777
  qnet-node --node-id beta --port 7778 \\
            --connect 127.0.0.1:7777                 Join an existing node
  RUST_LOG=debug qnet-node --node-id alpha           Verbose logging

\x1b[1;36mConfig:\x1b[0m
  Settings are read from ~/.qnet/config.toml (or --config). Flags win.";

/// QNet peer-to-peer node with per-peer key exchange.
#[derive(Debug, Parser)]
#[command(
    name = "qnet-node",
    version,
    about = "QNet peer-to-peer node",
    after_help = AFTER_HELP,
)]
pub struct Cli {
    /// Unique identifier of this node on the network.
    #[arg(long)]
    pub node_id: String,

    /// Address to bind the listener on [default: 0.0.0.0].
    #[arg(long)]
    pub ip: Option<IpAddr>,

    /// Port to listen on [default: 7777].
    #[arg(long)]
    pub port: Option<u16>,

    /// Handshake with this node (host:port) once the listener is up.
    #[arg(long, value_name = "HOST:PORT")]
    pub connect: Option<String>,

    /// Path to config file.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    pub json_logs: bool,
}
