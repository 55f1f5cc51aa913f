//! QNet node CLI: runs a single node until Ctrl+C.

mod cli;
mod config;
mod ui;

use crate::cli::Cli;
use clap::Parser;
use qnet_types::config::NodeConfig;
use qnet_wire::{LoggingHandle, QnetNode};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn init_tracing_stderr(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = if e.use_stderr() { 1 } else { 0 };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    init_tracing_stderr(cli.json_logs);

    let config = config::apply_overrides(config::load_config(cli.config.as_deref()), &cli);
    if let Err(e) = config.validate() {
        ui::error_with_fix(
            &format!("Invalid configuration: {e}"),
            &format!(
                "Check the flags and {}",
                cli.config
                    .clone()
                    .unwrap_or_else(config::default_config_path)
                    .display()
            ),
        );
        std::process::exit(1);
    }

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            ui::error(&format!("Failed to start async runtime: {e}"));
            std::process::exit(1);
        }
    };
    let code = rt.block_on(run(config, cli.connect));
    std::process::exit(code);
}

async fn run(config: NodeConfig, connect: Option<String>) -> i32 {
    let bind_address = config.bind_address;
    let node = QnetNode::new(config, Arc::new(LoggingHandle));

    let listen_addr = match node.start().await {
        Ok(addr) => addr,
        Err(e) => {
            ui::error_with_fix(
                &format!("Failed to start node: {e}"),
                &format!("Is another process using {bind_address}? Pick a different --port"),
            );
            return 1;
        }
    };

    let status = node.get_status().await;
    ui::banner();
    ui::blank();
    ui::kv("Node", &status.node_id);
    ui::kv("Listening", &listen_addr.to_string());
    ui::kv("Capabilities", &status.capabilities.join(", "));
    ui::blank();

    if let Some(target) = connect {
        connect_at_startup(&node, &target).await;
    }

    ui::hint("Press Ctrl+C to stop the node");
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl+C");
    }

    ui::blank();
    println!("  Shutting down...");
    node.stop().await;
    ui::success("Node stopped");
    0
}

async fn connect_at_startup(node: &QnetNode, target: &str) {
    let addr = match resolve(target).await {
        Ok(addr) => addr,
        Err(e) => {
            ui::warn_with_fix(
                &format!("Cannot resolve {target}: {e}"),
                "Pass --connect as host:port, e.g. 127.0.0.1:7777",
            );
            return;
        }
    };
    match node.connect_to_peer(addr).await {
        Ok(peer) => ui::success(&format!("Connected to {} at {addr}", peer.peer_id)),
        Err(e) => ui::warn_with_fix(
            &format!("Handshake with {addr} failed: {e}"),
            "Check that the other node is running and reachable",
        ),
    }
}

async fn resolve(target: &str) -> std::io::Result<SocketAddr> {
    tokio::net::lookup_host(target).await?.next().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses found")
    })
}
