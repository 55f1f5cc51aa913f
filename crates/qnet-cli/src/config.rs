//! Configuration loading and CLI overrides.

use crate::cli::Cli;
use qnet_types::config::NodeConfig;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// `~/.qnet/config.toml`, or `./.qnet/config.toml` when there is no home directory.
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".qnet"))
        .unwrap_or_else(|| PathBuf::from(".qnet"))
        .join("config.toml")
}

/// Load the node configuration from a TOML file.
///
/// A missing, unreadable or invalid file falls back to the defaults.
pub fn load_config(path: Option<&Path>) -> NodeConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        debug!(path = %config_path.display(), "No config file, using defaults");
        return NodeConfig::default();
    }

    match std::fs::read_to_string(&config_path) {
        Ok(contents) => match toml::from_str::<NodeConfig>(&contents) {
            Ok(config) => {
                info!(path = %config_path.display(), "Loaded configuration");
                config
            }
            Err(e) => {
                warn!(
                    path = %config_path.display(),
                    error = %e,
                    "Failed to parse config, using defaults"
                );
                NodeConfig::default()
            }
        },
        Err(e) => {
            warn!(
                path = %config_path.display(),
                error = %e,
                "Failed to read config file, using defaults"
            );
            NodeConfig::default()
        }
    }
}

/// Apply command-line flags on top of the file configuration.
pub fn apply_overrides(mut config: NodeConfig, cli: &Cli) -> NodeConfig {
    config.node_id = cli.node_id.clone();
    let ip = cli.ip.unwrap_or_else(|| config.bind_address.ip());
    let port = cli.port.unwrap_or_else(|| config.bind_address.port());
    config.bind_address = SocketAddr::new(ip, port);
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
                bind_address = "127.0.0.1:9100"
                consciousness_level = 0.4

                [crypto]
                rotation_interval_secs = 60
            "#,
        )
        .unwrap();

        let config = load_config(Some(&path));
        assert_eq!(config.bind_address, "127.0.0.1:9100".parse().unwrap());
        assert_eq!(config.consciousness_level, 0.4);
        assert_eq!(config.crypto.rotation_interval_secs, 60);
        assert_eq!(config.crypto.decrypt_grace_secs, 30);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(Some(&dir.path().join("absent.toml")));
        assert_eq!(config.bind_address.port(), 7777);
    }

    #[test]
    fn test_invalid_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "bind_address = [not toml").unwrap();
        let config = load_config(Some(&path));
        assert_eq!(config.transport.worker_pool_size, 10);
    }

    #[test]
    fn test_flags_override_file() {
        let file = NodeConfig {
            node_id: "from-file".to_string(),
            bind_address: "127.0.0.1:9100".parse().unwrap(),
            ..NodeConfig::default()
        };

        let cli =
            Cli::try_parse_from(["qnet-node", "--node-id", "alpha", "--port", "9200"]).unwrap();
        let config = apply_overrides(file.clone(), &cli);
        assert_eq!(config.node_id, "alpha");
        assert_eq!(config.bind_address, "127.0.0.1:9200".parse().unwrap());

        let cli =
            Cli::try_parse_from(["qnet-node", "--node-id", "alpha", "--ip", "0.0.0.0"]).unwrap();
        let config = apply_overrides(file, &cli);
        assert_eq!(config.bind_address, "0.0.0.0:9100".parse().unwrap());
    }
}
