//! Core types for the QNet peer-to-peer node.
//!
//! Configuration and status data shared by the wire crate and the CLI.
//! It contains no business logic.

pub mod config;
pub mod status;

pub use config::{CryptoConfig, NodeConfig, SchedulerConfig, TransportConfig};
pub use status::NodeStatus;
