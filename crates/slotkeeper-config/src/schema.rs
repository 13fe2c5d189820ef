//! Raw configuration schema (as parsed from TOML)

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Raw configuration as parsed from TOML
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawConfig {
    /// Config schema version
    pub config_version: u32,

    /// Service-level settings
    #[serde(default)]
    pub service: RawServiceConfig,

    /// Fleet provisioning
    #[serde(default)]
    pub slots: RawSlotsConfig,
}

/// Service-level settings
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawServiceConfig {
    /// IPC socket path for local operator clients
    pub socket_path: Option<PathBuf>,

    /// Optional TCP listen address for barrier controllers and the payment flow
    pub tcp_listen: Option<String>,

    /// Data directory for the slot database
    pub data_dir: Option<PathBuf>,

    /// Token that upgrades a TCP client to the admin role
    pub admin_token: Option<String>,

    /// Keep-alive period on live command streams
    pub heartbeat_seconds: Option<u64>,

    /// Background overstay sweep period; 0 disables it
    pub overstay_sweep_seconds: Option<u64>,
}

/// Fleet provisioning, applied only when the store is empty
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawSlotsConfig {
    /// Number of auto-numbered slots (SLOT-1..SLOT-n)
    pub initial_count: Option<u32>,

    /// Explicit slot ids; takes precedence over `initial_count`
    pub ids: Option<Vec<String>>,
}
