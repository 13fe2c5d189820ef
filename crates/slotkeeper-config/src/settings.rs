//! Validated settings structures

use crate::schema::{RawConfig, RawServiceConfig, RawSlotsConfig};
use slotkeeper_util::{SlotId, default_data_dir, default_socket_path};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Default keep-alive period on live command streams
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(30);

/// Default background overstay sweep period
pub const DEFAULT_OVERSTAY_SWEEP: Duration = Duration::from_secs(60);

/// Default fleet size on first start
pub const DEFAULT_SLOT_COUNT: u32 = 4;

/// Validated settings ready for use by the service
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub service: ServiceConfig,
    pub slots: FleetConfig,
}

impl Settings {
    /// Convert from raw config (after validation)
    pub fn from_raw(raw: RawConfig) -> Self {
        Self {
            service: ServiceConfig::from_raw(raw.service),
            slots: FleetConfig::from_raw(raw.slots),
        }
    }
}

/// Service configuration
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub socket_path: PathBuf,
    pub tcp_listen: Option<SocketAddr>,
    pub data_dir: PathBuf,
    pub admin_token: Option<String>,
    pub heartbeat: Duration,
    /// None disables the background sweep
    pub overstay_sweep: Option<Duration>,
}

impl ServiceConfig {
    fn from_raw(raw: RawServiceConfig) -> Self {
        Self {
            socket_path: raw.socket_path.unwrap_or_else(default_socket_path),
            // Validation has already rejected unparsable addresses
            tcp_listen: raw.tcp_listen.and_then(|addr| addr.parse().ok()),
            data_dir: raw.data_dir.unwrap_or_else(default_data_dir),
            admin_token: raw.admin_token.map(|t| t.trim().to_string()),
            heartbeat: raw
                .heartbeat_seconds
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_HEARTBEAT),
            overstay_sweep: match raw.overstay_sweep_seconds {
                Some(0) => None,
                Some(secs) => Some(Duration::from_secs(secs)),
                None => Some(DEFAULT_OVERSTAY_SWEEP),
            },
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self::from_raw(RawServiceConfig::default())
    }
}

/// Slots to provision when the store is empty
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FleetConfig {
    /// SLOT-1..SLOT-n
    Numbered(u32),
    /// Operator-assigned ids
    Named(Vec<SlotId>),
}

impl FleetConfig {
    fn from_raw(raw: RawSlotsConfig) -> Self {
        match raw.ids {
            Some(ids) if !ids.is_empty() => FleetConfig::Named(
                // Validation has already rejected malformed ids
                ids.iter().filter_map(|id| SlotId::parse(id).ok()).collect(),
            ),
            _ => FleetConfig::Numbered(raw.initial_count.unwrap_or(DEFAULT_SLOT_COUNT)),
        }
    }

    /// The slot ids this fleet describes
    pub fn slot_ids(&self) -> Vec<SlotId> {
        match self {
            FleetConfig::Numbered(count) => (1..=*count).map(SlotId::numbered).collect(),
            FleetConfig::Named(ids) => ids.clone(),
        }
    }
}

impl Default for FleetConfig {
    fn default() -> Self {
        FleetConfig::Numbered(DEFAULT_SLOT_COUNT)
    }
}
