//! Stream frames for slotkeeperd -> subscribed hardware

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use slotkeeper_util::SlotId;

use crate::{API_VERSION, HardwareCommand};

/// Event envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub api_version: u32,
    pub timestamp: DateTime<Local>,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(payload: EventPayload) -> Self {
        Self {
            api_version: API_VERSION,
            timestamp: slotkeeper_util::now(),
            payload,
        }
    }

    pub fn command(slot_id: SlotId, command: HardwareCommand) -> Self {
        Self::new(EventPayload::Command { slot_id, command })
    }

    pub fn heartbeat() -> Self {
        Self::new(EventPayload::Heartbeat)
    }

    pub fn is_heartbeat(&self) -> bool {
        matches!(self.payload, EventPayload::Heartbeat)
    }
}

/// All frames the service pushes on a command stream
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    /// A directive published for a subscribed slot
    Command {
        slot_id: SlotId,
        command: HardwareCommand,
    },

    /// Keep-alive; carries no directive
    Heartbeat,

    /// Service is shutting down
    Shutdown,
}
