//! Audit event types

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use slotkeeper_api::{HardwareCommand, SlotStatus};
use slotkeeper_util::SlotId;

/// Types of audit events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEventType {
    /// Service started
    ServiceStarted,

    /// Service stopped
    ServiceStopped,

    /// Fleet replaced by bulk initialization
    SlotsInitialized { count: u32 },

    /// Single slot provisioned
    SlotAdded { slot_id: SlotId },

    /// Idle slot removed
    SlotDeleted { slot_id: SlotId },

    /// Status change caused by an event, admin command or overstay detection
    SlotTransition {
        slot_id: SlotId,
        from: SlotStatus,
        to: SlotStatus,
        trigger: String,
    },

    /// Directive written to the mailbox and published to live subscribers
    CommandDispatched {
        slot_id: SlotId,
        command: HardwareCommand,
        listeners: usize,
    },

    /// Operator override applied
    AdminCommand { slot_id: SlotId, command: String },

    /// Client connected
    ClientConnected {
        client_id: String,
        role: String,
        uid: Option<u32>,
    },

    /// Client disconnected
    ClientDisconnected { client_id: String },
}

/// Full audit event with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Unique event ID
    pub id: i64,

    /// Event timestamp
    pub timestamp: DateTime<Local>,

    /// Event type and details
    pub event: AuditEventType,
}

impl AuditEvent {
    pub fn new(event: AuditEventType) -> Self {
        Self::at(event, slotkeeper_util::now())
    }

    /// Event stamped with an explicit time
    pub fn at(event: AuditEventType, timestamp: DateTime<Local>) -> Self {
        Self {
            id: 0, // Will be set by store
            timestamp,
            event,
        }
    }
}
