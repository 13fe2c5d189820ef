//! Shared types for the slotkeeperd API

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use slotkeeper_util::SlotId;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A name on the wire that does not belong to the expected vocabulary
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} {name:?}")]
pub struct UnknownName {
    pub kind: &'static str,
    pub name: String,
}

/// Lifecycle status of a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SlotStatus {
    Available,
    Paid,
    Active,
    Overstay,
}

impl SlotStatus {
    pub const ALL: [SlotStatus; 4] = [
        SlotStatus::Available,
        SlotStatus::Paid,
        SlotStatus::Active,
        SlotStatus::Overstay,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SlotStatus::Available => "AVAILABLE",
            SlotStatus::Paid => "PAID",
            SlotStatus::Active => "ACTIVE",
            SlotStatus::Overstay => "OVERSTAY",
        }
    }

    /// A slot is in use whenever it carries a session
    pub fn is_in_use(&self) -> bool {
        !matches!(self, SlotStatus::Available)
    }

    /// Statuses whose session clock can run out
    pub fn can_overstay(&self) -> bool {
        matches!(self, SlotStatus::Paid | SlotStatus::Active)
    }
}

impl fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SlotStatus {
    type Err = UnknownName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SlotStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownName {
                kind: "slot status",
                name: s.to_string(),
            })
    }
}

/// Directive for a barrier or lock controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HardwareCommand {
    OpenBarrier,
    Unlock,
    LockBarrier,
    ForceOpenBarrier,
}

/// Wire name for "no directive pending"
pub const NO_COMMAND: &str = "NONE";

impl HardwareCommand {
    pub const ALL: [HardwareCommand; 4] = [
        HardwareCommand::OpenBarrier,
        HardwareCommand::Unlock,
        HardwareCommand::LockBarrier,
        HardwareCommand::ForceOpenBarrier,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HardwareCommand::OpenBarrier => "OPEN_BARRIER",
            HardwareCommand::Unlock => "UNLOCK",
            HardwareCommand::LockBarrier => "LOCK_BARRIER",
            HardwareCommand::ForceOpenBarrier => "FORCE_OPEN_BARRIER",
        }
    }
}

impl fmt::Display for HardwareCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HardwareCommand {
    type Err = UnknownName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        HardwareCommand::ALL
            .into_iter()
            .find(|cmd| cmd.as_str() == s)
            .ok_or_else(|| UnknownName {
                kind: "hardware command",
                name: s.to_string(),
            })
    }
}

/// Serde adapter writing `Option<HardwareCommand>` as the directive name or `"NONE"`
pub mod command_or_none {
    use super::{HardwareCommand, NO_COMMAND};
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(
        command: &Option<HardwareCommand>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match command {
            Some(cmd) => serializer.serialize_str(cmd.as_str()),
            None => serializer.serialize_str(NO_COMMAND),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<HardwareCommand>, D::Error> {
        let name = String::deserialize(deserializer)?;
        if name == NO_COMMAND {
            return Ok(None);
        }
        name.parse().map(Some).map_err(D::Error::custom)
    }
}

/// View of a slot as returned by reads. `remaining_minutes` and
/// `exceeded_minutes` are derived at read time and never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotView {
    pub slot_id: SlotId,
    pub status: SlotStatus,
    pub paid_minutes: u32,
    pub start_time: Option<DateTime<Local>>,
    pub end_time: Option<DateTime<Local>>,
    /// Exceeded minutes frozen when the slot entered OVERSTAY (billing)
    pub overstay_minutes: u32,
    pub remaining_minutes: u32,
    pub exceeded_minutes: u32,
    #[serde(with = "command_or_none")]
    pub pending_command: Option<HardwareCommand>,
    pub created_at: DateTime<Local>,
    pub updated_at: DateTime<Local>,
}

/// Reply to a hardware poll: the directive taken from the mailbox plus the
/// slot status after any overstay promotion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolledCommand {
    pub slot_id: SlotId,
    pub status: SlotStatus,
    #[serde(with = "command_or_none")]
    pub command: Option<HardwareCommand>,
}

/// Role for authorization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientRole {
    /// Operator - may provision slots and issue overrides
    Admin,
    /// Barrier controller or payment flow
    Device,
}

impl ClientRole {
    pub fn can_administer(&self) -> bool {
        matches!(self, ClientRole::Admin)
    }

    pub fn can_provision(&self) -> bool {
        matches!(self, ClientRole::Admin)
    }
}

/// Health status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub live: bool,
    pub ready: bool,
    pub store_ok: bool,
    pub slot_count: usize,
    /// Live command subscriptions across all slots
    pub subscriber_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_wire_names() {
        let json = serde_json::to_string(&SlotStatus::Overstay).unwrap();
        assert_eq!(json, "\"OVERSTAY\"");
        for status in SlotStatus::ALL {
            assert_eq!(status.as_str().parse::<SlotStatus>().unwrap(), status);
        }
        assert!("overstay".parse::<SlotStatus>().is_err());
    }

    #[test]
    fn command_wire_names() {
        let json = serde_json::to_string(&HardwareCommand::ForceOpenBarrier).unwrap();
        assert_eq!(json, "\"FORCE_OPEN_BARRIER\"");
        assert_eq!(
            "LOCK_BARRIER".parse::<HardwareCommand>().unwrap(),
            HardwareCommand::LockBarrier
        );
        assert!(NO_COMMAND.parse::<HardwareCommand>().is_err());
    }

    #[test]
    fn polled_command_uses_none_sentinel() {
        let empty = PolledCommand {
            slot_id: SlotId::new("SLOT-1"),
            status: SlotStatus::Available,
            command: None,
        };
        let json = serde_json::to_value(&empty).unwrap();
        assert_eq!(json["command"], "NONE");

        let parsed: PolledCommand =
            serde_json::from_str(r#"{"slot_id":"SLOT-1","status":"ACTIVE","command":"UNLOCK"}"#)
                .unwrap();
        assert_eq!(parsed.command, Some(HardwareCommand::Unlock));

        let parsed: PolledCommand =
            serde_json::from_str(r#"{"slot_id":"SLOT-1","status":"ACTIVE","command":"NONE"}"#)
                .unwrap();
        assert_eq!(parsed.command, None);
    }

    #[test]
    fn status_in_use() {
        assert!(!SlotStatus::Available.is_in_use());
        assert!(SlotStatus::Paid.is_in_use());
        assert!(SlotStatus::Overstay.is_in_use());
        assert!(SlotStatus::Active.can_overstay());
        assert!(!SlotStatus::Overstay.can_overstay());
    }
}
