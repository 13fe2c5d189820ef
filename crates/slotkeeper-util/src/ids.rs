//! Strongly-typed identifiers for slotkeeper

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Longest slot identifier accepted from operators or hardware
pub const MAX_SLOT_ID_LEN: usize = 64;

/// Largest fleet the service will provision
pub const MAX_SLOT_COUNT: u32 = 1000;

/// Why a raw string is not a usable slot identifier
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SlotIdError {
    #[error("slot id must not be empty")]
    Empty,

    #[error("slot id is longer than {max} characters", max = MAX_SLOT_ID_LEN)]
    TooLong,

    #[error("slot id contains invalid character {0:?}")]
    InvalidChar(char),
}

/// Identifier of a physical parking slot, e.g. `SLOT-3` or an operator-chosen `A1`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotId(String);

impl SlotId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Validate untrusted input. Surrounding whitespace is trimmed; the rest
    /// must be ASCII alphanumerics, `-` or `_`.
    pub fn parse(raw: &str) -> Result<Self, SlotIdError> {
        let id = raw.trim();
        if id.is_empty() {
            return Err(SlotIdError::Empty);
        }
        if id.len() > MAX_SLOT_ID_LEN {
            return Err(SlotIdError::TooLong);
        }
        if let Some(c) = id
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
        {
            return Err(SlotIdError::InvalidChar(c));
        }
        Ok(Self(id.to_string()))
    }

    /// Auto-numbered id in the `SLOT-<n>` scheme
    pub fn numbered(n: u32) -> Self {
        Self(format!("{}{}", SLOT_ID_PREFIX, n))
    }

    /// The `n` of a `SLOT-<n>` id, if this id follows the numbered scheme
    pub fn number(&self) -> Option<u32> {
        self.0.strip_prefix(SLOT_ID_PREFIX)?.parse().ok()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Prefix used for auto-numbered slots
pub const SLOT_ID_PREFIX: &str = "SLOT-";

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SlotId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SlotId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Unique identifier for a connected IPC client
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(Uuid);

impl ClientId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_id_equality() {
        let id1 = SlotId::new("SLOT-1");
        let id2 = SlotId::new("SLOT-1");
        let id3 = SlotId::new("SLOT-2");

        assert_eq!(id1, id2);
        assert_ne!(id1, id3);
    }

    #[test]
    fn slot_id_parse_trims_and_validates() {
        assert_eq!(SlotId::parse("  A1 ").unwrap().as_str(), "A1");
        assert_eq!(SlotId::parse(""), Err(SlotIdError::Empty));
        assert_eq!(SlotId::parse("   "), Err(SlotIdError::Empty));
        assert_eq!(SlotId::parse("SLOT 1"), Err(SlotIdError::InvalidChar(' ')));
        assert_eq!(SlotId::parse(&"x".repeat(65)), Err(SlotIdError::TooLong));
    }

    #[test]
    fn numbered_ids() {
        let id = SlotId::numbered(7);
        assert_eq!(id.as_str(), "SLOT-7");
        assert_eq!(id.number(), Some(7));
        assert_eq!(SlotId::new("A1").number(), None);
        assert_eq!(SlotId::new("SLOT-x").number(), None);
    }

    #[test]
    fn client_id_uniqueness() {
        assert_ne!(ClientId::new(), ClientId::new());
    }

    #[test]
    fn ids_serialize_deserialize() {
        let slot_id = SlotId::new("SLOT-4");
        let json = serde_json::to_string(&slot_id).unwrap();
        assert_eq!(json, "\"SLOT-4\"");
        let parsed: SlotId = serde_json::from_str(&json).unwrap();
        assert_eq!(slot_id, parsed);
    }
}
