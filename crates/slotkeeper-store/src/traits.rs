//! Store trait definitions

use chrono::{DateTime, Local};
use slotkeeper_api::{HardwareCommand, SlotStatus};
use slotkeeper_util::SlotId;

use crate::{AuditEvent, StoreResult};

/// Main store trait
///
/// Every method is one atomic unit: implementations must not let a
/// concurrent caller observe a half-applied write.
pub trait Store: Send + Sync {
    // Slot records

    /// Insert a new slot. Fails with `AlreadyExists` on a duplicate id.
    fn insert_slot(&self, record: &SlotRecord) -> StoreResult<()>;

    fn get_slot(&self, slot_id: &SlotId) -> StoreResult<Option<SlotRecord>>;

    /// Slots matching `filter`, in creation order
    fn list_slots(&self, filter: &SlotFilter) -> StoreResult<Vec<SlotRecord>>;

    fn count_slots(&self) -> StoreResult<usize>;

    /// Overwrite the session fields of `record`, but only if the stored
    /// version still equals `expected_version`. A successful write bumps the
    /// stored version by one.
    ///
    /// When `command` is `Some` the mailbox is overwritten in the same write;
    /// when `None` an unread directive is left alone.
    ///
    /// Returns `false` when the slot is missing or was written in between.
    fn update_slot(
        &self,
        record: &SlotRecord,
        expected_version: i64,
        command: Option<HardwareCommand>,
    ) -> StoreResult<bool>;

    /// Delete a slot if its status equals `expected`. Returns whether a row went away.
    fn delete_slot(&self, slot_id: &SlotId, expected: SlotStatus) -> StoreResult<bool>;

    /// Replace every slot with `records`, but only while no current slot is
    /// in use. Returns `false` (and changes nothing) otherwise.
    fn replace_all_slots(&self, records: &[SlotRecord]) -> StoreResult<bool>;

    // Pending command mailbox

    /// Overwrite the unread directive for a slot and stamp `updated_at`.
    /// The session version is left alone. Returns `false` for an unknown slot.
    fn set_pending_command(
        &self,
        slot_id: &SlotId,
        command: HardwareCommand,
        at: DateTime<Local>,
    ) -> StoreResult<bool>;

    /// Read and clear the unread directive in one step.
    /// Fails with `NotFound` for an unknown slot.
    fn take_pending_command(&self, slot_id: &SlotId) -> StoreResult<Option<HardwareCommand>>;

    // Audit log

    /// Append an audit event
    fn append_audit(&self, event: AuditEvent) -> StoreResult<()>;

    /// Get recent audit events, newest first
    fn get_recent_audits(&self, limit: usize) -> StoreResult<Vec<AuditEvent>>;

    // Health

    /// Check if store is healthy
    fn is_healthy(&self) -> bool;
}

/// Persisted state of one parking slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotRecord {
    pub slot_id: SlotId,
    pub status: SlotStatus,
    pub paid_minutes: u32,
    pub start_time: Option<DateTime<Local>>,
    pub end_time: Option<DateTime<Local>>,
    /// Exceeded minutes frozen on entering OVERSTAY
    pub overstay_minutes: u32,
    /// Mailbox contents; written only through the mailbox methods or
    /// the `command` argument of [`Store::update_slot`]
    pub pending_command: Option<HardwareCommand>,
    pub created_at: DateTime<Local>,
    pub updated_at: DateTime<Local>,
    /// Bumped by every session write; conditional updates key on it
    pub version: i64,
}

impl SlotRecord {
    /// A freshly provisioned, idle slot
    pub fn available(slot_id: SlotId, now: DateTime<Local>) -> Self {
        Self {
            slot_id,
            status: SlotStatus::Available,
            paid_minutes: 0,
            start_time: None,
            end_time: None,
            overstay_minutes: 0,
            pending_command: None,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }
}

/// Selection for [`Store::list_slots`]
#[derive(Debug, Clone, Default)]
pub struct SlotFilter {
    /// Only these statuses; every slot when `None`
    pub statuses: Option<Vec<SlotStatus>>,
}

impl SlotFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_status(statuses: impl IntoIterator<Item = SlotStatus>) -> Self {
        Self {
            statuses: Some(statuses.into_iter().collect()),
        }
    }

    pub fn matches(&self, status: SlotStatus) -> bool {
        self.statuses
            .as_ref()
            .is_none_or(|statuses| statuses.contains(&status))
    }
}
