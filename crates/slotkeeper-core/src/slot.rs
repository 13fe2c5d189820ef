//! Slot state machine
//!
//! Pure transition rules over [`SlotRecord`]. Each rule inspects the current
//! record and decides what should happen; persisting the outcome and
//! delivering directives is left to [`crate::SlotService`].
//!
//! ```text
//! AVAILABLE --payment--> PAID --car_entered--> ACTIVE --overdue--> OVERSTAY
//!     ^                   |                      |                   |
//!     +----car_exited-----+----------------------+-------------------+
//!                                    ACTIVE <--payment / unlock--- OVERSTAY
//! ```

use chrono::{DateTime, Local};
use slotkeeper_api::{HardwareCommand, SlotStatus, SlotView};
use slotkeeper_store::SlotRecord;

use crate::{CoreError, CoreResult, time_info};

/// Outcome of applying a rule to a slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotAction {
    /// New record state, with the directive to commit alongside it
    Transition {
        record: SlotRecord,
        command: Option<HardwareCommand>,
    },
    /// Directive only; the record keeps its status
    Dispatch(HardwareCommand),
    /// Nothing to do
    Unchanged,
}

impl SlotAction {
    fn to(record: SlotRecord, command: Option<HardwareCommand>) -> Self {
        let mut record = record;
        if command.is_some() {
            record.pending_command = command;
        }
        SlotAction::Transition { record, command }
    }
}

fn conflict(record: &SlotRecord, what: &str) -> CoreError {
    CoreError::Conflict(format!(
        "cannot {} slot {} while {}",
        what, record.slot_id, record.status
    ))
}

fn cleared(record: &SlotRecord, now: DateTime<Local>) -> SlotRecord {
    SlotRecord {
        status: SlotStatus::Available,
        paid_minutes: 0,
        start_time: None,
        end_time: None,
        overstay_minutes: 0,
        updated_at: now,
        ..record.clone()
    }
}

/// Payment confirmed for `minutes`: a new reservation from AVAILABLE, or
/// settlement of an overstay.
pub fn pay(record: &SlotRecord, minutes: u32, now: DateTime<Local>) -> CoreResult<SlotAction> {
    match record.status {
        SlotStatus::Available => Ok(SlotAction::to(
            SlotRecord {
                status: SlotStatus::Paid,
                paid_minutes: minutes,
                ..cleared(record, now)
            },
            Some(HardwareCommand::OpenBarrier),
        )),
        SlotStatus::Overstay => Ok(SlotAction::to(
            SlotRecord {
                status: SlotStatus::Active,
                paid_minutes: record.paid_minutes.saturating_add(minutes),
                overstay_minutes: 0,
                updated_at: now,
                ..record.clone()
            },
            Some(HardwareCommand::Unlock),
        )),
        SlotStatus::Paid | SlotStatus::Active => Err(conflict(record, "take payment for")),
    }
}

/// A car arrived on a paid slot
pub fn enter(record: &SlotRecord, now: DateTime<Local>) -> CoreResult<SlotAction> {
    match record.status {
        SlotStatus::Paid => Ok(SlotAction::to(
            SlotRecord {
                status: SlotStatus::Active,
                start_time: Some(now),
                updated_at: now,
                ..record.clone()
            },
            None,
        )),
        _ => Err(conflict(record, "register arrival on")),
    }
}

/// The car left. Ends any session; a no-op on an idle slot.
pub fn exit(record: &SlotRecord, now: DateTime<Local>) -> SlotAction {
    match record.status {
        SlotStatus::Available => SlotAction::Unchanged,
        _ => SlotAction::to(
            SlotRecord {
                end_time: Some(now),
                ..cleared(record, now)
            },
            None,
        ),
    }
}

/// Promote an overdue PAID/ACTIVE session, freezing the exceeded minutes
pub fn promote_overstay(
    record: &SlotRecord,
    exceeded_minutes: u32,
    now: DateTime<Local>,
) -> SlotAction {
    SlotAction::to(
        SlotRecord {
            status: SlotStatus::Overstay,
            overstay_minutes: exceeded_minutes,
            updated_at: now,
            ..record.clone()
        },
        Some(HardwareCommand::LockBarrier),
    )
}

/// Overstay reported by a sensor. Accepted only when the clock agrees.
pub fn report_overstay(record: &SlotRecord, now: DateTime<Local>) -> CoreResult<SlotAction> {
    match record.status {
        // Already promoted, usually by a read that got there first
        SlotStatus::Overstay => Ok(SlotAction::Unchanged),
        SlotStatus::Paid | SlotStatus::Active => {
            let info = time_info(record.start_time, record.paid_minutes, now);
            if info.is_exceeded() {
                Ok(promote_overstay(record, info.exceeded_minutes, now))
            } else {
                Err(conflict(record, "report overstay on"))
            }
        }
        SlotStatus::Available => Err(conflict(record, "report overstay on")),
    }
}

/// Operator reset: back to AVAILABLE from any status, barrier locked
pub fn reset(record: &SlotRecord, now: DateTime<Local>) -> SlotAction {
    SlotAction::to(cleared(record, now), Some(HardwareCommand::LockBarrier))
}

/// Operator unlock. Lifts an overstay back to ACTIVE; elsewhere it only
/// sends UNLOCK.
pub fn unlock(record: &SlotRecord, now: DateTime<Local>) -> SlotAction {
    match record.status {
        SlotStatus::Overstay => SlotAction::to(
            SlotRecord {
                status: SlotStatus::Active,
                overstay_minutes: 0,
                updated_at: now,
                ..record.clone()
            },
            Some(HardwareCommand::Unlock),
        ),
        _ => SlotAction::Dispatch(HardwareCommand::Unlock),
    }
}

/// Operator force-open; status is never touched
pub fn force_open(_record: &SlotRecord) -> SlotAction {
    SlotAction::Dispatch(HardwareCommand::ForceOpenBarrier)
}

/// Render a record for clients, deriving the live timing fields
pub fn to_view(record: &SlotRecord, now: DateTime<Local>) -> SlotView {
    let info = time_info(record.start_time, record.paid_minutes, now);

    SlotView {
        slot_id: record.slot_id.clone(),
        status: record.status,
        paid_minutes: record.paid_minutes,
        start_time: record.start_time,
        end_time: record.end_time,
        overstay_minutes: record.overstay_minutes,
        remaining_minutes: info.remaining_minutes,
        // Fall back to the frozen snapshot once the live value reads zero
        exceeded_minutes: if info.is_exceeded() {
            info.exceeded_minutes
        } else {
            record.overstay_minutes
        },
        pending_command: record.pending_command,
        created_at: record.created_at,
        updated_at: record.updated_at,
    }
}
