//! Session timing

use chrono::{DateTime, Local};

/// Minutes left on a session, or minutes past its end
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeInfo {
    pub remaining_minutes: u32,
    pub exceeded_minutes: u32,
}

impl TimeInfo {
    pub fn is_exceeded(&self) -> bool {
        self.exceeded_minutes > 0
    }
}

/// Derive remaining and exceeded minutes for a session.
///
/// Elapsed time is counted in whole minutes (floor). A session that has not
/// started yet has neither remaining nor exceeded time. At most one of the
/// two values is non-zero.
pub fn time_info(
    start_time: Option<DateTime<Local>>,
    paid_minutes: u32,
    now: DateTime<Local>,
) -> TimeInfo {
    let Some(start) = start_time else {
        return TimeInfo::default();
    };

    // A start time ahead of `now` (clock adjustment) counts as zero elapsed
    let elapsed = (now - start).num_minutes().max(0);
    let remaining = i64::from(paid_minutes) - elapsed;

    if remaining > 0 {
        TimeInfo {
            remaining_minutes: clamp_minutes(remaining),
            exceeded_minutes: 0,
        }
    } else {
        TimeInfo {
            remaining_minutes: 0,
            exceeded_minutes: clamp_minutes(-remaining),
        }
    }
}

fn clamp_minutes(minutes: i64) -> u32 {
    u32::try_from(minutes).unwrap_or(u32::MAX)
}
