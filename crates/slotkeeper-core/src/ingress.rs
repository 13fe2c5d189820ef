//! Validation of inbound sensor events and operator overrides
//!
//! Names arrive as free-form strings from hardware and operator tools.
//! Anything outside the vocabulary is an `InvalidEvent`; a known event with
//! missing or bad arguments is a `Validation` error.

use std::fmt;
use std::str::FromStr;

use crate::{CoreError, CoreResult};

/// Event reported for a slot by hardware or the payment flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotEvent {
    PaymentConfirmed { minutes: u32 },
    CarEntered,
    CarExited,
    Overstay,
}

impl SlotEvent {
    /// Parse an event name. `minutes` is required for `PAYMENT_CONFIRMED`
    /// and ignored otherwise.
    pub fn parse(name: &str, minutes: Option<u32>) -> CoreResult<Self> {
        match normalize(name).as_str() {
            "CAR_ENTERED" => Ok(SlotEvent::CarEntered),
            "CAR_EXITED" => Ok(SlotEvent::CarExited),
            "OVERSTAY" => Ok(SlotEvent::Overstay),
            "PAYMENT_CONFIRMED" => {
                let minutes = minutes.ok_or_else(|| {
                    CoreError::Validation("PAYMENT_CONFIRMED requires minutes".into())
                })?;
                Ok(SlotEvent::PaymentConfirmed {
                    minutes: validate_minutes(minutes)?,
                })
            }
            _ => Err(CoreError::InvalidEvent(format!("unknown event {:?}", name))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SlotEvent::PaymentConfirmed { .. } => "PAYMENT_CONFIRMED",
            SlotEvent::CarEntered => "CAR_ENTERED",
            SlotEvent::CarExited => "CAR_EXITED",
            SlotEvent::Overstay => "OVERSTAY",
        }
    }
}

impl fmt::Display for SlotEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Operator override
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminCommand {
    ForceOpenBarrier,
    UnlockSlot,
    ResetSlot,
}

impl AdminCommand {
    pub fn name(&self) -> &'static str {
        match self {
            AdminCommand::ForceOpenBarrier => "FORCE_OPEN_BARRIER",
            AdminCommand::UnlockSlot => "UNLOCK_SLOT",
            AdminCommand::ResetSlot => "RESET_SLOT",
        }
    }
}

impl FromStr for AdminCommand {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize(s).as_str() {
            "FORCE_OPEN_BARRIER" => Ok(AdminCommand::ForceOpenBarrier),
            "UNLOCK_SLOT" => Ok(AdminCommand::UnlockSlot),
            "RESET_SLOT" => Ok(AdminCommand::ResetSlot),
            _ => Err(CoreError::InvalidEvent(format!(
                "unknown admin command {:?}",
                s
            ))),
        }
    }
}

impl fmt::Display for AdminCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Paid duration must be at least one minute
pub fn validate_minutes(minutes: u32) -> CoreResult<u32> {
    if minutes == 0 {
        return Err(CoreError::Validation(
            "minutes must be at least 1".into(),
        ));
    }
    Ok(minutes)
}

fn normalize(name: &str) -> String {
    name.trim().to_ascii_uppercase()
}
