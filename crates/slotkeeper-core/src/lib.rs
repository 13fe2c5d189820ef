//! Slot state machine and hardware command dispatch for slotkeeperd
//!
//! This crate is the heart of slotkeeperd, containing:
//! - Session timing (remaining / exceeded minutes from wall-clock time)
//! - Slot lifecycle (AVAILABLE -> PAID -> ACTIVE -> OVERSTAY, cyclic)
//! - Self-healing reads that promote overdue sessions to OVERSTAY
//! - The persisted per-slot command mailbox and the in-memory live fanout
//! - Validation of sensor events and operator overrides
//!
//! Every operation takes the current time as a parameter so callers (and
//! tests) control the clock.

mod engine;
mod fanout;
mod ingress;
mod mailbox;
pub mod slot;
mod slots;
mod time_oracle;

pub use engine::*;
pub use fanout::*;
pub use ingress::*;
pub use mailbox::*;
pub use slot::{SlotAction, to_view};
pub use slots::*;
pub use time_oracle::*;

use slotkeeper_api::ErrorCode;
use slotkeeper_store::StoreError;
use slotkeeper_util::SlotId;
use thiserror::Error;

/// Core errors
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Slot not found: {0}")]
    NotFound(SlotId),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl CoreError {
    /// Protocol error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            CoreError::NotFound(_) => ErrorCode::NotFound,
            CoreError::Conflict(_) => ErrorCode::Conflict,
            CoreError::InvalidEvent(_) => ErrorCode::InvalidEvent,
            CoreError::Validation(_) => ErrorCode::ValidationError,
            CoreError::Store(_) => ErrorCode::InternalError,
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
