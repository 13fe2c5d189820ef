//! Protocol types for slotkeeperd IPC
//!
//! This crate defines the stable API between slotkeeperd and its clients
//! (operator tools, payment flow, barrier controllers):
//! - Commands (requests from clients)
//! - Responses
//! - Stream frames (service -> subscribed hardware)
//! - Versioning

mod commands;
mod events;
mod types;

pub use commands::*;
pub use events::*;
pub use types::*;

/// Current API version
pub const API_VERSION: u32 = 1;
