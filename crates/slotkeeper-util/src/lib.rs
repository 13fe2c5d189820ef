//! Shared utilities for slotkeeper
//!
//! This crate provides:
//! - ID types (SlotId, ClientId)
//! - Wall-clock time with a debug-only mock override
//! - Duration formatting helpers
//! - Default paths for socket, data, and config files

mod ids;
mod paths;
mod time;

pub use ids::*;
pub use paths::*;
pub use time::*;
