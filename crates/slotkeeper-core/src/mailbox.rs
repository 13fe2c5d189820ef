//! Pending command mailbox
//!
//! One unread directive per slot, persisted with the slot record. A new
//! directive replaces an unread one: only the latest instruction matters to
//! a barrier. Pollers take and clear in a single store operation, so a
//! directive is handed out at most once per write.
//!
//! Status transitions write their directive through
//! [`Store::update_slot`](slotkeeper_store::Store::update_slot) so the two
//! commit together; this type covers directive-only dispatch and polling.

use chrono::{DateTime, Local};
use slotkeeper_api::HardwareCommand;
use slotkeeper_store::{Store, StoreError};
use slotkeeper_util::SlotId;
use std::sync::Arc;
use tracing::debug;

use crate::{CoreError, CoreResult};

#[derive(Clone)]
pub struct PendingCommandMailbox {
    store: Arc<dyn Store>,
}

impl PendingCommandMailbox {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Overwrite the unread directive for `slot_id`
    pub fn set(
        &self,
        slot_id: &SlotId,
        command: HardwareCommand,
        now: DateTime<Local>,
    ) -> CoreResult<()> {
        if !self.store.set_pending_command(slot_id, command, now)? {
            return Err(CoreError::NotFound(slot_id.clone()));
        }
        debug!(slot_id = %slot_id, command = %command, "Directive queued");
        Ok(())
    }

    /// Hand out the unread directive and clear it. `None` when empty.
    pub fn take_and_clear(&self, slot_id: &SlotId) -> CoreResult<Option<HardwareCommand>> {
        match self.store.take_pending_command(slot_id) {
            Ok(command) => {
                if let Some(command) = command {
                    debug!(slot_id = %slot_id, command = %command, "Directive taken");
                }
                Ok(command)
            }
            Err(StoreError::NotFound(_)) => Err(CoreError::NotFound(slot_id.clone())),
            Err(e) => Err(e.into()),
        }
    }
}
