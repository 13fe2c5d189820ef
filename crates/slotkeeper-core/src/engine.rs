//! Parking engine
//!
//! The operations clients call: provisioning, reads, sensor and payment
//! events, operator overrides, and the two hardware delivery paths (poll
//! the mailbox, or subscribe to the live fanout).

use chrono::{DateTime, Local};
use slotkeeper_api::{PolledCommand, SlotView};
use slotkeeper_store::{AuditEventType, Store};
use slotkeeper_util::SlotId;
use std::sync::Arc;
use tracing::info;

use crate::{
    AdminCommand, CommandFanout, CommandSubscription, CoreError, CoreResult, SlotEvent,
    SlotService, slot::to_view, validate_minutes,
};

/// The core parking engine
pub struct ParkingEngine {
    slots: SlotService,
}

impl ParkingEngine {
    /// Create a new engine over `store`, publishing live commands to `fanout`
    pub fn new(store: Arc<dyn Store>, fanout: CommandFanout) -> Self {
        info!("Parking engine initialized");
        Self {
            slots: SlotService::new(store, fanout),
        }
    }

    pub fn slots(&self) -> &SlotService {
        &self.slots
    }

    // Provisioning

    /// Replace the fleet with SLOT-1..SLOT-count
    pub fn initialize_slots(&self, count: u32, now: DateTime<Local>) -> CoreResult<Vec<SlotView>> {
        let records = self.slots.initialize(count, now)?;
        Ok(records.iter().map(|r| to_view(r, now)).collect())
    }

    /// Add one slot. Without an id the next `SLOT-<n>` is used.
    pub fn add_slot(&self, slot_id: Option<SlotId>, now: DateTime<Local>) -> CoreResult<SlotView> {
        let slot_id = match slot_id {
            Some(id) => SlotId::parse(id.as_str())
                .map_err(|e| CoreError::Validation(e.to_string()))?,
            None => self.slots.next_slot_id()?,
        };

        let record = self.slots.create(slot_id, now)?;
        Ok(to_view(&record, now))
    }

    /// Provision `ids` on an empty store; a no-op otherwise
    pub fn ensure_slots(&self, ids: &[SlotId], now: DateTime<Local>) -> CoreResult<usize> {
        self.slots.ensure(ids, now)
    }

    /// Delete an AVAILABLE slot
    pub fn delete_slot(&self, slot_id: &SlotId, now: DateTime<Local>) -> CoreResult<()> {
        self.slots.delete(slot_id, now)
    }

    // Reads (may promote overdue sessions)

    pub fn get_slot(&self, slot_id: &SlotId, now: DateTime<Local>) -> CoreResult<SlotView> {
        let record = self.slots.get(slot_id, now)?;
        Ok(to_view(&record, now))
    }

    pub fn list_slots(&self, now: DateTime<Local>) -> CoreResult<Vec<SlotView>> {
        let records = self.slots.list(now)?;
        Ok(records.iter().map(|r| to_view(r, now)).collect())
    }

    /// Promote every overdue session without waiting for a read
    pub fn sweep_overstays(&self, now: DateTime<Local>) -> CoreResult<usize> {
        let promoted = self.slots.sweep(now)?;
        if promoted > 0 {
            info!(promoted, "Overstay sweep promoted sessions");
        }
        Ok(promoted)
    }

    // Events

    /// Payment flow entry point
    pub fn confirm_payment(
        &self,
        slot_id: &SlotId,
        minutes: u32,
        now: DateTime<Local>,
    ) -> CoreResult<SlotView> {
        let minutes = validate_minutes(minutes)?;
        self.handle_event(slot_id, SlotEvent::PaymentConfirmed { minutes }, now)
    }

    /// Apply a named event reported for a slot
    pub fn apply_event(
        &self,
        slot_id: &SlotId,
        event: &str,
        minutes: Option<u32>,
        now: DateTime<Local>,
    ) -> CoreResult<SlotView> {
        let event = SlotEvent::parse(event, minutes)?;
        self.handle_event(slot_id, event, now)
    }

    pub fn handle_event(
        &self,
        slot_id: &SlotId,
        event: SlotEvent,
        now: DateTime<Local>,
    ) -> CoreResult<SlotView> {
        let record = match event {
            SlotEvent::PaymentConfirmed { minutes } => {
                self.slots.apply_payment(slot_id, minutes, now)?
            }
            SlotEvent::CarEntered => self.slots.apply_entry(slot_id, now)?,
            SlotEvent::CarExited => self.slots.apply_exit(slot_id, now)?,
            SlotEvent::Overstay => self.slots.report_overstay(slot_id, now)?,
        };

        info!(slot_id = %slot_id, event = %event, status = %record.status, "Event applied");
        Ok(to_view(&record, now))
    }

    /// Apply a named operator override
    pub fn apply_admin_command(
        &self,
        slot_id: &SlotId,
        command: &str,
        now: DateTime<Local>,
    ) -> CoreResult<SlotView> {
        let command: AdminCommand = command.parse()?;

        let record = match command {
            AdminCommand::ForceOpenBarrier => self.slots.force_open(slot_id, now)?,
            AdminCommand::UnlockSlot => self.slots.unlock(slot_id, now)?,
            AdminCommand::ResetSlot => self.slots.reset_to_available(slot_id, now)?,
        };

        info!(slot_id = %slot_id, command = %command, status = %record.status, "Admin command applied");
        self.slots.audit(
            AuditEventType::AdminCommand {
                slot_id: slot_id.clone(),
                command: command.name().to_string(),
            },
            now,
        );
        Ok(to_view(&record, now))
    }

    // Hardware delivery

    /// Take the pending directive for a slot, after bringing its status up to date
    pub fn poll_command(&self, slot_id: &SlotId, now: DateTime<Local>) -> CoreResult<PolledCommand> {
        let record = self.slots.get(slot_id, now)?;
        let command = self.slots.mailbox().take_and_clear(slot_id)?;

        Ok(PolledCommand {
            slot_id: slot_id.clone(),
            status: record.status,
            command,
        })
    }

    /// Live feed of directives published for an existing slot from now on
    pub fn subscribe_commands(&self, slot_id: &SlotId) -> CoreResult<CommandSubscription> {
        if self.slots.store().get_slot(slot_id)?.is_none() {
            return Err(CoreError::NotFound(slot_id.clone()));
        }
        Ok(self.slots.fanout().subscribe(slot_id))
    }

    // Health

    pub fn subscriber_count(&self) -> usize {
        self.slots.fanout().subscriber_count()
    }

    pub fn slot_count(&self) -> CoreResult<usize> {
        Ok(self.slots.store().count_slots()?)
    }

    pub fn is_store_healthy(&self) -> bool {
        self.slots.store().is_healthy()
    }
}
