//! Authoritative slot records
//!
//! Reads are self-healing: `get` and `list` run every PAID/ACTIVE record
//! through the session clock, and an overdue one is promoted to OVERSTAY
//! (with LOCK_BARRIER dispatched) before it is returned. A read can
//! therefore write. Callers that need a pure snapshot must go to the store.
//!
//! Writes are conditional on the version of the record the rule was
//! evaluated against, so two writers racing on one slot cannot both win,
//! even when the slot has cycled back to the same status in between. The
//! loser re-reads and re-evaluates, which usually turns into a `Conflict`.

use chrono::{DateTime, Local};
use slotkeeper_api::{HardwareCommand, SlotStatus};
use slotkeeper_store::{
    AuditEvent, AuditEventType, SlotFilter, SlotRecord, Store, StoreError,
};
use slotkeeper_util::{MAX_SLOT_COUNT, SlotId};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::{
    CommandFanout, CoreError, CoreResult, PendingCommandMailbox, SlotAction, slot, time_info,
};

/// How often a conditional write is retried after losing a race
const MAX_ATTEMPTS: usize = 4;

pub struct SlotService {
    store: Arc<dyn Store>,
    mailbox: PendingCommandMailbox,
    fanout: CommandFanout,
}

impl SlotService {
    pub fn new(store: Arc<dyn Store>, fanout: CommandFanout) -> Self {
        Self {
            mailbox: PendingCommandMailbox::new(Arc::clone(&store)),
            store,
            fanout,
        }
    }

    pub fn mailbox(&self) -> &PendingCommandMailbox {
        &self.mailbox
    }

    pub fn fanout(&self) -> &CommandFanout {
        &self.fanout
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    // Provisioning

    /// Provision one AVAILABLE slot
    pub fn create(&self, slot_id: SlotId, now: DateTime<Local>) -> CoreResult<SlotRecord> {
        let record = SlotRecord::available(slot_id, now);

        match self.store.insert_slot(&record) {
            Ok(()) => {}
            Err(StoreError::AlreadyExists(_)) => {
                return Err(CoreError::Conflict(format!(
                    "slot {} already exists",
                    record.slot_id
                )));
            }
            Err(e) => return Err(e.into()),
        }

        info!(slot_id = %record.slot_id, "Slot added");
        self.audit(
            AuditEventType::SlotAdded {
                slot_id: record.slot_id.clone(),
            },
            now,
        );
        Ok(record)
    }

    /// Next id in the `SLOT-<n>` sequence, one past the highest in use
    pub fn next_slot_id(&self) -> CoreResult<SlotId> {
        let highest = self
            .store
            .list_slots(&SlotFilter::all())?
            .iter()
            .filter_map(|r| r.slot_id.number())
            .max()
            .unwrap_or(0);

        highest
            .checked_add(1)
            .map(SlotId::numbered)
            .ok_or_else(|| CoreError::Validation("slot numbering exhausted".into()))
    }

    /// Replace the fleet with SLOT-1..SLOT-count. Refused while any slot is in use.
    pub fn initialize(&self, count: u32, now: DateTime<Local>) -> CoreResult<Vec<SlotRecord>> {
        if count == 0 || count > MAX_SLOT_COUNT {
            return Err(CoreError::Validation(format!(
                "slot count must be between 1 and {}",
                MAX_SLOT_COUNT
            )));
        }

        let records: Vec<SlotRecord> = (1..=count)
            .map(|n| SlotRecord::available(SlotId::numbered(n), now))
            .collect();

        if !self.store.replace_all_slots(&records)? {
            return Err(CoreError::Conflict(
                "cannot reinitialize while slots are in use".into(),
            ));
        }

        info!(count, "Slots initialized");
        self.audit(AuditEventType::SlotsInitialized { count }, now);
        Ok(records)
    }

    /// Provision `ids` if the store holds no slots yet. Returns how many were created.
    pub fn ensure(&self, ids: &[SlotId], now: DateTime<Local>) -> CoreResult<usize> {
        if self.store.count_slots()? > 0 || ids.is_empty() {
            return Ok(0);
        }

        let records: Vec<SlotRecord> = ids
            .iter()
            .map(|id| SlotRecord::available(id.clone(), now))
            .collect();

        if !self.store.replace_all_slots(&records)? {
            return Ok(0);
        }

        info!(count = records.len(), "Initial fleet provisioned");
        self.audit(
            AuditEventType::SlotsInitialized {
                count: records.len() as u32,
            },
            now,
        );
        Ok(records.len())
    }

    /// Remove an AVAILABLE slot
    pub fn delete(&self, slot_id: &SlotId, now: DateTime<Local>) -> CoreResult<()> {
        if !self
            .store
            .delete_slot(slot_id, SlotStatus::Available)?
        {
            return match self.store.get_slot(slot_id)? {
                Some(current) => Err(CoreError::Conflict(format!(
                    "cannot delete slot {} while {}",
                    slot_id, current.status
                ))),
                None => Err(CoreError::NotFound(slot_id.clone())),
            };
        }

        info!(slot_id = %slot_id, "Slot deleted");
        self.audit(
            AuditEventType::SlotDeleted {
                slot_id: slot_id.clone(),
            },
            now,
        );
        Ok(())
    }

    // Reads (self-healing)

    /// Read one slot, promoting it to OVERSTAY if its time ran out
    pub fn get(&self, slot_id: &SlotId, now: DateTime<Local>) -> CoreResult<SlotRecord> {
        let record = self
            .store
            .get_slot(slot_id)?
            .ok_or_else(|| CoreError::NotFound(slot_id.clone()))?;
        self.heal(record, now)
    }

    /// Read every slot, promoting overdue ones along the way
    pub fn list(&self, now: DateTime<Local>) -> CoreResult<Vec<SlotRecord>> {
        self.store
            .list_slots(&SlotFilter::all())?
            .into_iter()
            .map(|record| self.heal(record, now))
            .collect()
    }

    /// Promote every overdue session. Returns how many were promoted.
    pub fn sweep(&self, now: DateTime<Local>) -> CoreResult<usize> {
        let candidates = self.store.list_slots(&SlotFilter::with_status([
            SlotStatus::Paid,
            SlotStatus::Active,
        ]))?;

        let mut promoted = 0;
        for record in candidates {
            let before = record.status;
            if self.heal(record, now)?.status != before {
                promoted += 1;
            }
        }
        Ok(promoted)
    }

    fn heal(&self, record: SlotRecord, now: DateTime<Local>) -> CoreResult<SlotRecord> {
        if !record.status.can_overstay() {
            return Ok(record);
        }

        let info = time_info(record.start_time, record.paid_minutes, now);
        if !info.is_exceeded() {
            return Ok(record);
        }

        let action = slot::promote_overstay(&record, info.exceeded_minutes, now);
        match self.commit(&record, action, "overstay_detected", now)? {
            Some(promoted) => Ok(promoted),
            None => {
                debug!(slot_id = %record.slot_id, "Overstay promotion lost to a concurrent update");
                self.store
                    .get_slot(&record.slot_id)?
                    .ok_or_else(|| CoreError::NotFound(record.slot_id.clone()))
            }
        }
    }

    // Transitions

    /// Payment confirmed: new reservation or overstay settlement
    pub fn apply_payment(
        &self,
        slot_id: &SlotId,
        minutes: u32,
        now: DateTime<Local>,
    ) -> CoreResult<SlotRecord> {
        self.apply(slot_id, now, "payment_confirmed", |r| slot::pay(r, minutes, now))
    }

    pub fn apply_entry(&self, slot_id: &SlotId, now: DateTime<Local>) -> CoreResult<SlotRecord> {
        self.apply(slot_id, now, "car_entered", |r| slot::enter(r, now))
    }

    pub fn apply_exit(&self, slot_id: &SlotId, now: DateTime<Local>) -> CoreResult<SlotRecord> {
        self.apply(slot_id, now, "car_exited", |r| Ok(slot::exit(r, now)))
    }

    /// Overstay reported by a sensor
    pub fn report_overstay(
        &self,
        slot_id: &SlotId,
        now: DateTime<Local>,
    ) -> CoreResult<SlotRecord> {
        self.apply(slot_id, now, "overstay_reported", |r| {
            slot::report_overstay(r, now)
        })
    }

    pub fn reset_to_available(
        &self,
        slot_id: &SlotId,
        now: DateTime<Local>,
    ) -> CoreResult<SlotRecord> {
        self.apply(slot_id, now, "admin_reset", |r| Ok(slot::reset(r, now)))
    }

    pub fn unlock(&self, slot_id: &SlotId, now: DateTime<Local>) -> CoreResult<SlotRecord> {
        self.apply(slot_id, now, "admin_unlock", |r| Ok(slot::unlock(r, now)))
    }

    pub fn force_open(&self, slot_id: &SlotId, now: DateTime<Local>) -> CoreResult<SlotRecord> {
        self.apply(slot_id, now, "admin_force_open", |r| Ok(slot::force_open(r)))
    }

    fn apply(
        &self,
        slot_id: &SlotId,
        now: DateTime<Local>,
        trigger: &'static str,
        rule: impl Fn(&SlotRecord) -> CoreResult<SlotAction>,
    ) -> CoreResult<SlotRecord> {
        for attempt in 1..=MAX_ATTEMPTS {
            let current = self.get(slot_id, now)?;
            let action = rule(&current)?;
            if let Some(record) = self.commit(&current, action, trigger, now)? {
                return Ok(record);
            }
            debug!(slot_id = %slot_id, attempt, trigger, "Slot changed underneath, retrying");
        }

        Err(CoreError::Conflict(format!(
            "slot {} kept changing, try again",
            slot_id
        )))
    }

    /// Persist an action taken against `current`. `None` when the slot was
    /// written by someone else before this write landed.
    ///
    /// A directive-only dispatch does not bump the version: it leaves the
    /// session alone, and the mailbox is last-write-wins anyway.
    ///
    /// The mailbox is written before live subscribers hear anything, so a
    /// poller is never behind the push channel.
    fn commit(
        &self,
        current: &SlotRecord,
        action: SlotAction,
        trigger: &'static str,
        now: DateTime<Local>,
    ) -> CoreResult<Option<SlotRecord>> {
        match action {
            SlotAction::Unchanged => Ok(Some(current.clone())),
            SlotAction::Dispatch(command) => {
                self.mailbox.set(&current.slot_id, command, now)?;
                self.publish(&current.slot_id, command, now);
                Ok(Some(SlotRecord {
                    pending_command: Some(command),
                    updated_at: now,
                    ..current.clone()
                }))
            }
            SlotAction::Transition { record, command } => {
                if !self.store.update_slot(&record, current.version, command)? {
                    return Ok(None);
                }
                let record = SlotRecord {
                    version: current.version + 1,
                    ..record
                };

                if record.status != current.status {
                    info!(
                        slot_id = %record.slot_id,
                        from = %current.status,
                        to = %record.status,
                        trigger,
                        paid_minutes = record.paid_minutes,
                        overstay_minutes = record.overstay_minutes,
                        "Slot transition"
                    );
                    self.audit(
                        AuditEventType::SlotTransition {
                            slot_id: record.slot_id.clone(),
                            from: current.status,
                            to: record.status,
                            trigger: trigger.to_string(),
                        },
                        now,
                    );
                }

                if let Some(command) = command {
                    self.publish(&record.slot_id, command, now);
                }
                Ok(Some(record))
            }
        }
    }

    fn publish(&self, slot_id: &SlotId, command: HardwareCommand, now: DateTime<Local>) {
        let listeners = self.fanout.publish(slot_id, command);
        debug!(slot_id = %slot_id, command = %command, listeners, "Directive dispatched");
        self.audit(
            AuditEventType::CommandDispatched {
                slot_id: slot_id.clone(),
                command,
                listeners,
            },
            now,
        );
    }

    pub(crate) fn audit(&self, event: AuditEventType, now: DateTime<Local>) {
        if let Err(e) = self.store.append_audit(AuditEvent::at(event, now)) {
            warn!(error = %e, "Failed to append audit event");
        }
    }
}
