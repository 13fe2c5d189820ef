//! SQLite-based store implementation

use chrono::{DateTime, Local};
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use slotkeeper_api::{HardwareCommand, SlotStatus};
use slotkeeper_util::SlotId;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

use crate::{AuditEvent, SlotFilter, SlotRecord, Store, StoreError, StoreResult};

const SLOT_COLUMNS: &str = "slot_id, status, paid_minutes, start_time, end_time, \
     overstay_minutes, pending_command, created_at, updated_at, version";

/// SQLite-based store
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a store at the given path
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    // A panic while holding the lock cannot leave a statement half-applied,
    // so a poisoned connection is still usable.
    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn init_schema(&self) -> StoreResult<()> {
        let conn = self.conn();

        conn.execute_batch(
            r#"
            -- One row per physical slot; seq keeps creation order
            CREATE TABLE IF NOT EXISTS slots (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                slot_id TEXT NOT NULL UNIQUE,
                status TEXT NOT NULL,
                paid_minutes INTEGER NOT NULL DEFAULT 0,
                start_time TEXT,
                end_time TEXT,
                overstay_minutes INTEGER NOT NULL DEFAULT 0,
                pending_command TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                version INTEGER NOT NULL DEFAULT 0
            );

            -- Audit log (append-only)
            CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                event_json TEXT NOT NULL
            );

            -- Indexes
            CREATE INDEX IF NOT EXISTS idx_slots_status ON slots(status);
            CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_log(timestamp);
            "#,
        )?;

        debug!("Store schema initialized");
        Ok(())
    }
}

fn insert_record(conn: &Connection, record: &SlotRecord) -> StoreResult<()> {
    let result = conn.execute(
        &format!(
            "INSERT INTO slots ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            SLOT_COLUMNS
        ),
        params![
            record.slot_id.as_str(),
            record.status.as_str(),
            record.paid_minutes,
            record.start_time.map(|t| t.to_rfc3339()),
            record.end_time.map(|t| t.to_rfc3339()),
            record.overstay_minutes,
            record.pending_command.map(|c| c.as_str()),
            record.created_at.to_rfc3339(),
            record.updated_at.to_rfc3339(),
            record.version,
        ],
    );

    match result {
        Ok(_) => Ok(()),
        Err(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Err(StoreError::AlreadyExists(record.slot_id.to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

/// Column values as stored, before parsing into domain types
struct SlotRow {
    slot_id: String,
    status: String,
    paid_minutes: u32,
    start_time: Option<String>,
    end_time: Option<String>,
    overstay_minutes: u32,
    pending_command: Option<String>,
    created_at: String,
    updated_at: String,
    version: i64,
}

impl SlotRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            slot_id: row.get(0)?,
            status: row.get(1)?,
            paid_minutes: row.get(2)?,
            start_time: row.get(3)?,
            end_time: row.get(4)?,
            overstay_minutes: row.get(5)?,
            pending_command: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
            version: row.get(9)?,
        })
    }

    fn into_record(self) -> StoreResult<SlotRecord> {
        Ok(SlotRecord {
            slot_id: SlotId::new(self.slot_id),
            status: parse_status(&self.status)?,
            paid_minutes: self.paid_minutes,
            start_time: self.start_time.as_deref().map(parse_time).transpose()?,
            end_time: self.end_time.as_deref().map(parse_time).transpose()?,
            overstay_minutes: self.overstay_minutes,
            pending_command: self
                .pending_command
                .as_deref()
                .map(parse_command)
                .transpose()?,
            created_at: parse_time(&self.created_at)?,
            updated_at: parse_time(&self.updated_at)?,
            version: self.version,
        })
    }
}

fn parse_time(s: &str) -> StoreResult<DateTime<Local>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Local))
        .map_err(|e| StoreError::Serialization(format!("bad timestamp {:?}: {}", s, e)))
}

fn parse_status(s: &str) -> StoreResult<SlotStatus> {
    s.parse()
        .map_err(|e: slotkeeper_api::UnknownName| StoreError::Serialization(e.to_string()))
}

fn parse_command(s: &str) -> StoreResult<HardwareCommand> {
    s.parse()
        .map_err(|e: slotkeeper_api::UnknownName| StoreError::Serialization(e.to_string()))
}

impl Store for SqliteStore {
    fn insert_slot(&self, record: &SlotRecord) -> StoreResult<()> {
        let conn = self.conn();
        insert_record(&conn, record)?;
        debug!(slot_id = %record.slot_id, "Slot inserted");
        Ok(())
    }

    fn get_slot(&self, slot_id: &SlotId) -> StoreResult<Option<SlotRecord>> {
        let conn = self.conn();

        let row = conn
            .query_row(
                &format!("SELECT {} FROM slots WHERE slot_id = ?", SLOT_COLUMNS),
                [slot_id.as_str()],
                SlotRow::read,
            )
            .optional()?;

        row.map(SlotRow::into_record).transpose()
    }

    fn list_slots(&self, filter: &SlotFilter) -> StoreResult<Vec<SlotRecord>> {
        let conn = self.conn();

        let statuses: Vec<&str> = filter
            .statuses
            .iter()
            .flatten()
            .map(|s| s.as_str())
            .collect();

        let sql = match &filter.statuses {
            None => format!("SELECT {} FROM slots ORDER BY seq", SLOT_COLUMNS),
            Some(_) if statuses.is_empty() => return Ok(Vec::new()),
            Some(_) => format!(
                "SELECT {} FROM slots WHERE status IN ({}) ORDER BY seq",
                SLOT_COLUMNS,
                vec!["?"; statuses.len()].join(", ")
            ),
        };

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(statuses.iter()), SlotRow::read)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?.into_record()?);
        }

        Ok(records)
    }

    fn count_slots(&self) -> StoreResult<usize> {
        let conn = self.conn();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM slots", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn update_slot(
        &self,
        record: &SlotRecord,
        expected_version: i64,
        command: Option<HardwareCommand>,
    ) -> StoreResult<bool> {
        let conn = self.conn();

        let changed = conn.execute(
            r#"
            UPDATE slots SET
                status = ?1,
                paid_minutes = ?2,
                start_time = ?3,
                end_time = ?4,
                overstay_minutes = ?5,
                pending_command = COALESCE(?6, pending_command),
                updated_at = ?7,
                version = version + 1
            WHERE slot_id = ?8 AND version = ?9
            "#,
            params![
                record.status.as_str(),
                record.paid_minutes,
                record.start_time.map(|t| t.to_rfc3339()),
                record.end_time.map(|t| t.to_rfc3339()),
                record.overstay_minutes,
                command.map(|c| c.as_str()),
                record.updated_at.to_rfc3339(),
                record.slot_id.as_str(),
                expected_version,
            ],
        )?;

        debug!(
            slot_id = %record.slot_id,
            status = %record.status,
            expected_version,
            applied = changed == 1,
            "Slot update"
        );
        Ok(changed == 1)
    }

    fn delete_slot(&self, slot_id: &SlotId, expected: SlotStatus) -> StoreResult<bool> {
        let conn = self.conn();
        let changed = conn.execute(
            "DELETE FROM slots WHERE slot_id = ? AND status = ?",
            params![slot_id.as_str(), expected.as_str()],
        )?;
        Ok(changed == 1)
    }

    fn replace_all_slots(&self, records: &[SlotRecord]) -> StoreResult<bool> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let in_use: i64 = tx.query_row(
            "SELECT COUNT(*) FROM slots WHERE status != ?",
            [SlotStatus::Available.as_str()],
            |row| row.get(0),
        )?;
        if in_use > 0 {
            debug!(in_use, "Refusing to replace fleet with slots in use");
            return Ok(false);
        }

        tx.execute("DELETE FROM slots", [])?;
        for record in records {
            insert_record(&tx, record)?;
        }
        tx.commit()?;

        debug!(count = records.len(), "Fleet replaced");
        Ok(true)
    }

    fn set_pending_command(
        &self,
        slot_id: &SlotId,
        command: HardwareCommand,
        at: DateTime<Local>,
    ) -> StoreResult<bool> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE slots SET pending_command = ?, updated_at = ? WHERE slot_id = ?",
            params![command.as_str(), at.to_rfc3339(), slot_id.as_str()],
        )?;
        Ok(changed == 1)
    }

    fn take_pending_command(&self, slot_id: &SlotId) -> StoreResult<Option<HardwareCommand>> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let pending: Option<Option<String>> = tx
            .query_row(
                "SELECT pending_command FROM slots WHERE slot_id = ?",
                [slot_id.as_str()],
                |row| row.get(0),
            )
            .optional()?;

        let Some(pending) = pending else {
            return Err(StoreError::NotFound(slot_id.to_string()));
        };

        if pending.is_some() {
            tx.execute(
                "UPDATE slots SET pending_command = NULL WHERE slot_id = ?",
                [slot_id.as_str()],
            )?;
        }
        tx.commit()?;

        pending.as_deref().map(parse_command).transpose()
    }

    fn append_audit(&self, mut event: AuditEvent) -> StoreResult<()> {
        let conn = self.conn();
        let event_json = serde_json::to_string(&event.event)?;

        conn.execute(
            "INSERT INTO audit_log (timestamp, event_json) VALUES (?, ?)",
            params![event.timestamp.to_rfc3339(), event_json],
        )?;

        event.id = conn.last_insert_rowid();
        debug!(event_id = event.id, "Audit event appended");

        Ok(())
    }

    fn get_recent_audits(&self, limit: usize) -> StoreResult<Vec<AuditEvent>> {
        let conn = self.conn();

        let mut stmt = conn.prepare(
            "SELECT id, timestamp, event_json FROM audit_log ORDER BY id DESC LIMIT ?",
        )?;

        let rows = stmt.query_map([limit], |row| {
            let id: i64 = row.get(0)?;
            let timestamp_str: String = row.get(1)?;
            let event_json: String = row.get(2)?;
            Ok((id, timestamp_str, event_json))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (id, timestamp_str, event_json) = row?;
            let timestamp = parse_time(&timestamp_str)?;
            let event: crate::AuditEventType = serde_json::from_str(&event_json)?;

            events.push(AuditEvent {
                id,
                timestamp,
                event,
            });
        }

        Ok(events)
    }

    fn is_healthy(&self) -> bool {
        match self.conn.lock() {
            Ok(conn) => conn.query_row("SELECT 1", [], |_| Ok(())).is_ok(),
            Err(_) => {
                warn!("Store lock poisoned");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AuditEventType;
    use chrono::TimeZone;

    fn t0() -> DateTime<Local> {
        Local.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap()
    }

    fn store_with(ids: &[&str]) -> SqliteStore {
        let store = SqliteStore::in_memory().unwrap();
        for id in ids {
            store
                .insert_slot(&SlotRecord::available(SlotId::new(*id), t0()))
                .unwrap();
        }
        store
    }

    fn paid(store: &SqliteStore, id: &str) -> SlotRecord {
        let mut record = store.get_slot(&SlotId::new(id)).unwrap().unwrap();
        record.status = SlotStatus::Paid;
        record.paid_minutes = 60;
        record
    }

    #[test]
    fn test_in_memory_store() {
        let store = SqliteStore::in_memory().unwrap();
        assert!(store.is_healthy());
        assert_eq!(store.count_slots().unwrap(), 0);
    }

    #[test]
    fn test_insert_and_get() {
        let store = store_with(&["SLOT-1"]);

        let record = store.get_slot(&SlotId::new("SLOT-1")).unwrap().unwrap();
        assert_eq!(record, SlotRecord::available(SlotId::new("SLOT-1"), t0()));
        assert!(store.get_slot(&SlotId::new("SLOT-9")).unwrap().is_none());
    }

    #[test]
    fn test_duplicate_insert() {
        let store = store_with(&["A1"]);
        let result = store.insert_slot(&SlotRecord::available(SlotId::new("A1"), t0()));
        assert!(matches!(result, Err(StoreError::AlreadyExists(id)) if id == "A1"));
    }

    #[test]
    fn test_list_keeps_creation_order() {
        let ids: Vec<String> = (1..=12).map(|n| format!("SLOT-{}", n)).collect();
        let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        let store = store_with(&refs);

        let listed = store.list_slots(&SlotFilter::all()).unwrap();
        let listed: Vec<&str> = listed.iter().map(|r| r.slot_id.as_str()).collect();
        assert_eq!(listed, refs);
    }

    #[test]
    fn test_list_filter() {
        let store = store_with(&["A1", "A2", "A3"]);
        let record = paid(&store, "A2");
        assert!(store.update_slot(&record, record.version, None).unwrap());

        let busy = store
            .list_slots(&SlotFilter::with_status([SlotStatus::Paid, SlotStatus::Active]))
            .unwrap();
        assert_eq!(busy.len(), 1);
        assert_eq!(busy[0].slot_id.as_str(), "A2");

        let none = store
            .list_slots(&SlotFilter {
                statuses: Some(Vec::new()),
            })
            .unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn test_conditional_update() {
        let store = store_with(&["A1"]);
        let record = paid(&store, "A1");
        assert_eq!(record.version, 0);

        assert!(store.update_slot(&record, record.version, None).unwrap());
        // Already written once; the second writer loses
        assert!(!store.update_slot(&record, record.version, None).unwrap());

        let stored = store.get_slot(&SlotId::new("A1")).unwrap().unwrap();
        assert_eq!(stored.status, SlotStatus::Paid);
        assert_eq!(stored.paid_minutes, 60);
        assert_eq!(stored.version, 1);
    }

    #[test]
    fn test_stale_write_after_full_cycle() {
        let store = store_with(&["A1"]);
        let id = SlotId::new("A1");

        let mut stale = store.get_slot(&id).unwrap().unwrap();
        stale.status = SlotStatus::Paid;
        stale.paid_minutes = 30;

        // Someone else runs a whole session and leaves the slot AVAILABLE again
        let session = paid(&store, "A1");
        assert!(store.update_slot(&session, session.version, None).unwrap());
        let mut done = store.get_slot(&id).unwrap().unwrap();
        done.status = SlotStatus::Available;
        done.paid_minutes = 0;
        assert!(store.update_slot(&done, done.version, None).unwrap());

        // Same status as the stale snapshot, but it was written in between
        assert!(!store.update_slot(&stale, stale.version, None).unwrap());
        let stored = store.get_slot(&id).unwrap().unwrap();
        assert_eq!(stored.status, SlotStatus::Available);
        assert_eq!(stored.paid_minutes, 0);
        assert_eq!(stored.version, 2);
    }

    #[test]
    fn test_update_writes_mailbox_with_transition() {
        let store = store_with(&["A1"]);
        let id = SlotId::new("A1");

        let record = paid(&store, "A1");
        store
            .update_slot(&record, record.version, Some(HardwareCommand::OpenBarrier))
            .unwrap();
        assert_eq!(
            store.get_slot(&id).unwrap().unwrap().pending_command,
            Some(HardwareCommand::OpenBarrier)
        );

        // No command leaves an unread directive in place
        let mut record = store.get_slot(&id).unwrap().unwrap();
        record.status = SlotStatus::Active;
        record.start_time = Some(t0());
        store.update_slot(&record, record.version, None).unwrap();
        assert_eq!(
            store.take_pending_command(&id).unwrap(),
            Some(HardwareCommand::OpenBarrier)
        );
    }

    #[test]
    fn test_update_unknown_slot() {
        let store = SqliteStore::in_memory().unwrap();
        let record = SlotRecord::available(SlotId::new("ghost"), t0());
        assert!(!store.update_slot(&record, 0, None).unwrap());
    }

    #[test]
    fn test_conditional_delete() {
        let store = store_with(&["A1", "A2"]);
        let record = paid(&store, "A2");
        store.update_slot(&record, record.version, None).unwrap();

        assert!(
            store
                .delete_slot(&SlotId::new("A1"), SlotStatus::Available)
                .unwrap()
        );
        assert!(
            !store
                .delete_slot(&SlotId::new("A2"), SlotStatus::Available)
                .unwrap()
        );
        assert_eq!(store.count_slots().unwrap(), 1);
    }

    #[test]
    fn test_replace_all_slots() {
        let store = store_with(&["A1", "A2"]);
        let fleet: Vec<SlotRecord> = (1..=3)
            .map(|n| SlotRecord::available(SlotId::numbered(n), t0()))
            .collect();

        assert!(store.replace_all_slots(&fleet).unwrap());
        let ids: Vec<String> = store
            .list_slots(&SlotFilter::all())
            .unwrap()
            .into_iter()
            .map(|r| r.slot_id.to_string())
            .collect();
        assert_eq!(ids, ["SLOT-1", "SLOT-2", "SLOT-3"]);
    }

    #[test]
    fn test_replace_refused_while_in_use() {
        let store = store_with(&["A1", "A2"]);
        let record = paid(&store, "A1");
        store.update_slot(&record, record.version, None).unwrap();

        let fleet = vec![SlotRecord::available(SlotId::numbered(1), t0())];
        assert!(!store.replace_all_slots(&fleet).unwrap());
        assert_eq!(store.count_slots().unwrap(), 2);
        assert!(store.get_slot(&SlotId::new("A1")).unwrap().is_some());
    }

    #[test]
    fn test_mailbox_take_and_clear() {
        let store = store_with(&["A1"]);
        let id = SlotId::new("A1");

        assert_eq!(store.take_pending_command(&id).unwrap(), None);

        let later = t0() + chrono::Duration::minutes(5);
        assert!(
            store
                .set_pending_command(&id, HardwareCommand::Unlock, t0())
                .unwrap()
        );
        // Depth one: the later directive replaces the unread one
        store
            .set_pending_command(&id, HardwareCommand::LockBarrier, later)
            .unwrap();

        // A directive stamps the record but does not count as a session write
        let stored = store.get_slot(&id).unwrap().unwrap();
        assert_eq!(stored.updated_at, later);
        assert_eq!(stored.version, 0);

        assert_eq!(
            store.take_pending_command(&id).unwrap(),
            Some(HardwareCommand::LockBarrier)
        );
        assert_eq!(store.take_pending_command(&id).unwrap(), None);
    }

    #[test]
    fn test_mailbox_unknown_slot() {
        let store = SqliteStore::in_memory().unwrap();
        let id = SlotId::new("ghost");

        assert!(
            !store
                .set_pending_command(&id, HardwareCommand::Unlock, t0())
                .unwrap()
        );
        assert!(matches!(
            store.take_pending_command(&id),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("slots.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            store
                .insert_slot(&SlotRecord::available(SlotId::new("A1"), t0()))
                .unwrap();
            store
                .set_pending_command(&SlotId::new("A1"), HardwareCommand::LockBarrier, t0())
                .unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.count_slots().unwrap(), 1);
        assert_eq!(
            store.take_pending_command(&SlotId::new("A1")).unwrap(),
            Some(HardwareCommand::LockBarrier)
        );
    }

    #[test]
    fn test_audit_log() {
        let store = SqliteStore::in_memory().unwrap();

        store
            .append_audit(AuditEvent::new(AuditEventType::ServiceStarted))
            .unwrap();
        store
            .append_audit(AuditEvent::new(AuditEventType::SlotAdded {
                slot_id: SlotId::new("A1"),
            }))
            .unwrap();

        let events = store.get_recent_audits(10).unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0].event, AuditEventType::SlotAdded { .. }));
        assert!(matches!(events[1].event, AuditEventType::ServiceStarted));
    }
}
