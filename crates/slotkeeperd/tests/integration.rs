//! Integration tests for slotkeeperd
//!
//! These tests drive the parking engine against a real SQLite store the same
//! way the daemon does, advancing the clock by passing later timestamps.

use chrono::{DateTime, Duration, Local, TimeZone};
use slotkeeper_api::{HardwareCommand, SlotStatus};
use slotkeeper_core::{CommandFanout, CoreError, ParkingEngine};
use slotkeeper_store::{AuditEventType, SqliteStore, Store};
use slotkeeper_util::SlotId;
use std::sync::{Arc, Barrier};
use std::thread;

fn t0() -> DateTime<Local> {
    Local.with_ymd_and_hms(2025, 3, 14, 8, 0, 0).unwrap()
}

fn make_engine() -> (ParkingEngine, Arc<dyn Store>) {
    let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().unwrap());
    let engine = ParkingEngine::new(store.clone(), CommandFanout::new());
    (engine, store)
}

#[test]
fn test_parking_session_end_to_end() {
    let (engine, _store) = make_engine();
    let slot = SlotId::new("SLOT-1");

    let view = engine.add_slot(None, t0()).unwrap();
    assert_eq!(view.slot_id, slot);
    assert_eq!(view.status, SlotStatus::Available);

    // Payment opens the barrier
    let view = engine.confirm_payment(&slot, 60, t0()).unwrap();
    assert_eq!(view.status, SlotStatus::Paid);
    assert_eq!(view.paid_minutes, 60);
    assert_eq!(
        engine.poll_command(&slot, t0()).unwrap().command,
        Some(HardwareCommand::OpenBarrier)
    );

    // Car arrives
    let view = engine.apply_event(&slot, "CAR_ENTERED", None, t0()).unwrap();
    assert_eq!(view.status, SlotStatus::Active);
    assert_eq!(view.start_time, Some(t0()));
    assert_eq!(view.remaining_minutes, 60);

    // Ninety minutes later a plain read promotes the session
    let later = t0() + Duration::minutes(90);
    let view = engine.get_slot(&slot, later).unwrap();
    assert_eq!(view.status, SlotStatus::Overstay);
    assert_eq!(view.exceeded_minutes, 30);
    assert_eq!(view.overstay_minutes, 30);
    assert_eq!(
        engine.poll_command(&slot, later).unwrap().command,
        Some(HardwareCommand::LockBarrier)
    );

    // Settling the overstay unlocks
    let view = engine.confirm_payment(&slot, 30, later).unwrap();
    assert_eq!(view.status, SlotStatus::Active);
    assert_eq!(view.paid_minutes, 90);
    assert_eq!(view.overstay_minutes, 0);
    assert_eq!(view.exceeded_minutes, 0);
    assert_eq!(
        engine.poll_command(&slot, later).unwrap().command,
        Some(HardwareCommand::Unlock)
    );

    // Driving away frees the slot
    let view = engine.apply_event(&slot, "CAR_EXITED", None, later).unwrap();
    assert_eq!(view.status, SlotStatus::Available);
    assert_eq!(view.paid_minutes, 0);
    assert_eq!(view.start_time, None);
    assert_eq!(view.end_time, Some(later));
}

#[test]
fn test_concurrent_payments_exactly_one_wins() {
    let (engine, _store) = make_engine();
    engine.initialize_slots(1, t0()).unwrap();

    let engine = Arc::new(engine);
    let slot = SlotId::numbered(1);
    let barrier = Arc::new(Barrier::new(2));

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let engine = engine.clone();
            let slot = slot.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                engine.confirm_payment(&slot, 60, t0())
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let wins = results.iter().filter(|r| r.is_ok()).count();
    let conflicts = results
        .iter()
        .filter(|r| matches!(r, Err(CoreError::Conflict(_))))
        .count();
    assert_eq!(wins, 1);
    assert_eq!(conflicts, 1);

    let view = engine.get_slot(&slot, t0()).unwrap();
    assert_eq!(view.status, SlotStatus::Paid);
    assert_eq!(view.paid_minutes, 60);
}

#[test]
fn test_delete_only_when_available() {
    let (engine, _store) = make_engine();
    engine.initialize_slots(2, t0()).unwrap();

    let paid = SlotId::numbered(1);
    engine.confirm_payment(&paid, 15, t0()).unwrap();

    assert!(matches!(
        engine.delete_slot(&paid, t0()),
        Err(CoreError::Conflict(_))
    ));
    engine.delete_slot(&SlotId::numbered(2), t0()).unwrap();
    assert!(matches!(
        engine.delete_slot(&SlotId::numbered(2), t0()),
        Err(CoreError::NotFound(_))
    ));

    let ids: Vec<_> = engine
        .list_slots(t0())
        .unwrap()
        .into_iter()
        .map(|v| v.slot_id)
        .collect();
    assert_eq!(ids, vec![paid]);
}

#[test]
fn test_initialize_refused_while_in_use() {
    let (engine, _store) = make_engine();
    engine.initialize_slots(3, t0()).unwrap();
    engine.confirm_payment(&SlotId::numbered(2), 10, t0()).unwrap();

    assert!(matches!(
        engine.initialize_slots(5, t0()),
        Err(CoreError::Conflict(_))
    ));
    assert_eq!(engine.slot_count().unwrap(), 3);

    engine
        .apply_admin_command(&SlotId::numbered(2), "RESET_SLOT", t0())
        .unwrap();
    let slots = engine.initialize_slots(5, t0()).unwrap();
    assert_eq!(slots.len(), 5);
    assert_eq!(slots[4].slot_id.as_str(), "SLOT-5");
}

#[test]
fn test_admin_reset_from_overstay() {
    let (engine, _store) = make_engine();
    engine.initialize_slots(1, t0()).unwrap();
    let slot = SlotId::numbered(1);

    engine.confirm_payment(&slot, 20, t0()).unwrap();
    engine.apply_event(&slot, "CAR_ENTERED", None, t0()).unwrap();

    let late = t0() + Duration::minutes(45);
    let view = engine.apply_event(&slot, "OVERSTAY", None, late).unwrap();
    assert_eq!(view.status, SlotStatus::Overstay);

    // Drain the lock directive from the promotion
    engine.poll_command(&slot, late).unwrap();

    let view = engine.apply_admin_command(&slot, "reset_slot", late).unwrap();
    assert_eq!(view.status, SlotStatus::Available);
    assert_eq!(view.paid_minutes, 0);
    assert_eq!(view.overstay_minutes, 0);
    assert_eq!(view.start_time, None);
    assert_eq!(view.end_time, None);
    assert_eq!(
        engine.poll_command(&slot, late).unwrap().command,
        Some(HardwareCommand::LockBarrier)
    );
}

#[test]
fn test_mailbox_round_trip_and_overwrite() {
    let (engine, _store) = make_engine();
    engine.initialize_slots(1, t0()).unwrap();
    let slot = SlotId::numbered(1);

    assert_eq!(engine.poll_command(&slot, t0()).unwrap().command, None);

    engine
        .apply_admin_command(&slot, "FORCE_OPEN_BARRIER", t0())
        .unwrap();
    engine.apply_admin_command(&slot, "UNLOCK_SLOT", t0()).unwrap();

    // Only the latest directive survives
    let polled = engine.poll_command(&slot, t0()).unwrap();
    assert_eq!(polled.status, SlotStatus::Available);
    assert_eq!(polled.command, Some(HardwareCommand::Unlock));

    for _ in 0..3 {
        assert_eq!(engine.poll_command(&slot, t0()).unwrap().command, None);
    }
}

#[test]
fn test_car_exit_on_available_is_idempotent() {
    let (engine, _store) = make_engine();
    engine.initialize_slots(1, t0()).unwrap();
    let slot = SlotId::numbered(1);

    let before = engine.get_slot(&slot, t0()).unwrap();
    for _ in 0..3 {
        let view = engine.apply_event(&slot, "CAR_EXITED", None, t0()).unwrap();
        assert_eq!(view, before);
    }
}

#[test]
fn test_in_use_slots_always_have_paid_minutes() {
    let (engine, _store) = make_engine();
    engine.initialize_slots(4, t0()).unwrap();

    let script: &[(u32, &str, Option<u32>, i64)] = &[
        (1, "PAYMENT_CONFIRMED", Some(30), 0),
        (2, "PAYMENT_CONFIRMED", Some(5), 0),
        (2, "CAR_ENTERED", None, 1),
        (3, "CAR_ENTERED", None, 1),
        (1, "CAR_ENTERED", None, 2),
        (4, "OVERSTAY", None, 3),
        (2, "OVERSTAY", None, 20),
        (3, "PAYMENT_CONFIRMED", Some(10), 21),
        (2, "PAYMENT_CONFIRMED", Some(15), 22),
        (1, "CAR_EXITED", None, 40),
        (3, "CAR_EXITED", None, 41),
    ];

    for (n, event, minutes, offset) in script {
        let now = t0() + Duration::minutes(*offset);
        // Some steps are meant to be rejected; the invariant must hold either way
        let _ = engine.apply_event(&SlotId::numbered(*n), event, *minutes, now);

        for view in engine.list_slots(now).unwrap() {
            if view.status.is_in_use() {
                assert!(view.paid_minutes > 0, "{} in use with no paid time", view.slot_id);
            } else {
                assert_eq!(view.paid_minutes, 0);
            }
            if view.start_time.is_some() {
                assert!(matches!(view.status, SlotStatus::Active | SlotStatus::Overstay));
            }
        }
    }
}

#[test]
fn test_unknown_slot_and_event() {
    let (engine, _store) = make_engine();
    engine.initialize_slots(1, t0()).unwrap();

    assert!(matches!(
        engine.apply_event(&SlotId::new("SLOT-99"), "CAR_ENTERED", None, t0()),
        Err(CoreError::NotFound(_))
    ));
    assert!(matches!(
        engine.apply_admin_command(&SlotId::new("SLOT-99"), "RESET_SLOT", t0()),
        Err(CoreError::NotFound(_))
    ));
    assert!(matches!(
        engine.apply_event(&SlotId::numbered(1), "CAR_TELEPORTED", None, t0()),
        Err(CoreError::InvalidEvent(_))
    ));
    assert!(matches!(
        engine.apply_event(&SlotId::numbered(1), "CAR_ENTERED", None, t0()),
        Err(CoreError::Conflict(_))
    ));
    assert!(matches!(
        engine.poll_command(&SlotId::new("SLOT-99"), t0()),
        Err(CoreError::NotFound(_))
    ));
}

#[test]
fn test_sweep_promotes_without_reads() {
    let (engine, _store) = make_engine();
    engine.initialize_slots(3, t0()).unwrap();

    for n in 1..=2 {
        let slot = SlotId::numbered(n);
        engine.confirm_payment(&slot, 10, t0()).unwrap();
        engine.apply_event(&slot, "CAR_ENTERED", None, t0()).unwrap();
    }

    assert_eq!(engine.sweep_overstays(t0() + Duration::minutes(5)).unwrap(), 0);
    assert_eq!(engine.sweep_overstays(t0() + Duration::minutes(11)).unwrap(), 2);
    assert_eq!(engine.sweep_overstays(t0() + Duration::minutes(12)).unwrap(), 0);
}

#[test]
fn test_state_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("slotkeeper.db");
    let slot = SlotId::numbered(1);

    {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open(&db_path).unwrap());
        let engine = ParkingEngine::new(store, CommandFanout::new());
        engine.initialize_slots(2, t0()).unwrap();
        engine.confirm_payment(&slot, 25, t0()).unwrap();
    }

    // A restart loses live subscribers but not the mailbox
    let store: Arc<dyn Store> = Arc::new(SqliteStore::open(&db_path).unwrap());
    let engine = ParkingEngine::new(store.clone(), CommandFanout::new());
    assert_eq!(
        engine.ensure_slots(&[SlotId::new("A1")], t0()).unwrap(),
        0
    );

    let view = engine.get_slot(&slot, t0()).unwrap();
    assert_eq!(view.status, SlotStatus::Paid);
    assert_eq!(view.paid_minutes, 25);
    assert_eq!(
        engine.poll_command(&slot, t0()).unwrap().command,
        Some(HardwareCommand::OpenBarrier)
    );
}

#[test]
fn test_audit_trail() {
    let (engine, store) = make_engine();
    engine.initialize_slots(1, t0()).unwrap();
    let slot = SlotId::numbered(1);
    engine.confirm_payment(&slot, 10, t0()).unwrap();

    let audits = store.get_recent_audits(10).unwrap();
    assert!(audits.iter().any(|a| matches!(
        &a.event,
        AuditEventType::SlotTransition {
            from: SlotStatus::Available,
            to: SlotStatus::Paid,
            ..
        }
    )));
    assert!(audits.iter().any(|a| matches!(
        &a.event,
        AuditEventType::CommandDispatched {
            command: HardwareCommand::OpenBarrier,
            listeners: 0,
            ..
        }
    )));
    assert!(
        audits
            .iter()
            .any(|a| matches!(&a.event, AuditEventType::SlotsInitialized { count: 1 }))
    );
}

#[tokio::test]
async fn test_live_subscribers_and_mailbox_both_receive() {
    let (engine, _store) = make_engine();
    engine.initialize_slots(2, t0()).unwrap();
    let slot = SlotId::numbered(1);

    let mut first = engine.subscribe_commands(&slot).unwrap();
    let mut second = engine.subscribe_commands(&slot).unwrap();
    let mut other = engine.subscribe_commands(&SlotId::numbered(2)).unwrap();

    engine.confirm_payment(&slot, 30, t0()).unwrap();

    assert_eq!(first.recv().await, Some(HardwareCommand::OpenBarrier));
    assert_eq!(second.recv().await, Some(HardwareCommand::OpenBarrier));
    assert_eq!(other.try_recv(), None);

    // The mailbox got the same directive
    assert_eq!(
        engine.poll_command(&slot, t0()).unwrap().command,
        Some(HardwareCommand::OpenBarrier)
    );

    // No replay for late subscribers
    let mut late = engine.subscribe_commands(&slot).unwrap();
    assert_eq!(late.try_recv(), None);

    first.unsubscribe();
    first.unsubscribe();
    assert_eq!(engine.subscriber_count(), 3);

    engine
        .apply_admin_command(&slot, "FORCE_OPEN_BARRIER", t0())
        .unwrap();
    assert_eq!(second.recv().await, Some(HardwareCommand::ForceOpenBarrier));
    assert_eq!(late.recv().await, Some(HardwareCommand::ForceOpenBarrier));
}
