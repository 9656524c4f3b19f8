use ulid::Ulid;

use super::*;
use crate::clock::ManualClock;
use crate::limits::*;

const M: Ms = 60_000; // 1 minute in ms
const T0: Ms = 1_700_000_000_000;

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("slotward_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn layout_config(zones: &[&str], areas_per_zone: u16, slots_per_area: u16) -> EngineConfig {
    EngineConfig {
        zones: zones.iter().map(|z| ZoneId::new(*z)).collect(),
        areas_per_zone,
        slots_per_area,
        max_undo: DEFAULT_MAX_UNDO,
    }
}

fn open(path: &PathBuf, config: EngineConfig) -> (Engine, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(T0));
    let notify = Arc::new(NotifyHub::new());
    let engine = Engine::with_clock(path.clone(), config, notify, clock.clone()).unwrap();
    (engine, clock)
}

fn zone(name: &str) -> ZoneId {
    ZoneId::new(name)
}

fn vehicle(id: &str) -> VehicleId {
    VehicleId::new(id)
}

fn slot(id: &str) -> SlotId {
    id.parse().unwrap()
}

async fn snapshot(engine: &Engine) -> State {
    engine.state.read().await.clone()
}

/// Register `id` and open a request for it in `zone_name`.
async fn open_request(engine: &Engine, id: &str, zone_name: &str) -> RequestId {
    let v = vehicle(id);
    if engine.get_vehicle(&v).await.is_err() {
        engine.register_vehicle(&v, &zone(zone_name)).await.unwrap();
    }
    engine.create_request(&v, &zone(zone_name)).await.unwrap().id
}

// ── Lifecycle scenarios ──────────────────────────────────

#[tokio::test]
async fn full_lifecycle_in_requested_zone() {
    let path = test_wal_path("full_lifecycle.wal");
    let (engine, clock) = open(&path, layout_config(&["A"], 1, 1));

    let rid = open_request(&engine, "V1", "A").await;
    let request = engine.get_request(rid).await.unwrap();
    assert_eq!(request.state, RequestState::Requested);
    assert!(request.is_active());
    assert_eq!(request.allocated_slot, None);

    let request = engine.allocate(rid).await.unwrap();
    assert_eq!(request.state, RequestState::Allocated);
    assert_eq!(request.allocated_slot, Some(slot("A-1-1")));
    assert!(!request.cross_zone);
    let held = engine.get_slot(&slot("A-1-1")).await.unwrap();
    assert_eq!(held.occupant, Some(vehicle("V1")));
    assert!(!held.is_available());

    clock.advance(2 * M);
    let request = engine.occupy(rid).await.unwrap();
    assert_eq!(request.state, RequestState::Occupied);
    assert_eq!(request.occupied_at, Some(T0 + 2 * M));

    clock.advance(45 * M + 30_000);
    let request = engine.release(rid).await.unwrap();
    assert_eq!(request.state, RequestState::Released);
    assert!(!request.is_active());
    assert_eq!(request.duration_minutes, 45);
    assert_eq!(request.allocated_slot, Some(slot("A-1-1")));
    assert!(engine.get_slot(&slot("A-1-1")).await.unwrap().is_available());
    assert_eq!(engine.get_vehicle(&vehicle("V1")).await.unwrap().active_request, None);

    let kinds: Vec<LedgerKind> = engine.list_ledger(None).await.iter().map(|e| e.kind()).collect();
    assert_eq!(
        kinds,
        [LedgerKind::StateChange, LedgerKind::StateChange, LedgerKind::Allocation]
    );
    assert!(engine.audit().await.is_empty());
}

#[tokio::test]
async fn allocation_falls_back_to_other_zone() {
    let path = test_wal_path("cross_zone.wal");
    let (engine, _clock) = open(&path, layout_config(&["A", "B"], 1, 1));

    let filler = open_request(&engine, "FILL", "A").await;
    engine.allocate(filler).await.unwrap();

    let rid = open_request(&engine, "V1", "A").await;
    let request = engine.allocate(rid).await.unwrap();
    assert_eq!(request.state, RequestState::Allocated);
    assert_eq!(request.allocated_slot, Some(slot("B-1-1")));
    assert!(request.cross_zone);
    assert_eq!(request.requested_zone, zone("A"));
    assert!(engine.audit().await.is_empty());
}

#[tokio::test]
async fn requested_zone_with_capacity_never_cross_zone() {
    let path = test_wal_path("same_zone.wal");
    let (engine, _clock) = open(&path, layout_config(&["A", "B", "C"], 2, 2));

    for i in 0..4 {
        let rid = open_request(&engine, &format!("B{i}"), "B").await;
        let request = engine.allocate(rid).await.unwrap();
        assert!(!request.cross_zone);
        assert_eq!(request.allocated_slot.unwrap().zone, zone("B"));
    }
}

#[tokio::test]
async fn fallback_follows_configured_zone_order() {
    let path = test_wal_path("fallback_order.wal");
    let (engine, _clock) = open(&path, layout_config(&["C", "A", "B"], 1, 1));

    let c = open_request(&engine, "FILL", "C").await;
    engine.allocate(c).await.unwrap();

    // Requested B is free, so first use B itself.
    let b = open_request(&engine, "V1", "B").await;
    assert_eq!(engine.allocate(b).await.unwrap().allocated_slot, Some(slot("B-1-1")));

    // C and B full: fallback is C, A, B order minus C, so A.
    let rid = open_request(&engine, "V2", "C").await;
    let request = engine.allocate(rid).await.unwrap();
    assert_eq!(request.allocated_slot, Some(slot("A-1-1")));
    assert!(request.cross_zone);
}

#[tokio::test]
async fn no_capacity_leaves_request_untouched() {
    let path = test_wal_path("no_capacity.wal");
    let (engine, _clock) = open(&path, layout_config(&["A", "B"], 1, 1));

    for id in ["F1", "F2"] {
        let rid = open_request(&engine, id, "A").await;
        engine.allocate(rid).await.unwrap();
    }
    let rid = open_request(&engine, "V1", "A").await;
    let before = snapshot(&engine).await;

    let err = engine.allocate(rid).await.unwrap_err();
    assert_eq!(err, EngineError::NoCapacity { zone: zone("A") });
    assert_eq!(snapshot(&engine).await, before);
    assert_eq!(engine.get_request(rid).await.unwrap().state, RequestState::Requested);
}

#[tokio::test]
async fn cancel_requested_then_undo() {
    let path = test_wal_path("cancel_requested.wal");
    let (engine, _clock) = open(&path, layout_config(&["A"], 1, 2));

    let rid = open_request(&engine, "V1", "A").await;
    let slots_before = engine.list_slots(None).await;

    let request = engine.cancel(rid).await.unwrap();
    assert_eq!(request.state, RequestState::Cancelled);
    assert!(!request.is_active());
    assert_eq!(request.allocated_slot, None);
    assert_eq!(engine.list_slots(None).await, slots_before);
    assert_eq!(engine.get_vehicle(&vehicle("V1")).await.unwrap().active_request, None);

    let result = engine.undo_last(1).await.unwrap();
    assert_eq!(result.undone.len(), 1);
    assert_eq!(result.undone[0].kind, LedgerKind::Cancellation);
    assert_eq!(result.remaining, 0);

    let request = engine.get_request(rid).await.unwrap();
    assert_eq!(request.state, RequestState::Requested);
    assert!(request.is_active());
    assert_eq!(request.cancelled_at, None);
    assert_eq!(engine.get_vehicle(&vehicle("V1")).await.unwrap().active_request, Some(rid));
    assert!(engine.audit().await.is_empty());
}

#[tokio::test]
async fn cancel_allocated_frees_slot() {
    let path = test_wal_path("cancel_allocated.wal");
    let (engine, _clock) = open(&path, layout_config(&["A", "B"], 1, 1));

    let filler = open_request(&engine, "FILL", "A").await;
    engine.allocate(filler).await.unwrap();
    let rid = open_request(&engine, "V1", "A").await;
    engine.allocate(rid).await.unwrap();

    let request = engine.cancel(rid).await.unwrap();
    assert_eq!(request.state, RequestState::Cancelled);
    assert_eq!(request.allocated_slot, None);
    assert!(!request.cross_zone);
    assert!(engine.get_slot(&slot("B-1-1")).await.unwrap().is_available());

    // Undo restores the slot and the cross-zone flag.
    engine.undo_last(1).await.unwrap();
    let request = engine.get_request(rid).await.unwrap();
    assert_eq!(request.state, RequestState::Allocated);
    assert_eq!(request.allocated_slot, Some(slot("B-1-1")));
    assert!(request.cross_zone);
    assert_eq!(
        engine.get_slot(&slot("B-1-1")).await.unwrap().occupant,
        Some(vehicle("V1"))
    );
    assert!(engine.audit().await.is_empty());
}

// ── Rejected transitions ─────────────────────────────────

#[tokio::test]
async fn invalid_transitions_rejected() {
    let path = test_wal_path("invalid_transitions.wal");
    let (engine, _clock) = open(&path, layout_config(&["A"], 1, 2));
    let rid = open_request(&engine, "V1", "A").await;

    let err = engine.occupy(rid).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::InvalidTransition { actual: RequestState::Requested, .. }
    ));
    assert!(matches!(
        engine.release(rid).await.unwrap_err(),
        EngineError::InvalidTransition { .. }
    ));

    engine.allocate(rid).await.unwrap();
    assert!(matches!(
        engine.allocate(rid).await.unwrap_err(),
        EngineError::InvalidTransition { actual: RequestState::Allocated, .. }
    ));

    engine.occupy(rid).await.unwrap();
    assert!(matches!(
        engine.cancel(rid).await.unwrap_err(),
        EngineError::InvalidTransition { actual: RequestState::Occupied, .. }
    ));

    engine.release(rid).await.unwrap();
    for result in [
        engine.allocate(rid).await,
        engine.occupy(rid).await,
        engine.release(rid).await,
        engine.cancel(rid).await,
    ] {
        assert!(matches!(
            result.unwrap_err(),
            EngineError::InvalidTransition { actual: RequestState::Released, .. }
        ));
    }
    assert_eq!(engine.list_ledger(None).await.len(), 3);
}

#[tokio::test]
async fn unknown_entities() {
    let path = test_wal_path("unknown_entities.wal");
    let (engine, _clock) = open(&path, layout_config(&["A"], 1, 1));

    let missing = Ulid::new();
    assert_eq!(
        engine.allocate(missing).await.unwrap_err(),
        EngineError::NotFound(EntityRef::Request(missing))
    );
    assert_eq!(
        engine.create_request(&vehicle("GHOST"), &zone("A")).await.unwrap_err(),
        EngineError::NotFound(EntityRef::Vehicle(vehicle("GHOST")))
    );
    assert!(matches!(
        engine.get_slot(&slot("A-9-9")).await.unwrap_err(),
        EngineError::NotFound(EntityRef::Slot(_))
    ));

    engine.register_vehicle(&vehicle("V1"), &zone("A")).await.unwrap();
    assert!(matches!(
        engine.create_request(&vehicle("V1"), &zone("Z")).await.unwrap_err(),
        EngineError::InvalidArgument(_)
    ));
}

#[tokio::test]
async fn one_active_request_per_vehicle() {
    let path = test_wal_path("duplicate_active.wal");
    let (engine, _clock) = open(&path, layout_config(&["A"], 1, 2));

    let first = open_request(&engine, "V1", "A").await;
    let err = engine.create_request(&vehicle("V1"), &zone("A")).await.unwrap_err();
    assert_eq!(
        err,
        EngineError::DuplicateActive {
            vehicle_id: vehicle("V1"),
            request_id: first,
        }
    );

    engine.allocate(first).await.unwrap();
    engine.occupy(first).await.unwrap();
    engine.release(first).await.unwrap();

    let second = engine.create_request(&vehicle("V1"), &zone("A")).await.unwrap();
    assert_ne!(second.id, first);
    assert_eq!(
        engine.get_vehicle(&vehicle("V1")).await.unwrap().active_request,
        Some(second.id)
    );
}

#[tokio::test]
async fn vehicle_registration() {
    let path = test_wal_path("vehicle_registration.wal");
    let (engine, clock) = open(&path, layout_config(&["A", "B"], 1, 1));

    let registered = engine.register_vehicle(&vehicle(" ka01ab "), &zone("B")).await.unwrap();
    assert_eq!(registered.id.as_str(), "KA01AB");
    assert_eq!(registered.preferred_zone, zone("B"));
    assert_eq!(registered.registered_at, T0);

    assert_eq!(
        engine.register_vehicle(&vehicle("KA01AB"), &zone("A")).await.unwrap_err(),
        EngineError::AlreadyExists(vehicle("KA01AB"))
    );
    assert!(matches!(
        engine.register_vehicle(&vehicle("   "), &zone("A")).await.unwrap_err(),
        EngineError::InvalidArgument(_)
    ));
    assert!(matches!(
        engine
            .register_vehicle(&vehicle(&"X".repeat(MAX_VEHICLE_ID_LEN + 1)), &zone("A"))
            .await
            .unwrap_err(),
        EngineError::LimitExceeded(_)
    ));

    clock.advance(M);
    engine.register_vehicle(&vehicle("KA02"), &zone("A")).await.unwrap();
    let ids: Vec<String> = engine
        .list_vehicles()
        .await
        .into_iter()
        .map(|v| v.id.to_string())
        .collect();
    assert_eq!(ids, ["KA02", "KA01AB"]);
    // Registration is not undoable history.
    assert!(engine.list_ledger(None).await.is_empty());
}

// ── Batch undo ───────────────────────────────────────────

#[tokio::test]
async fn undo_allocate_and_occupy() {
    let path = test_wal_path("undo_two.wal");
    let (engine, _clock) = open(&path, layout_config(&["A"], 1, 1));

    let rid = open_request(&engine, "V1", "A").await;
    engine.allocate(rid).await.unwrap();
    engine.occupy(rid).await.unwrap();

    let result = engine.undo_last(2).await.unwrap();
    let undone: Vec<(u64, LedgerKind)> = result.undone.iter().map(|u| (u.seq, u.kind)).collect();
    assert_eq!(undone, [(2, LedgerKind::StateChange), (1, LedgerKind::Allocation)]);
    assert!(result.undone.iter().all(|u| u.request_id == rid));
    assert_eq!(result.remaining, 0);

    let request = engine.get_request(rid).await.unwrap();
    assert_eq!(request.state, RequestState::Requested);
    assert_eq!(request.allocated_slot, None);
    assert_eq!(request.allocated_at, None);
    assert_eq!(request.occupied_at, None);
    assert!(engine.get_slot(&slot("A-1-1")).await.unwrap().is_available());
    assert_eq!(engine.get_vehicle(&vehicle("V1")).await.unwrap().active_request, Some(rid));
    assert!(engine.list_ledger(None).await.is_empty());
    assert!(engine.audit().await.is_empty());
}

#[tokio::test]
async fn undo_release_reoccupies_slot() {
    let path = test_wal_path("undo_release.wal");
    let (engine, clock) = open(&path, layout_config(&["A"], 1, 1));

    let rid = open_request(&engine, "V1", "A").await;
    engine.allocate(rid).await.unwrap();
    engine.occupy(rid).await.unwrap();
    clock.advance(90 * M);
    engine.release(rid).await.unwrap();

    engine.undo_last(1).await.unwrap();
    let request = engine.get_request(rid).await.unwrap();
    assert_eq!(request.state, RequestState::Occupied);
    assert_eq!(request.duration_minutes, 0);
    assert_eq!(request.released_at, None);
    assert_eq!(
        engine.get_slot(&slot("A-1-1")).await.unwrap().occupant,
        Some(vehicle("V1"))
    );
    assert_eq!(engine.get_vehicle(&vehicle("V1")).await.unwrap().active_request, Some(rid));

    // The derived duration is recomputed on the next release.
    clock.advance(30 * M);
    assert_eq!(engine.release(rid).await.unwrap().duration_minutes, 120);
}

#[tokio::test]
async fn undo_spans_requests_most_recent_first() {
    let path = test_wal_path("undo_lifo.wal");
    let (engine, _clock) = open(&path, layout_config(&["A"], 1, 3));

    let r1 = open_request(&engine, "V1", "A").await;
    let r2 = open_request(&engine, "V2", "A").await;
    engine.allocate(r1).await.unwrap();
    engine.allocate(r2).await.unwrap();
    engine.occupy(r1).await.unwrap();

    let result = engine.undo_last(2).await.unwrap();
    let undone: Vec<(u64, RequestId)> = result.undone.iter().map(|u| (u.seq, u.request_id)).collect();
    assert_eq!(undone, [(3, r1), (2, r2)]);
    assert_eq!(result.remaining, 1);

    assert_eq!(engine.get_request(r1).await.unwrap().state, RequestState::Allocated);
    assert_eq!(engine.get_request(r2).await.unwrap().state, RequestState::Requested);

    // Sequence numbers stay contiguous after the tail is removed.
    engine.allocate(r2).await.unwrap();
    let seqs: Vec<u64> = engine.list_ledger(None).await.iter().map(|e| e.seq).collect();
    assert_eq!(seqs, [2, 1]);
}

#[tokio::test]
async fn undo_count_bounds() {
    let path = test_wal_path("undo_bounds.wal");
    let mut config = layout_config(&["A"], 1, 1);
    config.max_undo = 3;
    let (engine, _clock) = open(&path, config);

    let rid = open_request(&engine, "V1", "A").await;
    engine.allocate(rid).await.unwrap();

    assert!(matches!(
        engine.undo_last(0).await.unwrap_err(),
        EngineError::InvalidArgument(_)
    ));
    assert!(matches!(
        engine.undo_last(4).await.unwrap_err(),
        EngineError::InvalidArgument(_)
    ));
    assert_eq!(engine.list_ledger(None).await.len(), 1);
}

#[tokio::test]
async fn undo_insufficient_history_mutates_nothing() {
    let path = test_wal_path("undo_insufficient.wal");
    let (engine, _clock) = open(&path, layout_config(&["A"], 1, 1));

    let rid = open_request(&engine, "V1", "A").await;
    engine.allocate(rid).await.unwrap();
    engine.occupy(rid).await.unwrap();
    let before = snapshot(&engine).await;

    let err = engine.undo_last(3).await.unwrap_err();
    assert_eq!(
        err,
        EngineError::InsufficientHistory {
            requested: 3,
            available: 2,
        }
    );
    assert_eq!(snapshot(&engine).await, before);
}

#[tokio::test]
async fn undo_conflict_is_all_or_nothing() {
    let path = test_wal_path("undo_conflict.wal");
    let (engine, _clock) = open(&path, layout_config(&["A"], 1, 2));

    // seq 1..=3: V1 parks and leaves.
    let r1 = open_request(&engine, "V1", "A").await;
    engine.allocate(r1).await.unwrap();
    engine.occupy(r1).await.unwrap();
    engine.release(r1).await.unwrap();

    // V1 opens a new request; request creation is not ledgered.
    let r2 = engine.create_request(&vehicle("V1"), &zone("A")).await.unwrap().id;

    // seq 4: another vehicle takes a slot.
    let r3 = open_request(&engine, "V2", "A").await;
    engine.allocate(r3).await.unwrap();
    let before = snapshot(&engine).await;

    // seq 4 inverts cleanly, seq 3 would give V1 two active requests.
    let err = engine.undo_last(2).await.unwrap_err();
    assert!(matches!(err, EngineError::InversionConflict { seq: 3, .. }));
    assert_eq!(snapshot(&engine).await, before);
    assert_eq!(engine.get_request(r3).await.unwrap().state, RequestState::Allocated);
    assert_eq!(engine.get_vehicle(&vehicle("V1")).await.unwrap().active_request, Some(r2));

    // The conflict-free prefix can still be undone on its own.
    engine.undo_last(1).await.unwrap();
    assert_eq!(engine.get_request(r3).await.unwrap().state, RequestState::Requested);
    assert!(engine.audit().await.is_empty());
}

#[tokio::test]
async fn undo_then_redo_round_trips() {
    let path = test_wal_path("round_trip.wal");
    let (engine, clock) = open(&path, layout_config(&["A", "B"], 1, 1));

    let filler = open_request(&engine, "FILL", "A").await;
    engine.allocate(filler).await.unwrap();
    let rid = open_request(&engine, "V1", "A").await;

    clock.set(T0 + M);
    engine.allocate(rid).await.unwrap();
    clock.set(T0 + 2 * M);
    engine.occupy(rid).await.unwrap();
    let before = snapshot(&engine).await;

    engine.undo_last(2).await.unwrap();
    assert_ne!(snapshot(&engine).await, before);

    clock.set(T0 + M);
    engine.allocate(rid).await.unwrap();
    clock.set(T0 + 2 * M);
    engine.occupy(rid).await.unwrap();
    assert_eq!(snapshot(&engine).await, before);
}

#[tokio::test]
async fn round_trip_across_release() {
    let path = test_wal_path("round_trip_release.wal");
    let (engine, clock) = open(&path, layout_config(&["A"], 1, 1));
    let rid = open_request(&engine, "V1", "A").await;

    clock.set(T0 + M);
    engine.allocate(rid).await.unwrap();
    clock.set(T0 + 2 * M);
    engine.occupy(rid).await.unwrap();
    clock.set(T0 + 47 * M);
    engine.release(rid).await.unwrap();
    let before = snapshot(&engine).await;

    engine.undo_last(3).await.unwrap();
    let undone = engine.get_request(rid).await.unwrap();
    assert_eq!(undone.state, RequestState::Requested);
    assert_eq!(undone.duration_minutes, 0);
    assert!(engine.get_slot(&slot("A-1-1")).await.unwrap().is_available());

    clock.set(T0 + M);
    engine.allocate(rid).await.unwrap();
    clock.set(T0 + 2 * M);
    engine.occupy(rid).await.unwrap();
    clock.set(T0 + 47 * M);
    engine.release(rid).await.unwrap();
    assert_eq!(snapshot(&engine).await, before);
}

#[tokio::test]
async fn round_trip_across_cancel() {
    let path = test_wal_path("round_trip_cancel.wal");
    let (engine, clock) = open(&path, layout_config(&["A", "B"], 1, 1));
    let filler = open_request(&engine, "FILL", "A").await;
    engine.allocate(filler).await.unwrap();
    let rid = open_request(&engine, "V1", "A").await;

    clock.set(T0 + M);
    engine.allocate(rid).await.unwrap();
    clock.set(T0 + 3 * M);
    engine.cancel(rid).await.unwrap();
    let before = snapshot(&engine).await;

    engine.undo_last(2).await.unwrap();
    assert_eq!(engine.get_request(rid).await.unwrap().state, RequestState::Requested);
    assert_eq!(
        engine.get_vehicle(&vehicle("V1")).await.unwrap().active_request,
        Some(rid)
    );

    clock.set(T0 + M);
    engine.allocate(rid).await.unwrap();
    clock.set(T0 + 3 * M);
    engine.cancel(rid).await.unwrap();
    assert_eq!(snapshot(&engine).await, before);
}

#[tokio::test]
async fn undo_hands_slot_back_to_earlier_request() {
    let path = test_wal_path("undo_hand_back.wal");
    let config = layout_config(&["A"], 1, 1);
    let (r1, r2, after_undo) = {
        let (engine, _clock) = open(&path, config.clone());
        let r1 = open_request(&engine, "V1", "A").await;
        engine.allocate(r1).await.unwrap();
        engine.cancel(r1).await.unwrap();
        let r2 = open_request(&engine, "V2", "A").await;
        assert_eq!(
            engine.allocate(r2).await.unwrap().allocated_slot,
            Some(slot("A-1-1"))
        );

        let result = engine.undo_last(2).await.unwrap();
        assert_eq!(result.undone.len(), 2);
        assert_eq!(result.remaining, 1);
        (r1, r2, snapshot(&engine).await)
    };

    let (engine, _clock) = open(&path, config);
    assert_eq!(snapshot(&engine).await, after_undo);

    let first = engine.get_request(r1).await.unwrap();
    assert_eq!(first.state, RequestState::Allocated);
    assert_eq!(first.allocated_slot, Some(slot("A-1-1")));
    assert_eq!(
        engine.get_slot(&slot("A-1-1")).await.unwrap().occupant,
        Some(vehicle("V1"))
    );
    assert_eq!(engine.get_vehicle(&vehicle("V1")).await.unwrap().active_request, Some(r1));

    let second = engine.get_request(r2).await.unwrap();
    assert_eq!(second.state, RequestState::Requested);
    assert_eq!(second.allocated_slot, None);
    assert_eq!(engine.get_vehicle(&vehicle("V2")).await.unwrap().active_request, Some(r2));

    assert_eq!(engine.list_ledger(None).await.len(), 1);
    assert!(engine.audit().await.is_empty());
}

#[tokio::test]
async fn undo_hand_back_alongside_freed_slot() {
    let path = test_wal_path("undo_hand_back_three.wal");
    let (engine, _clock) = open(&path, layout_config(&["A"], 1, 2));
    let r1 = open_request(&engine, "V1", "A").await;
    engine.allocate(r1).await.unwrap();
    engine.cancel(r1).await.unwrap();
    let r2 = open_request(&engine, "V2", "A").await;
    engine.allocate(r2).await.unwrap();
    let r3 = open_request(&engine, "V3", "A").await;
    assert_eq!(
        engine.allocate(r3).await.unwrap().allocated_slot,
        Some(slot("A-1-2"))
    );

    engine.undo_last(3).await.unwrap();
    assert_eq!(engine.get_request(r1).await.unwrap().state, RequestState::Allocated);
    assert_eq!(engine.get_request(r2).await.unwrap().state, RequestState::Requested);
    assert_eq!(engine.get_request(r3).await.unwrap().state, RequestState::Requested);
    assert_eq!(
        engine.get_slot(&slot("A-1-1")).await.unwrap().occupant,
        Some(vehicle("V1"))
    );
    assert!(engine.get_slot(&slot("A-1-2")).await.unwrap().is_available());
    assert!(engine.audit().await.is_empty());
}

#[tokio::test]
async fn round_trip_across_slot_hand_off() {
    let path = test_wal_path("round_trip_hand_off.wal");
    let (engine, clock) = open(&path, layout_config(&["A"], 1, 1));
    let r1 = open_request(&engine, "V1", "A").await;
    let r2 = open_request(&engine, "V2", "A").await;

    clock.set(T0 + M);
    engine.allocate(r1).await.unwrap();
    clock.set(T0 + 2 * M);
    engine.cancel(r1).await.unwrap();
    clock.set(T0 + 3 * M);
    engine.allocate(r2).await.unwrap();
    let before = snapshot(&engine).await;

    engine.undo_last(2).await.unwrap();
    assert_ne!(snapshot(&engine).await, before);

    clock.set(T0 + 2 * M);
    engine.cancel(r1).await.unwrap();
    clock.set(T0 + 3 * M);
    engine.allocate(r2).await.unwrap();
    assert_eq!(snapshot(&engine).await, before);
}

// ── Persistence ──────────────────────────────────────────

#[tokio::test]
async fn wal_replay_restores_state() {
    let path = test_wal_path("replay.wal");
    let config = layout_config(&["A", "B"], 1, 2);
    let before = {
        let (engine, clock) = open(&path, config.clone());
        let r1 = open_request(&engine, "V1", "A").await;
        let r2 = open_request(&engine, "V2", "B").await;
        engine.allocate(r1).await.unwrap();
        engine.occupy(r1).await.unwrap();
        clock.advance(10 * M);
        engine.release(r1).await.unwrap();
        engine.allocate(r2).await.unwrap();
        engine.cancel(r2).await.unwrap();
        engine.undo_last(2).await.unwrap();
        snapshot(&engine).await
    };

    let (engine, _clock) = open(&path, config);
    assert_eq!(snapshot(&engine).await, before);
    assert!(engine.audit().await.is_empty());
}

#[tokio::test]
async fn compact_wal_survives_restart() {
    let path = test_wal_path("compact_restart.wal");
    let config = layout_config(&["A"], 2, 2);
    let before = {
        let (engine, _clock) = open(&path, config.clone());
        let rid = open_request(&engine, "V1", "A").await;
        engine.allocate(rid).await.unwrap();
        assert!(engine.wal_appends_since_compact().await > 0);

        engine.compact_wal().await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 0);

        engine.occupy(rid).await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 1);
        snapshot(&engine).await
    };

    let replay = crate::wal::Wal::replay(&path).unwrap();
    assert_eq!(replay.events.len(), 2);
    assert!(matches!(replay.events[0], Event::Snapshot(_)));

    let (engine, _clock) = open(&path, config);
    assert_eq!(snapshot(&engine).await, before);

    // History before the snapshot is still undoable.
    engine.undo_last(2).await.unwrap();
    assert!(engine.get_slot(&slot("A-1-1")).await.unwrap().is_available());
}

#[tokio::test]
async fn writes_after_torn_tail_survive_restart() {
    let path = test_wal_path("torn_tail_restart.wal");
    let config = layout_config(&["A"], 1, 1);
    {
        let (engine, _clock) = open(&path, config.clone());
        engine.register_vehicle(&vehicle("V1"), &zone("A")).await.unwrap();
    }
    {
        use std::io::Write;
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&[50, 0, 0, 0, 1, 2]).unwrap();
    }
    {
        let (engine, _clock) = open(&path, config.clone());
        engine.register_vehicle(&vehicle("V2"), &zone("A")).await.unwrap();
        assert_eq!(engine.list_vehicles().await.len(), 2);
    }

    let (engine, _clock) = open(&path, config);
    assert_eq!(engine.list_vehicles().await.len(), 2);
    assert_eq!(crate::wal::Wal::replay(&path).unwrap().discarded_bytes, 0);
}

#[tokio::test]
async fn unappliable_logged_event_halts_engine() {
    let path = test_wal_path("halted.wal");
    let config = layout_config(&["A"], 1, 1);
    let (engine, _clock) = open(&path, config.clone());
    let rid = open_request(&engine, "V1", "A").await;
    engine.allocate(rid).await.unwrap();
    let before = snapshot(&engine).await;
    assert!(!engine.is_halted());

    let stray = Event::RequestOccupied {
        request_id: Ulid::new(),
        at: T0,
    };
    {
        let mut guard = engine.state.write().await;
        let err = engine.persist_and_apply(&mut *guard, &stray).await.unwrap_err();
        assert!(matches!(err, EngineError::Halted(_)));
    }
    assert!(engine.is_halted());

    assert!(matches!(engine.occupy(rid).await, Err(EngineError::Halted(_))));
    assert!(matches!(
        engine.register_vehicle(&vehicle("V2"), &zone("A")).await,
        Err(EngineError::Halted(_))
    ));
    assert!(matches!(engine.undo_last(1).await, Err(EngineError::Halted(_))));
    assert!(matches!(engine.compact_wal().await, Err(EngineError::Halted(_))));

    // Reads keep working against the last consistent state.
    assert_eq!(snapshot(&engine).await, before);
    assert_eq!(engine.get_request(rid).await.unwrap().state, RequestState::Allocated);

    // The log now holds a record that cannot be applied; refuse to start on it.
    let reopened = Engine::with_clock(
        path,
        config,
        Arc::new(NotifyHub::new()),
        Arc::new(ManualClock::new(T0)),
    );
    assert_eq!(reopened.err().unwrap().kind(), std::io::ErrorKind::InvalidData);
}

#[tokio::test]
async fn recorded_pool_wins_over_configuration() {
    let path = test_wal_path("recorded_pool.wal");
    {
        let (engine, _clock) = open(&path, layout_config(&["A"], 1, 2));
        assert_eq!(engine.health().await.slots_total, 2);
    }
    let (engine, _clock) = open(&path, layout_config(&["A", "B"], 3, 3));
    assert_eq!(engine.health().await.slots_total, 2);
    assert_eq!(engine.zone_availability().await, [(zone("A"), 2)]);
}

#[tokio::test]
async fn group_commit_batches_appends() {
    let path = test_wal_path("group_commit_batch.wal");
    let config = layout_config(&["A"], 1, 1);
    let engine = {
        let (engine, _clock) = open(&path, config.clone());
        Arc::new(engine)
    };

    let n = 20;
    let mut handles = Vec::new();
    for i in 0..n {
        let eng = engine.clone();
        handles.push(tokio::spawn(async move {
            eng.register_vehicle(&vehicle(&format!("V{i}")), &zone("A")).await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }
    assert_eq!(engine.list_vehicles().await.len(), n);

    let (engine2, _clock) = open(&path, config);
    assert_eq!(engine2.list_vehicles().await.len(), n);
}

// ── Concurrency ──────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_allocation_never_double_books() {
    let path = test_wal_path("concurrent_allocate.wal");
    let (engine, _clock) = open(&path, layout_config(&["A", "B"], 1, 5));
    let engine = Arc::new(engine);

    let mut handles = Vec::new();
    for i in 0..25 {
        let eng = engine.clone();
        handles.push(tokio::spawn(async move {
            let v = vehicle(&format!("V{i}"));
            let z = zone(if i % 2 == 0 { "A" } else { "B" });
            eng.register_vehicle(&v, &z).await?;
            let request = eng.create_request(&v, &z).await?;
            eng.allocate(request.id).await
        }));
    }

    let mut slots = std::collections::BTreeSet::new();
    let mut full = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(request) => assert!(slots.insert(request.allocated_slot.unwrap())),
            Err(EngineError::NoCapacity { .. }) => full += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(slots.len(), 10);
    assert_eq!(full, 15);
    assert_eq!(engine.health().await.slots_available, 0);
    assert!(engine.audit().await.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_undo_and_mutations_stay_consistent() {
    let path = test_wal_path("concurrent_undo.wal");
    let (engine, _clock) = open(&path, layout_config(&["A"], 2, 5));
    let engine = Arc::new(engine);

    let mut handles = Vec::new();
    for i in 0..8 {
        let eng = engine.clone();
        handles.push(tokio::spawn(async move {
            let rid = open_request(&eng, &format!("V{i}"), "A").await;
            for _ in 0..5 {
                let _ = eng.allocate(rid).await;
                let _ = eng.occupy(rid).await;
                let _ = eng.undo_last(1).await;
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }
    assert!(engine.audit().await.is_empty());
}

// ── Queries & feed ───────────────────────────────────────

#[tokio::test]
async fn listings_are_bounded_and_ordered() {
    let path = test_wal_path("listings.wal");
    let (engine, clock) = open(&path, layout_config(&["A"], 4, 5));

    let mut ids = Vec::new();
    for i in 0..12 {
        clock.advance(1_000);
        ids.push(open_request(&engine, &format!("V{i:02}"), "A").await);
    }
    for rid in &ids[..6] {
        engine.allocate(*rid).await.unwrap();
    }
    engine.cancel(ids[0]).await.unwrap();

    let newest: Vec<RequestId> = engine
        .list_requests(ActivityFilter::All, Some(3))
        .await
        .iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(newest, [ids[11], ids[10], ids[9]]);
    assert_eq!(engine.list_requests(ActivityFilter::Active, None).await.len(), 11);
    let inactive = engine.list_requests(ActivityFilter::Inactive, None).await;
    assert_eq!(inactive.len(), 1);
    assert_eq!(inactive[0].id, ids[0]);
    assert_eq!(
        engine.list_requests(ActivityFilter::All, Some(MAX_REQUEST_PAGE + 10)).await.len(),
        12
    );

    let ledger = engine.list_ledger(None).await;
    assert_eq!(ledger.len(), 7);
    assert_eq!(ledger[0].kind(), LedgerKind::Cancellation);
    assert_eq!(engine.list_ledger(Some(2)).await.len(), 2);

    assert_eq!(engine.list_slots(Some(&zone("A"))).await.len(), 20);
    assert!(engine.list_slots(Some(&zone("Q"))).await.is_empty());

    let health = engine.health().await;
    assert_eq!(health.slots_total, 20);
    assert_eq!(health.slots_occupied, 5);
    assert_eq!(health.slots_available, 15);
    assert_eq!(health.vehicles, 12);
    assert_eq!(health.requests, 12);
    assert_eq!(health.ledger_entries, 7);
}

#[tokio::test]
async fn default_ledger_page() {
    let path = test_wal_path("ledger_page.wal");
    let (engine, _clock) = open(&path, layout_config(&["A"], 3, 5));
    for i in 0..12 {
        let rid = open_request(&engine, &format!("V{i}"), "A").await;
        engine.allocate(rid).await.unwrap();
    }
    let ledger = engine.list_ledger(None).await;
    assert_eq!(ledger.len(), DEFAULT_LEDGER_PAGE);
    assert_eq!(ledger[0].seq, 12);
}

#[tokio::test]
async fn zone_feed_sees_cross_zone_allocation() {
    let path = test_wal_path("zone_feed.wal");
    let (engine, _clock) = open(&path, layout_config(&["A", "B"], 1, 1));

    let filler = open_request(&engine, "FILL", "A").await;
    engine.allocate(filler).await.unwrap();
    let rid = open_request(&engine, "V1", "A").await;

    let mut feed_a = engine.notify.subscribe(&zone("A"));
    let mut feed_b = engine.notify.subscribe(&zone("B"));
    engine.allocate(rid).await.unwrap();

    for feed in [&mut feed_a, &mut feed_b] {
        match feed.recv().await.unwrap() {
            Event::RequestAllocated {
                request_id,
                slot_id,
                cross_zone,
                ..
            } => {
                assert_eq!(request_id, rid);
                assert_eq!(slot_id, slot("B-1-1"));
                assert!(cross_zone);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    engine.undo_last(1).await.unwrap();
    assert!(matches!(
        feed_b.recv().await.unwrap(),
        Event::UndoCommitted { count: 1, .. }
    ));
}

#[tokio::test]
async fn failed_operations_notify_nobody() {
    let path = test_wal_path("failed_notify.wal");
    let (engine, _clock) = open(&path, layout_config(&["A"], 1, 1));
    let rid = open_request(&engine, "V1", "A").await;

    let mut feed = engine.notify.subscribe(&zone("A"));
    assert!(engine.occupy(rid).await.is_err());
    assert!(engine.undo_last(5).await.is_err());
    assert!(feed.try_recv().is_err());
}
