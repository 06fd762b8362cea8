use std::path::PathBuf;
use std::sync::Arc;

use proptest::prelude::*;

use super::*;
use crate::limits::*;

const H: Ms = 3_600_000; // 1 hour in ms
const DAY: Ms = 24 * H;
const JAN_15_2025: Ms = 1_736_899_200_000;

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("innkeep_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn at(hours: Ms) -> Ms {
    JAN_15_2025 + hours * H
}

fn nights(from_day: Ms, count: Ms) -> Span {
    Span::new(JAN_15_2025 + from_day * DAY, JAN_15_2025 + (from_day + count) * DAY)
}

fn draft(name: &str, span: Span) -> ReservationDraft {
    ReservationDraft::new(Guest::new(name, "+880 1711-000000"), span, 1)
}

async fn seed(engine: &Engine) {
    engine.register_resource(Resource::room("101", 2, "Ground")).await.unwrap();
    engine.register_resource(Resource::room("201", 3, "First")).await.unwrap();
    engine.register_resource(Resource::room("202", 1, "First")).await.unwrap();
    engine.register_resource(Resource::hall("Hall A", 100, "Annex")).await.unwrap();
}

async fn seeded() -> Engine {
    let engine = Engine::in_memory();
    seed(&engine).await;
    engine
}

async fn book(engine: &Engine, resource: &str, span: Span) -> Result<Reservation, EngineError> {
    engine.create_reservation(draft("Mr. Karim Ali", span).on(resource)).await
}

/// Every resource's allocation list is exactly its holding reservations.
async fn assert_index_consistent(engine: &Engine) {
    let states: Vec<_> = engine.resources.iter().map(|e| (e.key().clone(), e.value().clone())).collect();
    for (rid, rs) in states {
        let guard = rs.read().await;
        let mut indexed: Vec<Ulid> = guard.allocations.iter().map(|a| a.reservation_id).collect();
        indexed.sort();
        let mut holding: Vec<Ulid> = engine
            .reservations
            .iter()
            .filter(|r| r.holds() && r.resource_id.as_deref() == Some(rid.as_str()))
            .map(|r| r.id)
            .collect();
        holding.sort();
        assert_eq!(indexed, holding, "occupancy index of {rid} out of sync");
        for pair in guard.allocations.windows(2) {
            assert!(pair[0].span.start <= pair[1].span.start);
        }
    }
}

// ── Registry ─────────────────────────────────────────────

#[tokio::test]
async fn register_and_get_resource() {
    let engine = seeded().await;
    let hall = engine.get_resource("Hall A").await.unwrap();
    assert_eq!(hall.kind, ResourceKind::Hall);
    assert_eq!(hall.capacity, 100);
    assert!(!hall.retired);
    assert!(matches!(
        engine.get_resource("999").await,
        Err(EngineError::NotFound { entity: "resource", .. })
    ));
}

#[tokio::test]
async fn duplicate_resource_rejected() {
    let engine = seeded().await;
    let result = engine.register_resource(Resource::room("101", 4, "Ground")).await;
    assert!(matches!(result, Err(EngineError::DuplicateId(id)) if id == "101"));
    assert_eq!(engine.get_resource("101").await.unwrap().capacity, 2);
}

#[tokio::test]
async fn registration_validates() {
    let engine = Engine::in_memory();
    assert!(matches!(
        engine.register_resource(Resource::room("", 2, "Ground")).await,
        Err(EngineError::Validation(_))
    ));
    assert!(matches!(
        engine.register_resource(Resource::room("101", 0, "Ground")).await,
        Err(EngineError::Validation(_))
    ));
    assert!(engine.list_resources(None).await.is_empty());
}

#[tokio::test]
async fn registration_ignores_incoming_flags() {
    let engine = Engine::in_memory();
    let mut resource = Resource::room("101", 2, "Ground");
    resource.retired = true;
    resource.needs_cleaning = true;
    engine.register_resource(resource).await.unwrap();
    let stored = engine.get_resource("101").await.unwrap();
    assert!(!stored.retired);
    assert!(!stored.needs_cleaning);
}

#[tokio::test]
async fn list_resources_sorted_and_filtered() {
    let engine = seeded().await;
    let ids: Vec<String> = engine.list_resources(None).await.into_iter().map(|r| r.id).collect();
    assert_eq!(ids, vec!["101", "201", "202", "Hall A"]);

    let halls = engine.list_resources(Some(ResourceKind::Hall)).await;
    assert_eq!(halls.len(), 1);
    assert_eq!(halls[0].id, "Hall A");

    // Independent snapshots.
    assert_eq!(engine.list_resources(None).await, engine.list_resources(None).await);
}

#[tokio::test]
async fn retire_is_soft_and_idempotent() {
    let engine = seeded().await;
    let existing = book(&engine, "202", nights(0, 2)).await.unwrap();

    let retired = engine.retire_resource("202").await.unwrap();
    assert!(retired.retired);
    assert!(engine.retire_resource("202").await.unwrap().retired);

    // History and existing holds survive; new assignments are refused.
    assert_eq!(engine.get_reservation(existing.id).unwrap().status, Status::Confirmed);
    assert!(engine.has_conflict("202", nights(1, 1), None).await.unwrap());
    assert!(matches!(
        book(&engine, "202", nights(5, 1)).await,
        Err(EngineError::Validation(_))
    ));
    assert!(matches!(
        engine.retire_resource("303").await,
        Err(EngineError::NotFound { .. })
    ));
}

// ── Booking scenarios ────────────────────────────────────

#[tokio::test]
async fn room_201_overlap_and_back_to_back() {
    let engine = seeded().await;

    let r1 = book(&engine, "201", Span::new(at(10), at(3 * 24 + 10))).await.unwrap();
    assert_eq!(r1.status, Status::Confirmed);

    let r2 = book(&engine, "201", Span::new(at(24), at(48))).await;
    match r2 {
        Err(EngineError::Conflict { resource_id, held_by }) => {
            assert_eq!(resource_id, "201");
            assert_eq!(held_by, r1.id);
        }
        other => panic!("expected conflict, got {other:?}"),
    }

    let r3 = book(&engine, "201", Span::new(at(3 * 24 + 10), at(4 * 24 + 10))).await.unwrap();
    assert_eq!(r3.status, Status::Confirmed);

    let on_201 = engine.list_by_resource("201", None).unwrap();
    assert_eq!(on_201.iter().map(|r| r.id).collect::<Vec<_>>(), vec![r1.id, r3.id]);
    assert_index_consistent(&engine).await;
}

#[tokio::test]
async fn pending_without_resource_cannot_check_in() {
    let engine = seeded().await;
    let r = engine.create_reservation(draft("Ms. Fatima Khan", nights(0, 1))).await.unwrap();
    assert_eq!(r.status, Status::Pending);
    assert!(r.resource_id.is_none());

    let result = engine.check_in(r.id).await;
    assert!(matches!(
        result,
        Err(EngineError::InvalidTransition { from: Status::Pending, op: "check-in", .. })
    ));
    assert_eq!(engine.get_reservation(r.id).unwrap().status, Status::Pending);
}

#[tokio::test]
async fn full_stay_then_cancel_is_rejected() {
    let engine = seeded().await;
    let r = engine.create_reservation(draft("Dr. Nasreen Ahmed", nights(0, 2))).await.unwrap();

    let r = engine.assign_resource(r.id, "101").await.unwrap();
    assert_eq!(r.status, Status::Confirmed);
    assert_eq!(r.resource_id.as_deref(), Some("101"));

    let r = engine.check_in(r.id).await.unwrap();
    assert_eq!(r.status, Status::CheckedIn);
    assert!(r.checked_in_at.is_some());

    let r = engine.check_out(r.id).await.unwrap();
    assert_eq!(r.status, Status::CheckedOut);
    assert!(r.checked_out_at.is_some());
    assert!(engine.get_resource("101").await.unwrap().needs_cleaning);

    let result = engine.cancel(r.id).await;
    assert!(matches!(
        result,
        Err(EngineError::InvalidTransition { from: Status::CheckedOut, op: "cancel", .. })
    ));
    assert_eq!(engine.get_reservation(r.id).unwrap().status, Status::CheckedOut);

    let cleaned = engine.mark_clean("101").await.unwrap();
    assert!(!cleaned.needs_cleaning);
    assert_index_consistent(&engine).await;
}

#[tokio::test]
async fn back_to_back_bookings_allowed() {
    let engine = seeded().await;
    book(&engine, "202", Span::new(at(0), at(10))).await.unwrap();
    book(&engine, "202", Span::new(at(10), at(20))).await.unwrap();
    book(&engine, "202", Span::new(at(-5), at(0))).await.unwrap();
    assert!(matches!(
        book(&engine, "202", Span::new(at(9), at(11))).await,
        Err(EngineError::Conflict { .. })
    ));
}

#[tokio::test]
async fn invalid_interval_rejected_before_anything() {
    let engine = seeded().await;
    let result = book(&engine, "101", Span::new(at(10), at(10))).await;
    assert!(matches!(result, Err(EngineError::InvalidInterval { .. })));
    let result = book(&engine, "101", Span::new(at(10), at(5))).await;
    assert!(matches!(result, Err(EngineError::InvalidInterval { .. })));
    assert_eq!(engine.status_counts().total(), 0);
}

#[tokio::test]
async fn unknown_resource_on_create() {
    let engine = seeded().await;
    let result = book(&engine, "999", nights(0, 1)).await;
    assert!(matches!(result, Err(EngineError::NotFound { entity: "resource", .. })));
    assert_eq!(engine.status_counts().total(), 0);
}

#[tokio::test]
async fn party_larger_than_capacity() {
    let engine = seeded().await;
    let mut big = draft("Mr. Karim Ali", nights(0, 1)).on("101");
    big.party_size = 3;
    assert!(matches!(
        engine.create_reservation(big.clone()).await,
        Err(EngineError::Validation(_))
    ));
    big.resource_id = Some("201".into());
    assert_eq!(engine.create_reservation(big).await.unwrap().party_size, 3);
}

#[tokio::test]
async fn cancel_releases_interval() {
    let engine = seeded().await;
    let first = book(&engine, "202", nights(0, 3)).await.unwrap();
    assert!(book(&engine, "202", nights(1, 1)).await.is_err());

    let cancelled = engine.cancel(first.id).await.unwrap();
    assert_eq!(cancelled.status, Status::Cancelled);
    assert!(engine.get_reservation(first.id).is_ok());

    book(&engine, "202", nights(1, 1)).await.unwrap();
    assert_index_consistent(&engine).await;
}

#[tokio::test]
async fn early_checkout_frees_rest_of_stay() {
    let engine = seeded().await;
    let r = book(&engine, "202", nights(0, 5)).await.unwrap();
    engine.check_in(r.id).await.unwrap();
    assert!(book(&engine, "202", nights(3, 1)).await.is_err());

    engine.check_out(r.id).await.unwrap();
    book(&engine, "202", nights(3, 1)).await.unwrap();
}

#[tokio::test]
async fn unknown_reservation() {
    let engine = seeded().await;
    let ghost = Ulid::new();
    for result in [
        engine.check_in(ghost).await,
        engine.check_out(ghost).await,
        engine.cancel(ghost).await,
        engine.assign_resource(ghost, "101").await,
    ] {
        assert!(matches!(result, Err(EngineError::NotFound { entity: "reservation", .. })));
    }
    assert!(engine.get_reservation(ghost).is_err());
}

#[tokio::test]
async fn combined_room_and_hall_booking() {
    let engine = seeded().await;
    let group = Ulid::new();
    let mut room = draft("Prof. Rahim Uddin", nights(0, 2)).on("201");
    room.correlation_id = Some(group);
    let mut hall = draft("Prof. Rahim Uddin", Span::new(at(9), at(17))).on("Hall A");
    hall.correlation_id = Some(group);
    hall.party_size = 60;
    hall.purpose = Some("Annual research seminar".into());

    let room = engine.create_reservation(room).await.unwrap();
    let hall = engine.create_reservation(hall).await.unwrap();
    assert_eq!(room.correlation_id, hall.correlation_id);

    // Halves are checked independently: a hall clash leaves the room alone.
    let mut clash = draft("Mrs. Sultana Begum", Span::new(at(12), at(14))).on("Hall A");
    clash.correlation_id = Some(Ulid::new());
    assert!(engine.create_reservation(clash).await.is_err());
    assert_eq!(engine.get_reservation(room.id).unwrap().status, Status::Confirmed);
}

// ── Transition legality ──────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
enum Op {
    Assign,
    CheckIn,
    CheckOut,
    Cancel,
    Update,
}

const OPS: [Op; 5] = [Op::Assign, Op::CheckIn, Op::CheckOut, Op::Cancel, Op::Update];

fn legal(from: Status, op: Op) -> bool {
    matches!(
        (from, op),
        (Status::Pending, Op::Assign | Op::Cancel | Op::Update)
            | (Status::Confirmed, Op::CheckIn | Op::Cancel | Op::Update)
            | (Status::CheckedIn, Op::CheckOut | Op::Update)
    )
}

/// A reservation on its own day of room 101, driven into `status`.
async fn reservation_in(engine: &Engine, status: Status, day: Ms) -> Ulid {
    let span = nights(day, 1);
    let r = match status {
        Status::Pending | Status::Cancelled => engine.create_reservation(draft("Mr. Karim Ali", span)).await.unwrap(),
        _ => book(engine, "101", span).await.unwrap(),
    };
    match status {
        Status::Pending | Status::Confirmed => {}
        Status::Cancelled => {
            engine.cancel(r.id).await.unwrap();
        }
        Status::CheckedIn => {
            engine.check_in(r.id).await.unwrap();
        }
        Status::CheckedOut => {
            engine.check_in(r.id).await.unwrap();
            engine.check_out(r.id).await.unwrap();
        }
    }
    r.id
}

async fn run_op(engine: &Engine, id: Ulid, op: Op) -> Result<Reservation, EngineError> {
    match op {
        Op::Assign => engine.assign_resource(id, "101").await,
        Op::CheckIn => engine.check_in(id).await,
        Op::CheckOut => engine.check_out(id).await,
        Op::Cancel => engine.cancel(id).await,
        Op::Update => {
            let patch = ReservationPatch {
                notes: Some("Late arrival, keep key at desk".into()),
                ..Default::default()
            };
            engine.update(id, patch).await
        }
    }
}

#[tokio::test]
async fn transition_table_is_enforced() {
    let engine = seeded().await;
    let mut day = 0;
    for from in Status::ALL {
        for op in OPS {
            day += 1;
            let id = reservation_in(&engine, from, day).await;
            assert_eq!(engine.get_reservation(id).unwrap().status, from);

            let result = run_op(&engine, id, op).await;
            if legal(from, op) {
                assert!(result.is_ok(), "{op:?} from {from} should succeed: {result:?}");
            } else {
                assert!(
                    matches!(result, Err(EngineError::InvalidTransition { from: f, .. }) if f == from),
                    "{op:?} from {from} should be rejected: {result:?}"
                );
                assert_eq!(engine.get_reservation(id).unwrap().status, from);
            }
        }
    }
    assert_index_consistent(&engine).await;
}

#[tokio::test]
async fn cancel_from_checked_in_rejected() {
    let engine = seeded().await;
    let id = reservation_in(&engine, Status::CheckedIn, 0).await;
    assert!(matches!(
        engine.cancel(id).await,
        Err(EngineError::InvalidTransition { from: Status::CheckedIn, .. })
    ));
    assert!(engine.has_conflict("101", nights(0, 1), None).await.unwrap());
}

#[tokio::test]
async fn assign_conflict_keeps_pending() {
    let engine = seeded().await;
    book(&engine, "202", nights(0, 2)).await.unwrap();
    let r = engine.create_reservation(draft("Ms. Fatima Khan", nights(1, 1))).await.unwrap();

    assert!(matches!(
        engine.assign_resource(r.id, "202").await,
        Err(EngineError::Conflict { .. })
    ));
    let after = engine.get_reservation(r.id).unwrap();
    assert_eq!(after.status, Status::Pending);
    assert!(after.resource_id.is_none());

    assert!(matches!(
        engine.assign_resource(r.id, "nope").await,
        Err(EngineError::NotFound { entity: "resource", .. })
    ));
    engine.assign_resource(r.id, "201").await.unwrap();
}

// ── Updates ──────────────────────────────────────────────

#[tokio::test]
async fn update_move_is_conflict_checked() {
    let engine = seeded().await;
    let r1 = book(&engine, "202", nights(0, 1)).await.unwrap();
    let r2 = book(&engine, "201", nights(0, 1)).await.unwrap();

    let move_into_r1 = ReservationPatch {
        resource_id: Some("202".into()),
        ..Default::default()
    };
    assert!(matches!(
        engine.update(r2.id, move_into_r1).await,
        Err(EngineError::Conflict { held_by, .. }) if held_by == r1.id
    ));
    assert_eq!(engine.get_reservation(r2.id).unwrap(), r2);

    let move_a_day_later = ReservationPatch {
        resource_id: Some("202".into()),
        span: Some(nights(1, 1)),
        ..Default::default()
    };
    let moved = engine.update(r2.id, move_a_day_later).await.unwrap();
    assert_eq!(moved.resource_id.as_deref(), Some("202"));
    assert_eq!(moved.status, Status::Confirmed);
    assert!(!engine.has_conflict("201", nights(0, 1), None).await.unwrap());
    assert!(engine.has_conflict("202", nights(1, 1), None).await.unwrap());
    assert_index_consistent(&engine).await;
}

#[tokio::test]
async fn update_extending_own_stay_is_not_a_conflict() {
    let engine = seeded().await;
    let r = book(&engine, "202", nights(0, 2)).await.unwrap();
    let longer = ReservationPatch {
        span: Some(nights(0, 4)),
        ..Default::default()
    };
    assert_eq!(engine.update(r.id, longer).await.unwrap().span, nights(0, 4));
    assert_index_consistent(&engine).await;
}

#[tokio::test]
async fn update_growing_party_checks_capacity() {
    let engine = seeded().await;
    let r = book(&engine, "101", nights(0, 1)).await.unwrap();
    let crowd = ReservationPatch {
        party_size: Some(5),
        ..Default::default()
    };
    assert!(matches!(engine.update(r.id, crowd).await, Err(EngineError::Validation(_))));
}

#[tokio::test]
async fn update_pending_with_resource_confirms() {
    let engine = seeded().await;
    let r = engine.create_reservation(draft("Ms. Fatima Khan", nights(0, 1))).await.unwrap();
    let patch = ReservationPatch {
        resource_id: Some("201".into()),
        guest_name: Some("Ms. Fatima Khan Chowdhury".into()),
        ..Default::default()
    };
    let updated = engine.update(r.id, patch).await.unwrap();
    assert_eq!(updated.status, Status::Confirmed);
    assert_eq!(updated.guest.name, "Ms. Fatima Khan Chowdhury");
    assert!(engine.has_conflict("201", nights(0, 1), None).await.unwrap());
}

#[tokio::test]
async fn update_terminal_and_empty() {
    let engine = seeded().await;
    let id = reservation_in(&engine, Status::Cancelled, 0).await;
    let patch = ReservationPatch {
        span: Some(nights(2, 1)),
        ..Default::default()
    };
    assert!(matches!(
        engine.update(id, patch).await,
        Err(EngineError::InvalidTransition { op: "update", .. })
    ));
    assert!(matches!(
        engine.update(id, ReservationPatch::default()).await,
        Err(EngineError::Validation(_))
    ));
}

// ── Availability ─────────────────────────────────────────

#[tokio::test]
async fn has_conflict_excludes_reservation() {
    let engine = seeded().await;
    let r = book(&engine, "101", nights(0, 2)).await.unwrap();
    assert!(engine.has_conflict("101", nights(1, 1), None).await.unwrap());
    assert!(!engine.has_conflict("101", nights(1, 1), Some(r.id)).await.unwrap());
    assert!(!engine.has_conflict("101", nights(2, 1), None).await.unwrap());
    assert!(matches!(
        engine.has_conflict("101", Span::new(at(5), at(5)), None).await,
        Err(EngineError::InvalidInterval { .. })
    ));
}

#[tokio::test]
async fn pending_does_not_block() {
    let engine = seeded().await;
    let mut waiting = draft("Mr. Karim Ali", nights(0, 1));
    waiting.resource_id = None;
    engine.create_reservation(waiting).await.unwrap();
    assert!(!engine.has_conflict("202", nights(0, 1), None).await.unwrap());
}

#[tokio::test]
async fn suggestions_smallest_free_first() {
    let engine = seeded().await;
    engine.register_resource(Resource::room("102", 2, "Ground")).await.unwrap();
    engine.register_resource(Resource::room("301", 4, "Second")).await.unwrap();
    engine.retire_resource("201").await.unwrap();
    book(&engine, "101", nights(0, 1)).await.unwrap();

    let ids: Vec<String> = engine
        .suggest_resources(ResourceKind::Room, nights(0, 1), 2)
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.id)
        .collect();
    // 202 too small, 201 retired, 101 taken.
    assert_eq!(ids, vec!["102", "301"]);

    let any: Vec<String> = engine
        .suggest_resources(ResourceKind::Room, nights(3, 1), 1)
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(any, vec!["202", "101", "102", "301"]);

    let halls = engine.suggest_resources(ResourceKind::Hall, nights(0, 1), 150).await.unwrap();
    assert!(halls.is_empty());
}

#[tokio::test]
async fn free_windows_around_bookings() {
    let engine = seeded().await;
    book(&engine, "Hall A", Span::new(at(9), at(12))).await.unwrap();
    book(&engine, "Hall A", Span::new(at(14), at(17))).await.unwrap();
    let free = engine.free_windows("Hall A", Span::new(at(8), at(18))).await.unwrap();
    assert_eq!(
        free,
        vec![
            Span::new(at(8), at(9)),
            Span::new(at(12), at(14)),
            Span::new(at(17), at(18)),
        ]
    );
    assert!(matches!(
        engine.free_windows("Hall B", Span::new(at(8), at(18))).await,
        Err(EngineError::NotFound { .. })
    ));
}

// ── Queries ──────────────────────────────────────────────

#[tokio::test]
async fn list_by_resource_is_ordered_and_repeatable() {
    let engine = seeded().await;
    let later = book(&engine, "201", nights(3, 1)).await.unwrap();
    let earlier = book(&engine, "201", nights(0, 1)).await.unwrap();
    let cancelled = book(&engine, "201", nights(1, 1)).await.unwrap();
    engine.cancel(cancelled.id).await.unwrap();

    let first = engine.list_by_resource("201", None).unwrap();
    let second = engine.list_by_resource("201", None).unwrap();
    assert_eq!(first, second);
    assert_eq!(
        first.iter().map(|r| r.id).collect::<Vec<_>>(),
        vec![earlier.id, cancelled.id, later.id]
    );

    let windowed = engine.list_by_resource("201", Some(nights(2, 2))).unwrap();
    assert_eq!(windowed.len(), 1);
    assert_eq!(windowed[0].id, later.id);

    assert!(engine.list_by_resource("999", None).is_err());
}

#[tokio::test]
async fn list_by_status_and_filter() {
    let engine = seeded().await;
    let a = book(&engine, "101", nights(0, 1)).await.unwrap();
    let b = book(&engine, "201", nights(0, 1)).await.unwrap();
    engine.check_in(b.id).await.unwrap();
    let p = engine.create_reservation(draft("Ms. Fatima Khan", nights(0, 1))).await.unwrap();

    assert_eq!(engine.list_by_status(Status::Confirmed).iter().map(|r| r.id).collect::<Vec<_>>(), vec![a.id]);
    assert_eq!(engine.list_by_status(Status::Pending)[0].id, p.id);

    let filter = ReservationFilter {
        status: Some(Status::CheckedIn),
        resource_id: Some("201".into()),
        window: None,
    };
    let found = engine.list_reservations(&filter).unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, b.id);
}

#[tokio::test]
async fn search_by_name_phone_and_id() {
    let engine = seeded().await;
    let mut d = draft("Dr. Nasreen Ahmed", nights(0, 1));
    d.guest.contact = "+880 1711-234567".into();
    let nasreen = engine.create_reservation(d).await.unwrap();
    let mut d = draft("Mr. Karim Ali", nights(0, 1));
    d.guest.contact = "+880 1512-345678".into();
    let karim = engine.create_reservation(d).await.unwrap();

    assert_eq!(engine.search("nasreen").unwrap()[0].id, nasreen.id);
    assert_eq!(engine.search("01512345678").unwrap()[0].id, karim.id);
    assert!(engine.search("01999").unwrap().is_empty());
    assert_eq!(engine.search("1512-345678").unwrap()[0].id, karim.id);
    assert_eq!(engine.search(&karim.id.to_string()).unwrap()[0].id, karim.id);
    assert!(engine.search("  ").is_err());
}

#[tokio::test]
async fn occupancy_counts_active_resources() {
    let engine = seeded().await;
    assert_eq!(Engine::in_memory().occupancy_rate(ResourceKind::Room, at(0)).await, 0.0);

    book(&engine, "101", Span::new(at(0), at(48))).await.unwrap();
    let waiting = engine.create_reservation(draft("Ms. Fatima Khan", Span::new(at(0), at(48)))).await.unwrap();
    assert_eq!(waiting.status, Status::Pending);

    let rate = engine.occupancy_rate(ResourceKind::Room, at(12)).await;
    assert!((rate - 1.0 / 3.0).abs() < 1e-9);
    assert_eq!(engine.occupancy_rate(ResourceKind::Room, at(48)).await, 0.0);
    assert_eq!(engine.occupancy_rate(ResourceKind::Hall, at(12)).await, 0.0);

    engine.retire_resource("202").await.unwrap();
    assert_eq!(engine.occupancy_rate(ResourceKind::Room, at(12)).await, 0.5);
}

#[tokio::test]
async fn arrivals_and_departures_window() {
    let engine = seeded().await;
    let early = book(&engine, "101", Span::new(at(2), at(30))).await.unwrap();
    let late = book(&engine, "201", Span::new(at(20), at(26))).await.unwrap();
    let edge = book(&engine, "202", Span::new(at(24), at(40))).await.unwrap();
    engine.create_reservation(draft("Ms. Fatima Khan", Span::new(at(5), at(7)))).await.unwrap();
    let gone = book(&engine, "Hall A", Span::new(at(3), at(4))).await.unwrap();
    engine.cancel(gone.id).await.unwrap();

    let arrivals = engine.arrivals_in_window(at(0), at(24)).unwrap();
    assert_eq!(arrivals.iter().map(|r| r.id).collect::<Vec<_>>(), vec![early.id, late.id]);

    let departures = engine.departures_in_window(at(24), at(40)).unwrap();
    assert_eq!(departures.iter().map(|r| r.id).collect::<Vec<_>>(), vec![late.id, early.id]);
    assert!(!departures.iter().any(|r| r.id == edge.id));

    assert!(engine.arrivals_in_window(at(5), at(5)).is_err());
}

#[tokio::test]
async fn status_counts_per_state() {
    let engine = seeded().await;
    reservation_in(&engine, Status::Pending, 0).await;
    reservation_in(&engine, Status::Confirmed, 1).await;
    reservation_in(&engine, Status::CheckedIn, 2).await;
    reservation_in(&engine, Status::CheckedOut, 3).await;
    reservation_in(&engine, Status::Cancelled, 4).await;
    reservation_in(&engine, Status::Cancelled, 5).await;

    let counts = engine.status_counts();
    assert_eq!(counts.pending, 1);
    assert_eq!(counts.confirmed, 1);
    assert_eq!(counts.checked_in, 1);
    assert_eq!(counts.checked_out, 1);
    assert_eq!(counts.cancelled, 2);
    assert_eq!(counts.total(), 6);
}

#[tokio::test]
async fn board_shows_each_state() {
    let engine = seeded().await;
    engine.register_resource(Resource::room("102", 2, "Ground")).await.unwrap();

    let reserved = book(&engine, "201", Span::new(at(0), at(24))).await.unwrap();
    let staying = book(&engine, "101", Span::new(at(0), at(24))).await.unwrap();
    engine.check_in(staying.id).await.unwrap();
    let left = book(&engine, "102", Span::new(at(-24), at(1))).await.unwrap();
    engine.check_in(left.id).await.unwrap();
    engine.check_out(left.id).await.unwrap();
    engine.retire_resource("202").await.unwrap();

    let board = engine.resource_board(Some(ResourceKind::Room), at(12)).await;
    let view: Vec<(&str, BoardState)> = board.iter().map(|e| (e.resource.id.as_str(), e.state)).collect();
    assert_eq!(
        view,
        vec![
            ("201", BoardState::Reserved),
            ("202", BoardState::Retired),
            ("101", BoardState::Occupied),
            ("102", BoardState::Cleaning),
        ]
    );
    assert_eq!(board[0].reservation_id, Some(reserved.id));
    assert_eq!(board[2].guest_name.as_deref(), Some("Mr. Karim Ali"));
    assert!(board[3].reservation_id.is_none());

    engine.mark_clean("102").await.unwrap();
    let board = engine.resource_board(None, at(30)).await;
    assert!(board.iter().any(|e| e.resource.id == "102" && e.state == BoardState::Available));
    assert!(board.iter().any(|e| e.resource.id == "Hall A"));
}

#[tokio::test]
async fn dashboard_summary_next_day() {
    let engine = seeded().await;
    let now = at(12);
    let staying = book(&engine, "101", Span::new(at(0), at(30))).await.unwrap();
    engine.check_in(staying.id).await.unwrap();
    let arriving = book(&engine, "201", Span::new(at(20), at(60))).await.unwrap();
    book(&engine, "202", Span::new(at(40), at(60))).await.unwrap();

    let summary = engine.dashboard_summary(now).await.unwrap();
    assert_eq!(summary.at, now);
    assert!((summary.room_occupancy - 1.0 / 3.0).abs() < 1e-9);
    assert_eq!(summary.hall_occupancy, 0.0);
    assert_eq!(summary.counts.total(), 3);
    assert_eq!(summary.arrivals.iter().map(|r| r.id).collect::<Vec<_>>(), vec![arriving.id]);
    assert_eq!(summary.departures.iter().map(|r| r.id).collect::<Vec<_>>(), vec![staying.id]);
}

// ── Concurrency ──────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_overlapping_creates_one_wins() {
    let engine = Arc::new(seeded().await);
    let mut handles = Vec::new();
    for i in 0..32 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            let span = Span::new(at(i % 5), at(24 + i % 7));
            engine
                .create_reservation(draft(&format!("Guest {i}"), span).on("202"))
                .await
        }));
    }
    let mut won = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => won += 1,
            Err(EngineError::Conflict { .. }) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
    assert_eq!(won, 1);
    assert_eq!(engine.list_by_status(Status::Confirmed).len(), 1);
    assert_index_consistent(&engine).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_assignments_race_for_one_room() {
    let engine = Arc::new(seeded().await);
    let mut pending = Vec::new();
    for i in 0..16 {
        let r = engine
            .create_reservation(draft(&format!("Guest {i}"), nights(0, 2)))
            .await
            .unwrap();
        pending.push(r.id);
    }
    let handles: Vec<_> = pending
        .into_iter()
        .map(|id| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.assign_resource(id, "202").await })
        })
        .collect();
    let mut won = 0;
    for h in handles {
        if h.await.unwrap().is_ok() {
            won += 1;
        }
    }
    assert_eq!(won, 1);
    assert_index_consistent(&engine).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_transitions_on_one_reservation() {
    let engine = Arc::new(seeded().await);
    let r = book(&engine, "101", nights(0, 1)).await.unwrap();
    let a = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.cancel(r.id).await })
    };
    let b = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.check_in(r.id).await })
    };
    let (a, b) = (a.await.unwrap(), b.await.unwrap());
    assert!(a.is_ok() != b.is_ok(), "exactly one transition wins: {a:?} / {b:?}");
    assert_index_consistent(&engine).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cross_moves_do_not_deadlock() {
    let engine = Arc::new(seeded().await);
    let on_101 = book(&engine, "101", nights(0, 1)).await.unwrap();
    let on_201 = book(&engine, "201", nights(1, 1)).await.unwrap();

    let mut handles = Vec::new();
    for round in 0..20 {
        for (id, to) in [(on_101.id, "201"), (on_201.id, "101")] {
            let engine = engine.clone();
            let target = if round % 2 == 0 { to } else { "202" };
            handles.push(tokio::spawn(async move {
                let patch = ReservationPatch {
                    resource_id: Some(target.to_string()),
                    ..Default::default()
                };
                let _ = engine.update(id, patch).await;
            }));
        }
    }
    for h in handles {
        h.await.unwrap();
    }
    assert_index_consistent(&engine).await;
}

// ── Durability ───────────────────────────────────────────

#[tokio::test]
async fn in_memory_engine_has_no_journal() {
    let engine = seeded().await;
    book(&engine, "101", nights(0, 1)).await.unwrap();
    assert_eq!(engine.wal_appends_since_compact().await, 0);
    engine.compact_wal().await.unwrap();
}

#[tokio::test]
async fn wal_replay_restores_state() {
    let path = test_wal_path("replay.wal");
    let (confirmed, checked_out, cancelled, moved);
    let before;
    {
        let engine = Engine::open(&path).unwrap();
        seed(&engine).await;
        confirmed = book(&engine, "101", nights(0, 2)).await.unwrap();
        checked_out = book(&engine, "202", nights(0, 1)).await.unwrap();
        engine.check_in(checked_out.id).await.unwrap();
        engine.check_out(checked_out.id).await.unwrap();
        cancelled = engine.create_reservation(draft("Ms. Fatima Khan", nights(0, 1))).await.unwrap();
        engine.cancel(cancelled.id).await.unwrap();
        moved = engine.create_reservation(draft("Dr. Nasreen Ahmed", nights(3, 1))).await.unwrap();
        engine.assign_resource(moved.id, "201").await.unwrap();
        let patch = ReservationPatch {
            resource_id: Some("101".into()),
            party_size: Some(2),
            ..Default::default()
        };
        engine.update(moved.id, patch).await.unwrap();
        engine.retire_resource("Hall A").await.unwrap();
        before = engine.list_reservations(&ReservationFilter::default()).unwrap();
    }

    let engine = Engine::open(&path).unwrap();
    assert_eq!(engine.list_reservations(&ReservationFilter::default()).unwrap(), before);
    assert_eq!(engine.get_reservation(confirmed.id).unwrap().status, Status::Confirmed);
    assert_eq!(engine.get_reservation(checked_out.id).unwrap().status, Status::CheckedOut);
    assert_eq!(engine.get_reservation(cancelled.id).unwrap().status, Status::Cancelled);
    let moved = engine.get_reservation(moved.id).unwrap();
    assert_eq!(moved.resource_id.as_deref(), Some("101"));
    assert_eq!(moved.party_size, 2);
    assert!(engine.get_resource("202").await.unwrap().needs_cleaning);
    assert!(engine.get_resource("Hall A").await.unwrap().retired);

    // Replayed index still enforces conflicts, and transitions still work.
    assert!(matches!(
        book(&engine, "101", nights(1, 1)).await,
        Err(EngineError::Conflict { .. })
    ));
    assert!(!engine.has_conflict("201", nights(3, 1), None).await.unwrap());
    engine.check_in(confirmed.id).await.unwrap();
    assert_index_consistent(&engine).await;
}

#[tokio::test]
async fn compact_wal_preserves_state() {
    let path = test_wal_path("compact_state.wal");
    let engine = Engine::open(&path).unwrap();
    seed(&engine).await;

    // Churn: bookings that get cancelled.
    for day in 0..20 {
        let r = book(&engine, "201", nights(day, 1)).await.unwrap();
        engine.cancel(r.id).await.unwrap();
    }
    let kept = book(&engine, "201", nights(30, 2)).await.unwrap();
    engine.check_in(kept.id).await.unwrap();
    engine.retire_resource("202").await.unwrap();

    let reservations_before = engine.list_reservations(&ReservationFilter::default()).unwrap();
    let board_before = engine.resource_board(None, at(30 * 24 + 1)).await;
    let size_before = std::fs::metadata(&path).unwrap().len();

    engine.compact_wal().await.unwrap();

    let size_after = std::fs::metadata(&path).unwrap().len();
    assert!(size_after < size_before, "compacted WAL ({size_after}) should be smaller than original ({size_before})");
    assert_eq!(engine.wal_appends_since_compact().await, 0);
    assert_eq!(engine.list_reservations(&ReservationFilter::default()).unwrap(), reservations_before);
    assert_eq!(engine.resource_board(None, at(30 * 24 + 1)).await, board_before);
}

#[tokio::test]
async fn compact_wal_survives_restart() {
    let path = test_wal_path("compact_restart.wal");
    let (kept, after_compact);
    let board_before;
    {
        let engine = Engine::open(&path).unwrap();
        seed(&engine).await;
        kept = book(&engine, "Hall A", Span::new(at(9), at(17))).await.unwrap();
        let gone = book(&engine, "101", nights(0, 1)).await.unwrap();
        engine.check_in(gone.id).await.unwrap();
        engine.check_out(gone.id).await.unwrap();

        engine.compact_wal().await.unwrap();

        after_compact = book(&engine, "Hall A", Span::new(at(17), at(20))).await.unwrap();
        board_before = engine.resource_board(None, at(10)).await;
    }

    let engine = Engine::open(&path).unwrap();
    assert_eq!(engine.list_resources(None).await.len(), 4);
    assert!(engine.get_resource("101").await.unwrap().needs_cleaning);
    assert_eq!(engine.get_reservation(kept.id).unwrap(), kept);
    assert_eq!(engine.get_reservation(after_compact.id).unwrap(), after_compact);
    assert_eq!(engine.status_counts().checked_out, 1);
    assert_eq!(engine.resource_board(None, at(10)).await, board_before);
    assert!(engine.has_conflict("Hall A", Span::new(at(16), at(18)), None).await.unwrap());
    assert_index_consistent(&engine).await;
}

#[tokio::test]
async fn group_commit_batches_appends() {
    let path = test_wal_path("group_commit_batch.wal");
    let engine = Arc::new(Engine::open(&path).unwrap());
    engine.register_resource(Resource::hall("Hall A", 100, "Annex")).await.unwrap();

    let n = 20;
    let mut handles = Vec::new();
    for i in 0..n {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine
                .create_reservation(draft(&format!("Guest {i}"), Span::new(at(i), at(i + 1))).on("Hall A"))
                .await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }
    assert_eq!(engine.wal_appends_since_compact().await, n as u64 + 1);

    let replayed = Engine::open(&path).unwrap();
    assert_eq!(replayed.list_by_resource("Hall A", None).unwrap().len(), n as usize);
}

#[tokio::test]
async fn wal_counter_tracks_only_successful_writes() {
    let path = test_wal_path("appends_counter.wal");
    let engine = Engine::open(&path).unwrap();
    assert_eq!(engine.wal_appends_since_compact().await, 0);

    engine.register_resource(Resource::room("202", 1, "First")).await.unwrap();
    let r = book(&engine, "202", nights(0, 1)).await.unwrap();
    assert!(book(&engine, "202", nights(0, 1)).await.is_err());
    assert!(engine.check_out(r.id).await.is_err());
    engine.cancel(r.id).await.unwrap();

    assert_eq!(engine.wal_appends_since_compact().await, 3);
}

// ── Limits ───────────────────────────────────────────────

#[tokio::test]
async fn span_limits() {
    let engine = seeded().await;
    assert!(matches!(
        book(&engine, "Hall A", Span::new(0, 1000)).await,
        Err(EngineError::LimitExceeded("timestamp out of range"))
    ));
    assert!(matches!(
        book(&engine, "Hall A", Span::new(at(0), at(0) + MAX_SPAN_DURATION_MS + 1)).await,
        Err(EngineError::LimitExceeded("span too wide"))
    ));
    book(&engine, "Hall A", Span::new(at(0), at(0) + MAX_SPAN_DURATION_MS)).await.unwrap();
}

#[tokio::test]
async fn text_limits() {
    let engine = seeded().await;
    let mut d = draft("Mr. Karim Ali", nights(0, 1));
    d.notes = Some("x".repeat(MAX_NOTES_LEN + 1));
    assert!(matches!(
        engine.create_reservation(d).await,
        Err(EngineError::LimitExceeded("notes too long"))
    ));
    assert!(matches!(
        engine.search(&"a".repeat(MAX_SEARCH_TERM_LEN + 1)),
        Err(EngineError::LimitExceeded(_))
    ));
}

// ── No double-booking ────────────────────────────────────

#[derive(Debug, Clone)]
enum Action {
    Book { resource: usize, start_h: Ms, len_h: Ms },
    Request { start_h: Ms, len_h: Ms },
    Assign { pick: usize, resource: usize },
    Move { pick: usize, resource: usize, start_h: Ms, len_h: Ms },
    CheckIn { pick: usize },
    CheckOut { pick: usize },
    Cancel { pick: usize },
}

const ROOMS: [&str; 3] = ["101", "201", "202"];

fn action() -> impl Strategy<Value = Action> {
    prop_oneof![
        (0..3usize, 0..240i64, 1..72i64).prop_map(|(resource, start_h, len_h)| Action::Book { resource, start_h, len_h }),
        (0..240i64, 1..72i64).prop_map(|(start_h, len_h)| Action::Request { start_h, len_h }),
        (any::<usize>(), 0..3usize).prop_map(|(pick, resource)| Action::Assign { pick, resource }),
        (any::<usize>(), 0..3usize, 0..240i64, 1..72i64)
            .prop_map(|(pick, resource, start_h, len_h)| Action::Move { pick, resource, start_h, len_h }),
        any::<usize>().prop_map(|pick| Action::CheckIn { pick }),
        any::<usize>().prop_map(|pick| Action::CheckOut { pick }),
        any::<usize>().prop_map(|pick| Action::Cancel { pick }),
    ]
}

fn pick(ids: &[Ulid], i: usize) -> Option<Ulid> {
    (!ids.is_empty()).then(|| ids[i % ids.len()])
}

async fn apply_action(engine: &Engine, ids: &mut Vec<Ulid>, action: Action) {
    match action {
        Action::Book { resource, start_h, len_h } => {
            if let Ok(r) = book(engine, ROOMS[resource], Span::new(at(start_h), at(start_h + len_h))).await {
                ids.push(r.id);
            }
        }
        Action::Request { start_h, len_h } => {
            let d = draft("Walk-in", Span::new(at(start_h), at(start_h + len_h)));
            if let Ok(r) = engine.create_reservation(d).await {
                ids.push(r.id);
            }
        }
        Action::Assign { pick: i, resource } => {
            if let Some(id) = pick(ids, i) {
                let _ = engine.assign_resource(id, ROOMS[resource]).await;
            }
        }
        Action::Move { pick: i, resource, start_h, len_h } => {
            if let Some(id) = pick(ids, i) {
                let patch = ReservationPatch {
                    resource_id: Some(ROOMS[resource].to_string()),
                    span: Some(Span::new(at(start_h), at(start_h + len_h))),
                    ..Default::default()
                };
                let _ = engine.update(id, patch).await;
            }
        }
        Action::CheckIn { pick: i } => {
            if let Some(id) = pick(ids, i) {
                let _ = engine.check_in(id).await;
            }
        }
        Action::CheckOut { pick: i } => {
            if let Some(id) = pick(ids, i) {
                let _ = engine.check_out(id).await;
            }
        }
        Action::Cancel { pick: i } => {
            if let Some(id) = pick(ids, i) {
                let _ = engine.cancel(id).await;
            }
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn holding_reservations_never_overlap(actions in prop::collection::vec(action(), 1..60)) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let engine = seeded().await;
            let mut ids = Vec::new();
            for a in actions {
                apply_action(&engine, &mut ids, a).await;
            }

            for room in ROOMS {
                let holding: Vec<Reservation> = engine
                    .list_by_resource(room, None)
                    .unwrap()
                    .into_iter()
                    .filter(|r| r.holds())
                    .collect();
                for (i, a) in holding.iter().enumerate() {
                    for b in &holding[i + 1..] {
                        assert!(!a.span.overlaps(&b.span), "{room}: {a:?} overlaps {b:?}");
                    }
                }
            }
            assert_index_consistent(&engine).await;
        });
    }
}
