use super::availability::{REASON_APARTMENT_LOCKED, REASON_BEDS_RESERVED};
use super::*;
use crate::limits::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::wal::Wal;

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("nestbook_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn new_engine(path: PathBuf) -> Engine {
    Engine::new(path, Arc::new(NotifyHub::new())).unwrap()
}

/// Apartment A: R1 with beds B1, B2 and R2 with bed B3, everything enabled.
#[derive(Clone, Copy)]
struct Layout {
    apt: Ulid,
    r1: Ulid,
    r2: Ulid,
    b1: Ulid,
    b2: Ulid,
    b3: Ulid,
}

async fn seed(engine: &Engine) -> Layout {
    let l = Layout {
        apt: Ulid::new(),
        r1: Ulid::new(),
        r2: Ulid::new(),
        b1: Ulid::new(),
        b2: Ulid::new(),
        b3: Ulid::new(),
    };
    engine
        .create_apartment(l.apt, Some("Rua das Flores 3".into()), 4, vec![1, 2, 3, 4], Capabilities::all())
        .await
        .unwrap();
    engine.add_bedroom(l.r1, l.apt, 2, 2, false, PricingMode::Both).await.unwrap();
    engine.add_bedroom(l.r2, l.apt, 1, 2, true, PricingMode::Both).await.unwrap();
    for (bed, room, label) in [(l.b1, l.r1, "B1"), (l.b2, l.r1, "B2"), (l.b3, l.r2, "B3")] {
        engine
            .add_bed(bed, room, label.into(), Some("single".into()), 45_000, 90_000, 1)
            .await
            .unwrap();
    }
    l
}

fn bed(l: &Layout, bed: Ulid, holder: &str) -> ReserveRequest {
    ReserveRequest::new(l.apt, Granularity::Bed, bed, holder)
}

fn room(l: &Layout, room: Ulid, holder: &str) -> ReserveRequest {
    ReserveRequest::new(l.apt, Granularity::Bedroom, room, holder)
}

fn whole(l: &Layout, holder: &str) -> ReserveRequest {
    ReserveRequest::new(l.apt, Granularity::Apartment, l.apt, holder)
}

fn conflict_reason(result: Result<Reservation, EngineError>) -> ConflictReason {
    match result {
        Err(EngineError::Conflict(c)) => c.reason,
        other => panic!("expected conflict, got {other:?}"),
    }
}

// ── Walkthrough scenarios ────────────────────────────────────

#[tokio::test]
async fn fresh_apartment_fully_available() {
    let engine = new_engine(test_wal_path("fresh.wal"));
    let l = seed(&engine).await;

    let view = engine.get_availability(l.apt).unwrap();
    assert!(view.listed);
    assert!(view.apartment_reservable);
    assert!(!view.is_apartment_locked);
    assert_eq!(view.available_bedrooms_count, 2);
    assert_eq!(view.total_bedrooms_count, 2);
    assert_eq!(view.available_beds_count, 3);
    assert_eq!(view.total_beds_count, 3);
    assert_eq!(view.reason, None);
}

#[tokio::test]
async fn bed_reservation_blocks_room_and_apartment() {
    let engine = new_engine(test_wal_path("bed_blocks.wal"));
    let l = seed(&engine).await;

    engine.attempt_reserve(bed(&l, l.b1, "h1")).await.unwrap();

    let view = engine.get_availability(l.apt).unwrap();
    assert_eq!(view.can_reserve_bed[&l.b1], false);
    assert_eq!(view.can_reserve_bed[&l.b2], true);
    assert_eq!(view.can_reserve_bedroom[&l.r1], false);
    assert_eq!(view.can_reserve_bedroom[&l.r2], true);
    assert!(!view.apartment_reservable);
    assert!(view.has_any_bed_reserved);
    assert_eq!(view.reason.as_deref(), Some(REASON_BEDS_RESERVED));

    assert_eq!(conflict_reason(engine.attempt_reserve(room(&l, l.r1, "h2")).await), ConflictReason::BedTaken);
    assert_eq!(conflict_reason(engine.attempt_reserve(whole(&l, "h2")).await), ConflictReason::BedTaken);
    assert_eq!(conflict_reason(engine.attempt_reserve(bed(&l, l.b1, "h2")).await), ConflictReason::BedTaken);
}

#[tokio::test]
async fn untouched_bedroom_still_reservable_next_to_bed_reservation() {
    let engine = new_engine(test_wal_path("untouched_room.wal"));
    let l = seed(&engine).await;

    engine.attempt_reserve(bed(&l, l.b1, "h1")).await.unwrap();
    let r = engine.attempt_reserve(room(&l, l.r2, "h2")).await.unwrap();
    assert_eq!(r.granularity, Granularity::Bedroom);
    assert!(r.is_active());

    let view = engine.get_availability(l.apt).unwrap();
    assert_eq!(view.can_reserve_bed[&l.b3], false);
    assert_eq!(view.available_bedrooms_count, 0);
    assert_eq!(view.available_beds_count, 1);
    assert!(view.has_any_bedroom_reserved);
}

#[tokio::test]
async fn bed_and_its_bedroom_race_one_winner() {
    for round in 0..20 {
        let engine = Arc::new(new_engine(test_wal_path(&format!("race_bed_room_{round}.wal"))));
        let l = seed(&engine).await;

        let e1 = engine.clone();
        let e2 = engine.clone();
        let a = tokio::spawn(async move { e1.attempt_reserve(bed(&l, l.b2, "h1")).await });
        let b = tokio::spawn(async move { e2.attempt_reserve(room(&l, l.r1, "h2")).await });
        let results = [a.await.unwrap(), b.await.unwrap()];

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1, "round {round}");
        let loser = results.into_iter().find(|r| r.is_err()).unwrap();
        let reason = conflict_reason(loser);
        assert!(matches!(reason, ConflictReason::BedTaken | ConflictReason::BedroomLocked));
        assert!(engine.check_integrity(l.apt).unwrap().is_empty());
    }
}

#[tokio::test]
async fn many_racers_on_one_bed_exactly_one_wins() {
    let engine = Arc::new(new_engine(test_wal_path("race_many.wal")));
    let l = seed(&engine).await;

    let mut handles = Vec::new();
    for i in 0..32 {
        let e = engine.clone();
        handles.push(tokio::spawn(async move { e.attempt_reserve(bed(&l, l.b3, &format!("h{i}"))).await }));
    }
    let mut wins = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => wins += 1,
            Err(e) => assert_eq!(conflict_reason(Err(e)), ConflictReason::BedTaken),
        }
    }
    assert_eq!(wins, 1);
    let active = engine.get_reservations(l.apt).await.unwrap();
    assert_eq!(active.iter().filter(|r| r.is_active()).count(), 1);
}

#[tokio::test]
async fn apartment_and_sub_units_race_one_winner() {
    let engine = Arc::new(new_engine(test_wal_path("race_apartment.wal")));
    let l = seed(&engine).await;

    let e1 = engine.clone();
    let e2 = engine.clone();
    let e3 = engine.clone();
    let a = tokio::spawn(async move { e1.attempt_reserve(whole(&l, "h1")).await });
    let b = tokio::spawn(async move { e2.attempt_reserve(bed(&l, l.b1, "h2")).await });
    let c = tokio::spawn(async move { e3.attempt_reserve(room(&l, l.r2, "h3")).await });
    let (a, b, c) = (a.await.unwrap(), b.await.unwrap(), c.await.unwrap());

    if a.is_ok() {
        assert!(b.is_err() && c.is_err());
    } else {
        // Apartment lost to at least one sub-unit; the two sub-units don't overlap.
        assert!(b.is_ok() || c.is_ok());
    }
    assert!(engine.check_integrity(l.apt).unwrap().is_empty());
}

#[tokio::test]
async fn cancelling_apartment_reservation_restores_availability() {
    let engine = new_engine(test_wal_path("cancel_apartment.wal"));
    let l = seed(&engine).await;

    let r = engine.attempt_reserve(whole(&l, "h1")).await.unwrap();
    let view = engine.get_availability(l.apt).unwrap();
    assert!(view.is_apartment_locked);
    assert_eq!(view.reason.as_deref(), Some(REASON_APARTMENT_LOCKED));
    assert_eq!(view.available_bedrooms_count, 0);
    assert_eq!(view.available_beds_count, 0);
    assert_eq!(conflict_reason(engine.attempt_reserve(bed(&l, l.b3, "h2")).await), ConflictReason::ApartmentLocked);

    engine.cancel_reservation(r.id).await.unwrap();
    let view = engine.get_availability(l.apt).unwrap();
    assert!(view.apartment_reservable);
    assert_eq!(view.available_beds_count, 3);

    // A sub-unit booked after the cancellation blocks the apartment again.
    engine.attempt_reserve(bed(&l, l.b3, "h2")).await.unwrap();
    assert!(!engine.get_availability(l.apt).unwrap().apartment_reservable);
}

// ── Cancellation ─────────────────────────────────────────────

#[tokio::test]
async fn cancel_is_idempotent() {
    let engine = new_engine(test_wal_path("cancel_idem.wal"));
    let l = seed(&engine).await;
    let mut rx = engine.subscribe(l.apt).unwrap();

    let r = engine.attempt_reserve(bed(&l, l.b1, "h1")).await.unwrap();
    let first = engine.cancel_reservation(r.id).await.unwrap();
    let second = engine.cancel_reservation(r.id).await.unwrap();

    assert_eq!(first.status, ReservationStatus::Cancelled);
    assert_eq!(first, second);
    assert!(first.cancelled_at.is_some());

    assert!(matches!(rx.recv().await.unwrap(), DomainEvent::ReservationCreated { .. }));
    assert!(matches!(rx.recv().await.unwrap(), DomainEvent::ReservationCancelled { .. }));
    // No second cancellation event.
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn cancel_unknown_reservation_not_found() {
    let engine = new_engine(test_wal_path("cancel_unknown.wal"));
    let result = engine.cancel_reservation(Ulid::new()).await;
    assert!(matches!(result, Err(EngineError::NotFound(_))));
}

#[tokio::test]
async fn cancelled_history_is_kept() {
    let engine = new_engine(test_wal_path("history.wal"));
    let l = seed(&engine).await;

    let first = engine.attempt_reserve(bed(&l, l.b1, "h1")).await.unwrap();
    engine.cancel_reservation(first.id).await.unwrap();
    let second = engine.attempt_reserve(bed(&l, l.b1, "h2")).await.unwrap();

    let history = engine.get_reservations(l.apt).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].id, first.id);
    assert_eq!(history[0].status, ReservationStatus::Cancelled);
    assert_eq!(history[1].id, second.id);
    assert_eq!(engine.get_reservation(second.id).await.unwrap(), second);
}

// ── Request handling ─────────────────────────────────────────

#[tokio::test]
async fn retried_request_returns_existing_reservation() {
    let engine = new_engine(test_wal_path("retry_id.wal"));
    let l = seed(&engine).await;

    let req = bed(&l, l.b1, "h1");
    let first = engine.attempt_reserve(req.clone()).await.unwrap();
    let again = engine.attempt_reserve(req.clone()).await.unwrap();
    assert_eq!(first, again);
    assert_eq!(engine.get_reservations(l.apt).await.unwrap().len(), 1);

    // Same id, different target.
    let mut other = req;
    other.target_id = l.b2;
    assert!(matches!(engine.attempt_reserve(other).await, Err(EngineError::AlreadyExists(_))));
}

#[tokio::test]
async fn malformed_requests_rejected_before_locking() {
    let engine = new_engine(test_wal_path("malformed.wal"));
    let l = seed(&engine).await;

    assert!(matches!(
        engine.attempt_reserve(bed(&l, l.b1, "  ")).await,
        Err(EngineError::Invalid(_))
    ));
    assert!(matches!(
        engine.attempt_reserve(bed(&l, l.b1, &"x".repeat(MAX_HOLDER_ID_LEN + 1))).await,
        Err(EngineError::LimitExceeded(_))
    ));
    // Unit that isn't in this apartment.
    assert!(matches!(
        engine.attempt_reserve(bed(&l, Ulid::new(), "h")).await,
        Err(EngineError::NotFound(_))
    ));
    // Bedroom id asked for as a bed.
    assert!(matches!(
        engine.attempt_reserve(bed(&l, l.r1, "h")).await,
        Err(EngineError::Invalid(_))
    ));
    // Apartment granularity must target the apartment itself.
    assert!(matches!(
        engine
            .attempt_reserve(ReserveRequest::new(l.apt, Granularity::Apartment, l.r1, "h"))
            .await,
        Err(EngineError::Invalid(_))
    ));
    assert!(matches!(
        engine
            .attempt_reserve(ReserveRequest::new(Ulid::new(), Granularity::Bed, l.b1, "h"))
            .await,
        Err(EngineError::NotFound(_))
    ));
    assert!(engine.get_reservations(l.apt).await.unwrap().is_empty());
}

#[tokio::test]
async fn disabled_capability_is_a_conflict() {
    let engine = new_engine(test_wal_path("capability.wal"));
    let l = seed(&engine).await;
    let kept = engine.attempt_reserve(bed(&l, l.b1, "h1")).await.unwrap();

    engine
        .set_capabilities(
            l.apt,
            Capabilities {
                allow_full_reservation: true,
                allow_bedroom_reservation: true,
                allow_bed_reservation: false,
            },
        )
        .await
        .unwrap();

    assert_eq!(
        conflict_reason(engine.attempt_reserve(bed(&l, l.b3, "h2")).await),
        ConflictReason::CapabilityDisabled
    );
    // Existing reservations survive the toggle.
    assert!(engine.get_reservation(kept.id).await.unwrap().is_active());
    engine.attempt_reserve(room(&l, l.r2, "h3")).await.unwrap();
}

#[tokio::test]
async fn unlisted_apartment_rejects_everything() {
    let engine = new_engine(test_wal_path("unlisted.wal"));
    let l = seed(&engine).await;
    engine.set_capabilities(l.apt, Capabilities::default()).await.unwrap();

    let view = engine.get_availability(l.apt).unwrap();
    assert!(!view.listed);
    assert_eq!(view.available_beds_count, 0);
    for req in [whole(&l, "h"), room(&l, l.r1, "h"), bed(&l, l.b1, "h")] {
        assert_eq!(conflict_reason(engine.attempt_reserve(req).await), ConflictReason::CapabilityDisabled);
    }
}

#[tokio::test]
async fn lock_wait_timeout_writes_nothing() {
    let engine = new_engine(test_wal_path("timeout.wal"));
    let l = seed(&engine).await;

    let held = engine.get_apartment(&l.apt).unwrap().write_owned().await;
    let req = bed(&l, l.b1, "h1");
    let result = engine
        .attempt_reserve_with_timeout(req.clone(), Duration::from_millis(20))
        .await;
    assert!(matches!(result, Err(EngineError::Timeout)));
    assert!(result.unwrap_err().is_retryable());
    drop(held);

    assert!(engine.get_reservations(l.apt).await.unwrap().is_empty());
    // The identical request goes through once the lock is free.
    let r = engine
        .attempt_reserve_with_timeout(req, Duration::from_secs(5))
        .await
        .unwrap();
    assert!(r.is_active());
}

// ── Inventory ────────────────────────────────────────────────

#[tokio::test]
async fn bed_capacity_respects_bedroom_limits() {
    let engine = new_engine(test_wal_path("bed_limits.wal"));
    let l = seed(&engine).await;

    // R1 is full at base 2 and disallows extra beds.
    let extra = engine.add_bed(Ulid::new(), l.r1, "B9".into(), None, 1, 1, 1).await;
    assert!(matches!(extra, Err(EngineError::Invalid(_))));

    // R2 allows one extra bed up to max 2.
    let extra_bed = Ulid::new();
    engine.add_bed(extra_bed, l.r2, "Sofa".into(), Some("sofa_bed".into()), 20_000, 0, 1).await.unwrap();
    let over = engine.add_bed(Ulid::new(), l.r2, "Cot".into(), None, 1, 1, 1).await;
    assert!(matches!(over, Err(EngineError::Invalid(_))));

    let inv = engine.get_inventory(l.apt).unwrap();
    assert_eq!(inv.bedroom(&l.r2).unwrap().beds.len(), 2);
    assert_eq!(engine.apartment_for_unit(&extra_bed), Some(l.apt));
}

#[tokio::test]
async fn extra_bed_added_to_reserved_bedroom_is_covered() {
    let engine = new_engine(test_wal_path("extra_bed_locked.wal"));
    let l = seed(&engine).await;

    engine.attempt_reserve(room(&l, l.r2, "h1")).await.unwrap();
    let extra = Ulid::new();
    engine.add_bed(extra, l.r2, "Extra".into(), None, 10_000, 0, 1).await.unwrap();

    let view = engine.get_availability(l.apt).unwrap();
    assert_eq!(view.can_reserve_bed[&extra], false);
    assert_eq!(
        conflict_reason(engine.attempt_reserve(bed(&l, extra, "h2")).await),
        ConflictReason::BedroomLocked
    );
}

#[tokio::test]
async fn duplicate_ids_rejected_across_units() {
    let engine = new_engine(test_wal_path("dup_ids.wal"));
    let l = seed(&engine).await;

    let dup_apt = engine.create_apartment(l.apt, None, 1, vec![], Capabilities::all()).await;
    assert!(matches!(dup_apt, Err(EngineError::AlreadyExists(_))));
    let room_as_bed = engine.add_bed(l.r1, l.r2, "X".into(), None, 0, 0, 1).await;
    assert!(matches!(room_as_bed, Err(EngineError::AlreadyExists(_))));
    let bed_as_room = engine.add_bedroom(l.b1, l.apt, 1, 1, false, PricingMode::PerBed).await;
    assert!(matches!(bed_as_room, Err(EngineError::AlreadyExists(_))));
}

#[tokio::test]
async fn invalid_capacities_rejected() {
    let engine = new_engine(test_wal_path("bad_caps.wal"));
    let r = engine.create_apartment(Ulid::new(), None, 0, vec![], Capabilities::all()).await;
    assert!(matches!(r, Err(EngineError::Invalid(_))));
    let r = engine.create_apartment(Ulid::new(), None, 2, vec![3], Capabilities::all()).await;
    assert!(matches!(r, Err(EngineError::Invalid(_))));

    let apt = Ulid::new();
    engine.create_apartment(apt, None, 2, vec![2], Capabilities::all()).await.unwrap();
    let r = engine.add_bedroom(Ulid::new(), apt, 3, 2, false, PricingMode::Both).await;
    assert!(matches!(r, Err(EngineError::Invalid(_))));
}

#[tokio::test]
async fn delete_apartment_requires_no_active_reservations() {
    let engine = new_engine(test_wal_path("delete.wal"));
    let l = seed(&engine).await;
    let r = engine.attempt_reserve(bed(&l, l.b1, "h1")).await.unwrap();

    assert!(matches!(
        engine.delete_apartment(l.apt).await,
        Err(EngineError::HasActiveReservations(_))
    ));
    engine.cancel_reservation(r.id).await.unwrap();
    engine.delete_apartment(l.apt).await.unwrap();

    assert!(matches!(engine.get_availability(l.apt), Err(EngineError::NotFound(_))));
    assert!(matches!(engine.get_reservation(r.id).await, Err(EngineError::NotFound(_))));
    assert_eq!(engine.apartment_for_unit(&l.b1), None);
    assert!(engine.list_apartments().is_empty());
}

#[tokio::test]
async fn list_apartments_reports_counts() {
    let engine = new_engine(test_wal_path("list.wal"));
    let l = seed(&engine).await;
    engine.attempt_reserve(bed(&l, l.b1, "h1")).await.unwrap();

    let list = engine.list_apartments();
    assert_eq!(list.len(), 1);
    let info = &list[0];
    assert_eq!(info.id, l.apt);
    assert_eq!(info.name.as_deref(), Some("Rua das Flores 3"));
    assert_eq!(info.bedrooms, 2);
    assert_eq!(info.beds, 3);
    assert_eq!(info.active_reservations, 1);
}

// ── Storage failures ─────────────────────────────────────────

/// Engine whose WAL writer fails the next `failures` appends and counts
/// every append it is asked for.
fn flaky_engine(failures: Arc<AtomicUsize>, appends: Arc<AtomicUsize>) -> Engine {
    let (wal_tx, mut rx) = mpsc::channel(16);
    tokio::spawn(async move {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                WalCommand::Append { response, .. } => {
                    appends.fetch_add(1, Ordering::SeqCst);
                    let fail = failures
                        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                        .is_ok();
                    let result = if fail {
                        Err(io::Error::other("no space left on device"))
                    } else {
                        Ok(())
                    };
                    let _ = response.send(result);
                }
                WalCommand::Compact { response, .. } => {
                    let _ = response.send(Ok(()));
                }
                WalCommand::AppendsSinceCompact { response } => {
                    let _ = response.send(0);
                }
            }
        }
    });
    Engine {
        apartments: DashMap::new(),
        snapshots: DashMap::new(),
        wal_tx,
        notify: Arc::new(NotifyHub::new()),
        reservation_index: DashMap::new(),
        unit_index: DashMap::new(),
        commit_gate: RwLock::new(()),
    }
}

#[tokio::test]
async fn failing_wal_is_retried_once_then_transient() {
    let failures = Arc::new(AtomicUsize::new(0));
    let appends = Arc::new(AtomicUsize::new(0));
    let engine = flaky_engine(failures.clone(), appends.clone());
    let l = seed(&engine).await;

    failures.store(MAX_COMMIT_ATTEMPTS, Ordering::SeqCst);
    appends.store(0, Ordering::SeqCst);
    let req = bed(&l, l.b1, "h1");
    let err = engine.attempt_reserve(req.clone()).await.unwrap_err();
    assert!(matches!(err, EngineError::Transient(_)), "got {err:?}");
    assert!(err.is_retryable());
    assert_eq!(appends.load(Ordering::SeqCst), MAX_COMMIT_ATTEMPTS);

    // Nothing was applied.
    assert!(engine.get_reservations(l.apt).await.unwrap().is_empty());
    assert!(engine.get_availability(l.apt).unwrap().can_reserve_bed[&l.b1]);
    assert!(engine.get_reservation(req.id).await.is_err());

    // One failure is absorbed by the retry, and the same request id commits.
    failures.store(1, Ordering::SeqCst);
    let r = engine.attempt_reserve(req.clone()).await.unwrap();
    assert_eq!(r.id, req.id);
    assert_eq!(engine.get_reservations(l.apt).await.unwrap().len(), 1);
}

#[tokio::test]
async fn failing_wal_on_cancel_keeps_reservation_active() {
    let failures = Arc::new(AtomicUsize::new(0));
    let engine = flaky_engine(failures.clone(), Arc::new(AtomicUsize::new(0)));
    let l = seed(&engine).await;
    let r = engine.attempt_reserve(room(&l, l.r1, "h1")).await.unwrap();

    failures.store(MAX_COMMIT_ATTEMPTS, Ordering::SeqCst);
    let err = engine.cancel_reservation(r.id).await.unwrap_err();
    assert!(err.is_retryable());
    assert!(engine.get_reservation(r.id).await.unwrap().is_active());
    assert!(!engine.get_availability(l.apt).unwrap().can_reserve_bedroom[&l.r1]);

    engine.cancel_reservation(r.id).await.unwrap();
    assert!(engine.get_availability(l.apt).unwrap().can_reserve_bedroom[&l.r1]);
}

#[test]
fn transient_retry_and_outcome_are_counted() {
    let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();

    metrics::with_local_recorder(&recorder, || {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let failures = Arc::new(AtomicUsize::new(0));
            let engine = flaky_engine(failures.clone(), Arc::new(AtomicUsize::new(0)));
            let l = seed(&engine).await;
            failures.store(MAX_COMMIT_ATTEMPTS, Ordering::SeqCst);
            let err = engine.attempt_reserve(whole(&l, "h1")).await.unwrap_err();
            assert!(matches!(err, EngineError::Transient(_)));
        });
    });

    let rendered = handle.render();
    let retries = format!("{} {}", crate::observability::TRANSIENT_RETRIES_TOTAL, MAX_COMMIT_ATTEMPTS - 1);
    assert!(rendered.contains(&retries), "{rendered}");
    assert!(
        rendered.contains(&format!(
            "{}{{outcome=\"transient\"}} 1",
            crate::observability::RESERVATIONS_TOTAL
        )),
        "{rendered}"
    );
}

// ── Durability ───────────────────────────────────────────────

#[tokio::test]
async fn replay_restores_reservations_and_cancellations() {
    let path = test_wal_path("replay.wal");
    let (l, kept, cancelled, before) = {
        let engine = new_engine(path.clone());
        let l = seed(&engine).await;
        let kept = engine.attempt_reserve(bed(&l, l.b1, "h1")).await.unwrap();
        let cancelled = engine.attempt_reserve(room(&l, l.r2, "h2")).await.unwrap();
        engine.cancel_reservation(cancelled.id).await.unwrap();
        let before = engine.get_availability(l.apt).unwrap();
        (l, kept, cancelled, before)
    };

    let engine = new_engine(path);
    assert_eq!(engine.get_availability(l.apt).unwrap(), before);
    assert_eq!(engine.get_reservation(kept.id).await.unwrap(), kept);
    assert_eq!(
        engine.get_reservation(cancelled.id).await.unwrap().status,
        ReservationStatus::Cancelled
    );
    // Indexes are rebuilt too.
    assert_eq!(engine.apartment_for_unit(&l.b3), Some(l.apt));
    assert_eq!(conflict_reason(engine.attempt_reserve(whole(&l, "h3")).await), ConflictReason::BedTaken);
}

#[tokio::test]
async fn compaction_preserves_state() {
    let path = test_wal_path("compact.wal");
    let (l, before, history) = {
        let engine = new_engine(path.clone());
        let l = seed(&engine).await;
        for i in 0..5 {
            let r = engine.attempt_reserve(bed(&l, l.b2, &format!("churn{i}"))).await.unwrap();
            engine.cancel_reservation(r.id).await.unwrap();
        }
        engine.attempt_reserve(room(&l, l.r2, "h1")).await.unwrap();
        engine.set_capabilities(l.apt, Capabilities { allow_full_reservation: false, ..Capabilities::all() })
            .await
            .unwrap();

        engine.compact_wal().await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        let before = engine.get_availability(l.apt).unwrap();
        let history = engine.get_reservations(l.apt).await.unwrap();
        (l, before, history)
    };

    let engine = new_engine(path);
    assert_eq!(engine.get_availability(l.apt).unwrap(), before);
    assert_eq!(engine.get_reservations(l.apt).await.unwrap(), history);
    assert!(!engine.get_inventory(l.apt).unwrap().capabilities.allow_full_reservation);
}

#[tokio::test]
async fn deleted_apartment_stays_deleted_after_replay() {
    let path = test_wal_path("delete_replay.wal");
    let apt = {
        let engine = new_engine(path.clone());
        let l = seed(&engine).await;
        engine.delete_apartment(l.apt).await.unwrap();
        l.apt
    };
    let engine = new_engine(path);
    assert!(engine.get_apartment(&apt).is_none());
}

#[tokio::test]
async fn create_frame_written_twice_replays_as_one_reservation() {
    let path = test_wal_path("double_create.wal");
    let (l, r) = {
        let engine = new_engine(path.clone());
        let l = seed(&engine).await;
        let r = engine.attempt_reserve(whole(&l, "h1")).await.unwrap();
        (l, r)
    };
    // A retried append whose first attempt reached disk anyway.
    {
        let mut wal = Wal::open(&path).unwrap();
        wal.append(&Event::ReservationCreated {
            id: r.id,
            apartment_id: r.apartment_id,
            granularity: r.granularity,
            target_id: r.target_id,
            holder_id: r.holder_id.clone(),
            created_at: r.created_at,
        })
        .unwrap();
    }

    let engine = new_engine(path);
    assert_eq!(engine.get_reservations(l.apt).await.unwrap().len(), 1);
    assert!(engine.check_integrity(l.apt).unwrap().is_empty());

    engine.cancel_reservation(r.id).await.unwrap();
    let view = engine.get_availability(l.apt).unwrap();
    assert!(!view.is_apartment_locked);
    assert!(view.apartment_reservable);
    engine.attempt_reserve(whole(&l, "h2")).await.unwrap();
}

// ── Integrity ────────────────────────────────────────────────

#[tokio::test]
async fn overlapping_claims_in_storage_are_reported_and_block() {
    let path = test_wal_path("integrity.wal");
    let apt = Ulid::new();
    let r1 = Ulid::new();
    let b1 = Ulid::new();
    let bedroom_res = Ulid::new();
    let bed_res = Ulid::new();
    {
        // Write a history the engine itself would never produce.
        let mut wal = Wal::open(&path).unwrap();
        let events = [
            Event::ApartmentCreated {
                id: apt,
                name: None,
                max_capacity: 2,
                enabled_capacities: vec![2],
                capabilities: Capabilities::all(),
            },
            Event::BedroomAdded {
                id: r1,
                apartment_id: apt,
                base_capacity: 2,
                max_capacity: 2,
                allow_extra_beds: false,
                pricing_mode: PricingMode::Both,
            },
            Event::BedAdded {
                id: b1,
                apartment_id: apt,
                bedroom_id: r1,
                label: "B1".into(),
                bed_type: None,
                monthly_price: 1,
                deposit: 1,
                capacity: 1,
            },
            Event::ReservationCreated {
                id: bedroom_res,
                apartment_id: apt,
                granularity: Granularity::Bedroom,
                target_id: r1,
                holder_id: "a".into(),
                created_at: 1,
            },
            Event::ReservationCreated {
                id: bed_res,
                apartment_id: apt,
                granularity: Granularity::Bed,
                target_id: b1,
                holder_id: "b".into(),
                created_at: 2,
            },
        ];
        for e in &events {
            wal.append(e).unwrap();
        }
    }

    let engine = new_engine(path);
    let mut all = engine.notify.subscribe_all();

    let violations = engine.check_integrity(apt).unwrap();
    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0].kind, IntegrityKind::BedroomAndBed);
    let mut ids = violations[0].reservation_ids.clone();
    ids.sort();
    let mut expected = vec![bedroom_res, bed_res];
    expected.sort();
    assert_eq!(ids, expected);

    match all.recv().await.unwrap() {
        DomainEvent::IntegrityWarning { apartment_id, kind, .. } => {
            assert_eq!(apartment_id, apt);
            assert_eq!(kind, IntegrityKind::BedroomAndBed);
        }
        other => panic!("expected integrity warning, got {other:?}"),
    }

    // Both sides stay blocked; nothing is auto-repaired.
    let view = engine.get_availability(apt).unwrap();
    assert_eq!(view.can_reserve_bed[&b1], false);
    assert_eq!(view.can_reserve_bedroom[&r1], false);
    assert!(!view.apartment_reservable);
    assert_eq!(engine.get_reservations(apt).await.unwrap().len(), 2);
}

// ── Notifications ────────────────────────────────────────────

#[tokio::test]
async fn subscribing_to_unknown_apartment_is_rejected() {
    let engine = new_engine(test_wal_path("subscribe_unknown.wal"));
    let missing = Ulid::new();
    assert!(matches!(engine.subscribe(missing), Err(EngineError::NotFound(id)) if id == missing));
    assert_eq!(engine.notify.channel_count(), 0);
}

#[tokio::test]
async fn committed_reservation_is_announced() {
    let engine = new_engine(test_wal_path("announce.wal"));
    let l = seed(&engine).await;
    let mut rx = engine.subscribe(l.apt).unwrap();

    let r = engine.attempt_reserve(room(&l, l.r1, "tenant-9")).await.unwrap();
    let event = rx.recv().await.unwrap();
    assert_eq!(
        event,
        DomainEvent::ReservationCreated {
            reservation_id: r.id,
            apartment_id: l.apt,
            granularity: Granularity::Bedroom,
            target_id: l.r1,
            holder_id: "tenant-9".into(),
        }
    );
    assert!(event.to_json().unwrap().contains("\"type\":\"reservation_created\""));

    // Rejected attempts announce nothing.
    let _ = engine.attempt_reserve(bed(&l, l.b1, "late")).await;
    assert!(rx.try_recv().is_err());
}
