use super::*;
use crate::limits::*;

const M: Ms = 60_000; // 1 minute in ms
const T0: Ms = 1_741_939_200_000;
const DAY: &str = "2025-03-14";

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("ridehold_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn slot(ride: &str, time: &str) -> Slot {
    Slot::new(ride, Some(DAY), Some(time))
}

// ── Holds ────────────────────────────────────────────────

#[tokio::test]
async fn hold_on_free_slot_succeeds() {
    let engine = Engine::new(test_wal_path("hold_free.wal")).unwrap();
    let record = engine.try_hold(slot("60-1", "10:00"), 20, T0).await.unwrap();

    assert_eq!(record.key(), "60-1|2025-03-14|10:00");
    assert_eq!(record.status, SlotStatus::Hold { expires_at: T0 + 20 * M });
    assert_eq!(record.created_at, T0);

    let live = engine.live_records("60-1", DAY, T0).await;
    assert_eq!(live, vec![record]);
}

#[tokio::test]
async fn second_hold_on_live_slot_conflicts() {
    let engine = Engine::new(test_wal_path("hold_conflict.wal")).unwrap();
    engine.try_hold(slot("60-1", "10:00"), 20, T0).await.unwrap();

    let err = engine.try_hold(slot("60-1", "10:00"), 20, T0 + M).await.unwrap_err();
    assert_eq!(err, EngineError::Conflict("60-1|2025-03-14|10:00".into()));
}

#[tokio::test]
async fn different_times_and_rides_do_not_conflict() {
    let engine = Engine::new(test_wal_path("hold_independent.wal")).unwrap();
    engine.try_hold(slot("60-1", "10:00"), 20, T0).await.unwrap();
    engine.try_hold(slot("60-1", "10:15"), 20, T0).await.unwrap();
    engine.try_hold(slot("60-2", "10:00"), 20, T0).await.unwrap();
    engine
        .try_hold(Slot::new("60-1", Some("2025-03-15"), Some("10:00")), 20, T0)
        .await
        .unwrap();

    assert_eq!(engine.live_records("60-1", DAY, T0).await.len(), 2);
    assert_eq!(engine.day_count(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_holds_on_one_slot_have_exactly_one_winner() {
    let engine = Arc::new(Engine::new(test_wal_path("hold_race.wal")).unwrap());

    let n = 32;
    let mut handles = Vec::new();
    for _ in 0..n {
        let eng = engine.clone();
        handles.push(tokio::spawn(async move {
            eng.try_hold(slot("joy", "09:00"), 20, T0).await
        }));
    }

    let mut wins = 0;
    let mut conflicts = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => wins += 1,
            Err(EngineError::Conflict(_)) => conflicts += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(wins, 1);
    assert_eq!(conflicts, n - 1);
    assert_eq!(engine.live_records("joy", DAY, T0).await.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_holds_on_an_expired_slot_have_exactly_one_winner() {
    let engine = Arc::new(Engine::new(test_wal_path("hold_race_expired.wal")).unwrap());
    engine.try_hold(slot("joy", "09:00"), 1, T0).await.unwrap();
    let later = T0 + 5 * M;

    let mut handles = Vec::new();
    for _ in 0..16 {
        let eng = engine.clone();
        handles.push(tokio::spawn(async move {
            eng.try_hold(slot("joy", "09:00"), 20, later).await
        }));
    }
    let mut wins = 0;
    for h in handles {
        if h.await.unwrap().is_ok() {
            wins += 1;
        }
    }
    assert_eq!(wins, 1);
}

#[tokio::test]
async fn expired_hold_is_free_without_release() {
    let engine = Engine::new(test_wal_path("hold_expiry.wal")).unwrap();
    let first = engine.try_hold(slot("joy", "09:00"), 1, T0).await.unwrap();

    // Still held a millisecond before expiry.
    assert!(engine.try_hold(slot("joy", "09:00"), 1, T0 + M - 1).await.is_err());
    assert!(engine.live_records("joy", DAY, T0 + M).await.is_empty());

    let second = engine.try_hold(slot("joy", "09:00"), 1, T0 + M).await.unwrap();
    assert_ne!(first.id, second.id);
}

#[tokio::test]
async fn zero_ttl_is_raised_to_one_minute() {
    let engine = Engine::new(test_wal_path("hold_zero_ttl.wal")).unwrap();
    let record = engine.try_hold(slot("joy", "09:00"), 0, T0).await.unwrap();
    assert_eq!(record.hold_expires_at(), Some(T0 + M));
}

#[tokio::test]
async fn hold_limits() {
    let engine = Engine::new(test_wal_path("hold_limits.wal")).unwrap();
    assert!(matches!(
        engine.try_hold(slot("joy", "09:00"), MAX_HOLD_TTL_MINUTES + 1, T0).await,
        Err(EngineError::LimitExceeded(_))
    ));
    assert!(matches!(
        engine.try_hold(slot(&"r".repeat(MAX_RIDE_ID_LEN + 1), "09:00"), 20, T0).await,
        Err(EngineError::InvalidInput(_)) | Err(EngineError::LimitExceeded(_))
    ));
    assert!(matches!(
        engine.try_hold(slot("", "09:00"), 20, T0).await,
        Err(EngineError::InvalidInput(_))
    ));
}

// ── Promotion ────────────────────────────────────────────

#[tokio::test]
async fn promotion_is_terminal() {
    let engine = Engine::new(test_wal_path("promote_terminal.wal")).unwrap();
    engine.try_hold(slot("group", "13:00"), 1, T0).await.unwrap();
    assert_eq!(engine.promote(&slot("group", "13:00"), T0).await.unwrap(), Promotion::Promoted);

    // Long after the hold would have expired, the slot is still taken.
    let much_later = T0 + 365 * 24 * 60 * M;
    assert!(matches!(
        engine.try_hold(slot("group", "13:00"), 20, much_later).await,
        Err(EngineError::Conflict(_))
    ));
    let live = engine.live_records("group", DAY, much_later).await;
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].status, SlotStatus::Booked);
}

#[tokio::test]
async fn promotion_is_idempotent() {
    let engine = Engine::new(test_wal_path("promote_idempotent.wal")).unwrap();
    engine.try_hold(slot("joy", "09:00"), 20, T0).await.unwrap();

    assert_eq!(engine.promote(&slot("joy", "09:00"), T0).await.unwrap(), Promotion::Promoted);
    assert_eq!(
        engine.promote(&slot("joy", "09:00"), T0 + M).await.unwrap(),
        Promotion::AlreadyBooked
    );
    assert_eq!(engine.wal_appends_since_compact().await, 2);
}

#[tokio::test]
async fn promoting_an_expired_hold_is_lost() {
    let engine = Engine::new(test_wal_path("promote_expired.wal")).unwrap();
    engine.try_hold(slot("joy", "09:00"), 1, T0).await.unwrap();

    let err = engine.promote(&slot("joy", "09:00"), T0 + M).await.unwrap_err();
    assert_eq!(err, EngineError::HoldLost("joy|2025-03-14|09:00".into()));
    assert!(engine.live_records("joy", DAY, T0 + M).await.is_empty());
}

#[tokio::test]
async fn promoting_an_absent_key_is_lost() {
    let engine = Engine::new(test_wal_path("promote_absent.wal")).unwrap();
    assert!(matches!(
        engine.promote(&slot("joy", "09:00"), T0).await,
        Err(EngineError::HoldLost(_))
    ));
}

// ── Reclamation ──────────────────────────────────────────

#[tokio::test]
async fn reclaim_removes_expired_holds_only() {
    let engine = Engine::new(test_wal_path("reclaim.wal")).unwrap();
    engine.try_hold(slot("joy", "09:00"), 1, T0).await.unwrap();
    engine.try_hold(slot("joy", "10:00"), 60, T0).await.unwrap();
    engine.try_hold(slot("joy", "11:00"), 1, T0).await.unwrap();
    engine.promote(&slot("joy", "11:00"), T0).await.unwrap();

    let later = T0 + 5 * M;
    assert_eq!(engine.collect_expired_holds(later).len(), 1);
    assert_eq!(engine.reclaim_expired(later).await.unwrap(), 1);
    assert!(engine.collect_expired_holds(later).is_empty());

    let day = engine.get_day(&DayKey::new("joy", DAY)).unwrap();
    let guard = day.read().await;
    let times: Vec<&str> = guard.slots.keys().map(String::as_str).collect();
    assert_eq!(times, vec!["10:00", "11:00"]);
}

#[tokio::test]
async fn reclaim_never_touches_a_rehold() {
    let engine = Engine::new(test_wal_path("reclaim_rehold.wal")).unwrap();
    let old = engine.try_hold(slot("joy", "09:00"), 1, T0).await.unwrap();
    let fresh = engine.try_hold(slot("joy", "09:00"), 20, T0 + 2 * M).await.unwrap();

    // The reaper observed the old hold before it was replaced.
    assert!(!engine.reclaim_hold(old.id, &old.slot, T0 + 3 * M).await.unwrap());
    let live = engine.live_records("joy", DAY, T0 + 3 * M).await;
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].id, fresh.id);
}

#[tokio::test]
async fn reclaim_drops_empty_days() {
    let engine = Engine::new(test_wal_path("reclaim_prune.wal")).unwrap();
    engine.try_hold(slot("joy", "09:00"), 1, T0).await.unwrap();
    assert_eq!(engine.day_count(), 1);

    engine.reclaim_expired(T0 + M).await.unwrap();
    assert_eq!(engine.day_count(), 0);

    // The day comes back on the next hold.
    engine.try_hold(slot("joy", "09:00"), 1, T0 + M).await.unwrap();
    assert_eq!(engine.day_count(), 1);
}

// ── Catalog ──────────────────────────────────────────────

#[tokio::test]
async fn configure_and_list_rides() {
    let engine = Engine::new(test_wal_path("rides.wal")).unwrap();
    engine.configure_ride("joy", 15).await.unwrap();
    engine.configure_ride("group", 150).await.unwrap();
    engine.configure_ride("joy", 12).await.unwrap();

    let rides = engine.list_rides();
    assert_eq!(
        rides,
        vec![
            RideInfo { ride_id: "group".into(), duration_minutes: 150 },
            RideInfo { ride_id: "joy".into(), duration_minutes: 12 },
        ]
    );
    assert_eq!(engine.configured_duration("joy"), Some(12));
    assert_eq!(engine.configured_duration("60-1"), None);
}

#[tokio::test]
async fn configure_ride_validates() {
    let engine = Engine::new(test_wal_path("rides_invalid.wal")).unwrap();
    assert!(matches!(engine.configure_ride("joy", 0).await, Err(EngineError::InvalidInput(_))));
    assert!(matches!(
        engine.configure_ride("joy", MAX_DURATION_MINUTES + 1).await,
        Err(EngineError::InvalidInput(_))
    ));
    assert!(matches!(engine.configure_ride(" ", 30).await, Err(EngineError::InvalidInput(_))));
    assert!(engine.list_rides().is_empty());
}

// ── Durability ───────────────────────────────────────────

#[tokio::test]
async fn replay_restores_holds_bookings_and_rides() {
    let path = test_wal_path("replay.wal");
    let (held, booked) = {
        let engine = Engine::new(path.clone()).unwrap();
        engine.configure_ride("joy", 15).await.unwrap();
        let held = engine.try_hold(slot("joy", "09:00"), 20, T0).await.unwrap();
        engine.try_hold(slot("joy", "10:00"), 20, T0).await.unwrap();
        engine.promote(&slot("joy", "10:00"), T0).await.unwrap();
        engine.try_hold(slot("joy", "11:00"), 1, T0).await.unwrap();
        engine.reclaim_expired(T0 + M).await.unwrap();
        let booked = engine.live_records("joy", DAY, T0 + M).await[1].clone();
        (held, booked)
    };

    let engine = Engine::new(path).unwrap();
    assert_eq!(engine.configured_duration("joy"), Some(15));
    let live = engine.live_records("joy", DAY, T0 + M).await;
    assert_eq!(live, vec![held, booked]);
    assert!(matches!(
        engine.try_hold(slot("joy", "10:00"), 20, T0 + M).await,
        Err(EngineError::Conflict(_))
    ));
    engine.try_hold(slot("joy", "11:00"), 20, T0 + M).await.unwrap();
}

#[tokio::test]
async fn bookings_made_after_a_torn_tail_survive_the_next_restart() {
    use std::io::Write;

    let path = test_wal_path("torn_tail.wal");
    {
        let engine = Engine::new(path.clone()).unwrap();
        engine.try_hold(slot("joy", "09:00"), 20, T0).await.unwrap();
        engine.promote(&slot("joy", "09:00"), T0).await.unwrap();
    }
    {
        // Crash in the middle of writing a frame header.
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&[40, 0]).unwrap();
    }
    {
        let engine = Engine::new(path.clone()).unwrap();
        engine.try_hold(slot("joy", "10:00"), 20, T0).await.unwrap();
        assert_eq!(
            engine.promote(&slot("joy", "10:00"), T0).await.unwrap(),
            Promotion::Promoted
        );
    }

    let engine = Engine::new(path).unwrap();
    for time in ["09:00", "10:00"] {
        assert!(matches!(
            engine.try_hold(slot("joy", time), 20, T0 + M).await,
            Err(EngineError::Conflict(_))
        ));
    }
    let live = engine.live_records("joy", DAY, T0 + M).await;
    assert_eq!(live.len(), 2);
    assert!(live.iter().all(|r| r.status == SlotStatus::Booked));
}

#[tokio::test]
async fn group_commit_batches_appends() {
    let path = test_wal_path("group_commit_batch.wal");
    let engine = Arc::new(Engine::new(path.clone()).unwrap());

    let n = 20;
    let mut handles = Vec::new();
    for i in 0..n {
        let eng = engine.clone();
        handles.push(tokio::spawn(async move {
            let time = format!("{:02}:{:02}", 8 + i / 4, (i % 4) * 15);
            eng.try_hold(slot("60-1", &time), 20, T0).await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }
    assert_eq!(engine.live_records("60-1", DAY, T0).await.len(), n);

    let engine2 = Engine::new(path).unwrap();
    assert_eq!(engine2.live_records("60-1", DAY, T0).await.len(), n);
}

#[tokio::test]
async fn compaction_keeps_live_state_and_drops_expired_holds() {
    let path = test_wal_path("compact.wal");
    {
        let engine = Engine::new(path.clone()).unwrap();
        engine.configure_ride("joy", 15).await.unwrap();
        for i in 0..10 {
            let time = format!("09:{:02}", i);
            engine.try_hold(slot("joy", &time), 1, T0).await.unwrap();
        }
        engine.try_hold(slot("joy", "10:00"), 60, T0).await.unwrap();
        engine.try_hold(slot("joy", "11:00"), 1, T0).await.unwrap();
        engine.promote(&slot("joy", "11:00"), T0).await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 14);

        engine.compact_wal(T0 + 5 * M).await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 0);

        engine.try_hold(slot("joy", "12:00"), 60, T0 + 5 * M).await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 1);
    }

    let events = crate::wal::Wal::replay(&path).unwrap();
    // ride + held 10:00 + booked 11:00 (placed, promoted) + post-compaction hold
    assert_eq!(events.len(), 5);

    let engine = Engine::new(path).unwrap();
    assert_eq!(engine.configured_duration("joy"), Some(15));
    let live = engine.live_records("joy", DAY, T0 + 5 * M).await;
    let times: Vec<&str> = live.iter().map(|r| r.slot.time_key()).collect();
    assert_eq!(times, vec!["10:00", "11:00", "12:00"]);
    assert_eq!(live[1].status, SlotStatus::Booked);
}
