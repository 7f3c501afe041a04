use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::clock::Clock;
use crate::engine::Engine;
use crate::store::SlotStore;

const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Background task that periodically removes expired holds. Expired holds are
/// already free for new holds; this only reclaims their storage.
pub async fn run_reaper(store: Arc<dyn SlotStore>, clock: Arc<dyn Clock>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        reap_once(store.as_ref(), clock.as_ref()).await;
    }
}

/// One pass. Returns the number of holds removed; a storage fault is logged and retried next tick.
pub async fn reap_once(store: &dyn SlotStore, clock: &dyn Clock) -> usize {
    match store.reclaim_expired(clock.now_ms()).await {
        Ok(0) => 0,
        Ok(n) => {
            info!("reaped {n} expired holds");
            metrics::counter!(crate::observability::HOLDS_REAPED_TOTAL).increment(n as u64);
            n
        }
        Err(e) => {
            tracing::warn!("reaper pass failed: {e}");
            0
        }
    }
}

/// Background task that rewrites the WAL once enough appends have piled up.
pub async fn run_compactor(engine: Arc<Engine>, clock: Arc<dyn Clock>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    loop {
        interval.tick().await;
        metrics::gauge!(crate::observability::DAYS_ACTIVE).set(engine.day_count() as f64);
        compact_if_needed(&engine, clock.as_ref(), threshold).await;
    }
}

/// Returns whether a compaction ran.
pub async fn compact_if_needed(engine: &Engine, clock: &dyn Clock, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match engine.compact_wal(clock.now_ms()).await {
        Ok(()) => {
            info!("compacted WAL after {appends} appends");
            metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL).increment(1);
            true
        }
        Err(e) => {
            tracing::error!("WAL compaction failed: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::model::*;
    use std::path::PathBuf;

    const T0: Ms = 1_741_939_200_000;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("ridehold_test_reaper");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn slot(time: &str) -> Slot {
        Slot::new("joy", Some("2025-03-14"), Some(time))
    }

    #[tokio::test]
    async fn reaper_removes_expired_holds_but_not_bookings() {
        let engine = Arc::new(Engine::new(test_wal_path("reaper_collect.wal")).unwrap());
        let clock = ManualClock::new(T0);

        engine.try_hold(slot("09:00"), 1, T0).await.unwrap();
        engine.try_hold(slot("10:00"), 1, T0).await.unwrap();
        engine.promote(&slot("10:00"), T0).await.unwrap();

        assert_eq!(reap_once(engine.as_ref(), &clock).await, 0);

        clock.advance_minutes(2);
        assert_eq!(engine.collect_expired_holds(clock.now_ms()).len(), 1);
        assert_eq!(reap_once(engine.as_ref(), &clock).await, 1);
        assert!(engine.collect_expired_holds(clock.now_ms()).is_empty());

        let live = engine.live_records("joy", "2025-03-14", clock.now_ms()).await;
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].status, SlotStatus::Booked);
    }

    #[tokio::test]
    async fn compactor_waits_for_threshold() {
        let engine = Engine::new(test_wal_path("compactor_threshold.wal")).unwrap();
        let clock = ManualClock::new(T0);

        engine.try_hold(slot("09:00"), 20, T0).await.unwrap();
        engine.try_hold(slot("09:15"), 20, T0).await.unwrap();
        assert!(!compact_if_needed(&engine, &clock, 3).await);

        engine.try_hold(slot("09:30"), 20, T0).await.unwrap();
        assert!(compact_if_needed(&engine, &clock, 3).await);
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        assert_eq!(engine.live_records("joy", "2025-03-14", T0).await.len(), 3);
    }
}
