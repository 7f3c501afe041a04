use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::{Clock, SystemClock};
use crate::coordinator::Coordinator;
use crate::engine::Engine;
use crate::ledger::InMemoryLedger;
use crate::reaper;

/// Everything a connection needs: the store, the ledger mirror and the
/// coordinator wired over both. One per server process.
pub struct RideHoldService {
    pub engine: Arc<Engine>,
    pub ledger: Arc<InMemoryLedger>,
    pub coordinator: Coordinator,
    clock: Arc<dyn Clock>,
}

impl RideHoldService {
    pub fn open(wal_path: PathBuf, hold_ttl_minutes: u32) -> std::io::Result<Self> {
        Self::open_with_clock(wal_path, hold_ttl_minutes, Arc::new(SystemClock))
    }

    pub fn open_with_clock(
        wal_path: PathBuf,
        hold_ttl_minutes: u32,
        clock: Arc<dyn Clock>,
    ) -> std::io::Result<Self> {
        let engine = Arc::new(Engine::new(wal_path)?);
        let ledger = Arc::new(InMemoryLedger::new());
        let coordinator = Coordinator::for_engine(engine.clone())
            .with_ledger(ledger.clone())
            .with_clock(clock.clone())
            .with_default_ttl(hold_ttl_minutes);
        Ok(Self {
            engine,
            ledger,
            coordinator,
            clock,
        })
    }

    /// Spawn the reaper and the compactor.
    pub fn start_background(&self, reap_interval: Duration, compact_threshold: u64) {
        let store = self.engine.clone();
        let clock = self.clock.clone();
        tokio::spawn(async move {
            reaper::run_reaper(store, clock, reap_interval).await;
        });

        let compactor_engine = self.engine.clone();
        let clock = self.clock.clone();
        tokio::spawn(async move {
            reaper::run_compactor(compactor_engine, clock, compact_threshold).await;
        });
    }
}
