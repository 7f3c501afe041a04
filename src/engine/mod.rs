mod availability;
mod duration;
mod error;
mod mutations;
mod queries;
#[cfg(test)]
mod tests;

pub use availability::{
    available_starts, blocked_intervals, canonical_date, canonical_time, format_hhmm,
    merge_overlapping, parse_hhmm, validate_date, validate_time, SlotPolicy,
};
pub use duration::{fallback_duration, resolve_duration, DEFAULT_DURATION_MINUTES, FALLBACK_DURATIONS};
pub use error::EngineError;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};

use crate::model::*;
use crate::wal::Wal;

pub type SharedDayState = Arc<RwLock<DayState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush what we have before touching the file again.
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                commit_batch(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush failed for batch of {}: {e}", batch.len());
    }
    respond_batch(batch, &result);
}

fn flush_batch(wal: &mut Wal, batch: &mut [(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            // Every caller hears about the failure, so none of the batch may survive on disk.
            if let Err(cut) = wal.rollback() {
                tracing::error!("WAL rollback failed: {cut}");
            }
            return Err(e);
        }
    }
    wal.flush_sync()
}

fn respond_batch(batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let mut batch = vec![(event, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

/// The slot reservation store: per-(ride, date) state behind async locks,
/// every mutation made durable in the WAL before it is applied.
pub struct Engine {
    pub(super) days: DashMap<DayKey, SharedDayState>,
    pub(super) rides: DashMap<String, Minutes>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Read-held by every mutation, write-held by compaction. Lock order: gate, then day.
    pub(super) commit_gate: RwLock<()>,
    /// Serializes catalog writes so WAL order matches map order.
    pub(super) catalog_lock: Mutex<()>,
}

/// Apply a reservation event to its day. Caller holds the day lock.
pub(super) fn apply_to_day(day: &mut DayState, event: &Event) {
    match event {
        Event::HoldPlaced {
            id,
            slot,
            expires_at,
            created_at,
        } => {
            day.slots.insert(
                slot.time_key().to_string(),
                SlotRecord {
                    id: *id,
                    slot: slot.clone(),
                    status: SlotStatus::Hold {
                        expires_at: *expires_at,
                    },
                    created_at: *created_at,
                },
            );
        }
        Event::HoldPromoted { slot } => {
            if let Some(record) = day.slots.get_mut(slot.time_key()) {
                record.status = SlotStatus::Booked;
            }
        }
        Event::HoldExpired { id, slot } => {
            let same_hold = day
                .slots
                .get(slot.time_key())
                .is_some_and(|r| r.id == *id && r.status != SlotStatus::Booked);
            if same_hold {
                day.slots.remove(slot.time_key());
            }
        }
        // Catalog events never reach a day.
        Event::RideConfigured { .. } => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let events = Wal::recover(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        // Rebuild into plain maps first; nothing else can see the state yet.
        let mut days: HashMap<DayKey, DayState> = HashMap::new();
        let rides = DashMap::new();
        for event in &events {
            match event {
                Event::RideConfigured {
                    ride_id,
                    duration_minutes,
                } => {
                    rides.insert(ride_id.clone(), *duration_minutes);
                }
                Event::HoldPlaced { slot, .. } => {
                    let key = slot.day();
                    let day = days.entry(key.clone()).or_insert_with(|| DayState::new(key));
                    apply_to_day(day, event);
                }
                Event::HoldPromoted { slot } | Event::HoldExpired { slot, .. } => {
                    if let Some(day) = days.get_mut(&slot.day()) {
                        apply_to_day(day, event);
                    }
                }
            }
        }

        let state = DashMap::new();
        for (key, day) in days {
            if !day.slots.is_empty() {
                state.insert(key, Arc::new(RwLock::new(day)));
            }
        }

        tracing::debug!(
            "replayed {} events from {}: {} days, {} rides",
            events.len(),
            wal_path.display(),
            state.len(),
            rides.len()
        );

        Ok(Self {
            days: state,
            rides,
            wal_tx,
            commit_gate: RwLock::new(()),
            catalog_lock: Mutex::new(()),
        })
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_day(&self, key: &DayKey) -> Option<SharedDayState> {
        self.days.get(key).map(|e| e.value().clone())
    }

    /// The day's state, created empty on first use.
    pub(super) fn day_or_create(&self, key: DayKey) -> SharedDayState {
        self.days
            .entry(key.clone())
            .or_insert_with(|| Arc::new(RwLock::new(DayState::new(key))))
            .value()
            .clone()
    }

    /// WAL-append then apply. Nothing is applied if the append fails.
    pub(super) async fn persist_and_apply(
        &self,
        day: &mut DayState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_day(day, event);
        Ok(())
    }
}
