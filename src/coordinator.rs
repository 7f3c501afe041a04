use std::sync::Arc;

use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};
use crate::engine::{
    available_starts, blocked_intervals, canonical_date, canonical_time, resolve_duration, Engine,
    EngineError, SlotPolicy,
};
use crate::ledger::{BookingLedger, NoLedger};
use crate::limits::MAX_RIDE_ID_LEN;
use crate::model::*;
use crate::observability;
use crate::store::{RideCatalog, SlotStore};

pub const DEFAULT_HOLD_TTL_MINUTES: u32 = 20;

/// Check availability, place holds, finalize bookings.
///
/// Availability is an advisory snapshot; the authority on who gets a slot is
/// the store's atomic `try_hold`.
pub struct Coordinator {
    store: Arc<dyn SlotStore>,
    catalog: Arc<dyn RideCatalog>,
    ledger: Arc<dyn BookingLedger>,
    clock: Arc<dyn Clock>,
    policy: SlotPolicy,
    default_ttl_minutes: u32,
}

fn check_ride_id(ride_id: &str) -> Result<(), EngineError> {
    if ride_id.trim().is_empty() {
        return Err(EngineError::InvalidInput("ride_id must not be empty".into()));
    }
    if ride_id.len() > MAX_RIDE_ID_LEN {
        return Err(EngineError::LimitExceeded("ride_id too long"));
    }
    Ok(())
}

/// The slot in canonical spelling, so `9:00` and `09:00` share one key.
/// Date and time are optional, but when given they must be well formed.
fn canonical_slot(ride_id: &str, date: Option<&str>, time: Option<&str>) -> Result<Slot, EngineError> {
    check_ride_id(ride_id)?;
    Ok(Slot {
        ride_id: ride_id.to_string(),
        date: date.map(canonical_date).transpose()?,
        time: time.map(canonical_time).transpose()?,
    })
}

impl Coordinator {
    pub fn new(store: Arc<dyn SlotStore>, catalog: Arc<dyn RideCatalog>) -> Self {
        Self {
            store,
            catalog,
            ledger: Arc::new(NoLedger),
            clock: Arc::new(SystemClock),
            policy: SlotPolicy::default(),
            default_ttl_minutes: DEFAULT_HOLD_TTL_MINUTES,
        }
    }

    pub fn for_engine(engine: Arc<Engine>) -> Self {
        Self::new(engine.clone(), engine)
    }

    pub fn with_ledger(mut self, ledger: Arc<dyn BookingLedger>) -> Self {
        self.ledger = ledger;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_policy(mut self, policy: SlotPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_default_ttl(mut self, minutes: u32) -> Self {
        self.default_ttl_minutes = minutes;
        self
    }

    pub fn now_ms(&self) -> Ms {
        self.clock.now_ms()
    }

    pub fn resolve_duration(&self, ride_id: &str) -> Minutes {
        resolve_duration(self.catalog.as_ref(), ride_id)
    }

    /// Unavailable intervals for `(ride_id, date)`: live reservations plus active
    /// ledger bookings, each padded by the buffer. A source that fails
    /// contributes nothing.
    pub async fn blocked_intervals(&self, ride_id: &str, date: &str) -> Result<Vec<Span>, EngineError> {
        check_ride_id(ride_id)?;
        let date = canonical_date(date)?;
        let duration = self.resolve_duration(ride_id);
        Ok(self.collect_blocks(ride_id, &date, duration).await)
    }

    async fn collect_blocks(&self, ride_id: &str, date: &str, duration: Minutes) -> Vec<Span> {
        let now = self.clock.now_ms();
        let buffer = self.policy.buffer;

        let mut blocked = match self.store.live_records(ride_id, date, now).await {
            Ok(records) => blocked_intervals(
                records.iter().filter_map(|r| r.slot.time.as_deref()),
                duration,
                buffer,
            ),
            Err(e) => {
                warn!("reservation source unavailable for {ride_id} on {date}: {e}");
                metrics::counter!(observability::AVAILABILITY_DEGRADED_TOTAL, "source" => "reservations")
                    .increment(1);
                Vec::new()
            }
        };

        match self.ledger.bookings_for(ride_id, date).await {
            Ok(bookings) => blocked.extend(blocked_intervals(
                bookings
                    .iter()
                    .filter(|b| b.is_active())
                    .filter_map(|b| b.time.as_deref()),
                duration,
                buffer,
            )),
            Err(e) => {
                warn!("booking ledger unavailable for {ride_id} on {date}: {e}");
                metrics::counter!(observability::AVAILABILITY_DEGRADED_TOTAL, "source" => "ledger")
                    .increment(1);
            }
        }

        blocked
    }

    /// Free start times for the ride on the date, ascending `HH:MM`. Read-only.
    pub async fn check_availability(&self, ride_id: &str, date: &str) -> Result<Vec<String>, EngineError> {
        check_ride_id(ride_id)?;
        let date = canonical_date(date)?;
        let duration = self.resolve_duration(ride_id);
        let blocked = self.collect_blocks(ride_id, &date, duration).await;
        Ok(available_starts(&blocked, duration, &self.policy))
    }

    /// Claim a slot for `ttl_minutes` (default applies when `None`).
    /// `Conflict` means someone else holds or booked it; re-query availability.
    pub async fn place_hold(
        &self,
        ride_id: &str,
        date: Option<&str>,
        time: Option<&str>,
        ttl_minutes: Option<u32>,
    ) -> Result<SlotRecord, EngineError> {
        let slot = canonical_slot(ride_id, date, time)?;
        let ttl = ttl_minutes.unwrap_or(self.default_ttl_minutes);
        let now = self.clock.now_ms();
        match self.store.try_hold(slot, ttl, now).await {
            Ok(record) => {
                metrics::counter!(observability::HOLDS_PLACED_TOTAL).increment(1);
                debug!("hold {} placed on {}", record.id, record.key());
                Ok(record)
            }
            Err(EngineError::Conflict(key)) => {
                metrics::counter!(observability::HOLD_CONFLICTS_TOTAL).increment(1);
                debug!("hold conflict on {key}");
                Err(EngineError::Conflict(key))
            }
            Err(e) => Err(e),
        }
    }

    /// Promote the hold to booked after payment. A hold that expired first is
    /// reported as `HoldLost` and left for the caller to refund or rebook.
    pub async fn finalize_booking(
        &self,
        ride_id: &str,
        date: Option<&str>,
        time: Option<&str>,
    ) -> Result<Promotion, EngineError> {
        let slot = canonical_slot(ride_id, date, time)?;
        let now = self.clock.now_ms();
        match self.store.promote(&slot, now).await {
            Ok(promotion) => {
                if promotion == Promotion::Promoted {
                    metrics::counter!(observability::BOOKINGS_FINALIZED_TOTAL).increment(1);
                }
                Ok(promotion)
            }
            Err(EngineError::HoldLost(key)) => {
                metrics::counter!(observability::HOLDS_LOST_TOTAL).increment(1);
                warn!("booking finalized without a live hold on {key}; slot is not guaranteed");
                Err(EngineError::HoldLost(key))
            }
            Err(e) => Err(e),
        }
    }

    /// Live reservation records, for inspection.
    pub async fn live_records(&self, ride_id: &str, date: &str) -> Result<Vec<SlotRecord>, EngineError> {
        check_ride_id(ride_id)?;
        let date = canonical_date(date)?;
        self.store.live_records(ride_id, &date, self.clock.now_ms()).await
    }

    /// One reclamation pass over expired holds.
    pub async fn reclaim_expired(&self) -> Result<usize, EngineError> {
        self.store.reclaim_expired(self.clock.now_ms()).await
    }
}
