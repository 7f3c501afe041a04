use async_trait::async_trait;
use dashmap::DashMap;

use crate::engine::{canonical_date, canonical_time, EngineError};
use crate::limits::*;
use crate::model::{DayKey, Slot};

/// Booking statuses that keep a slot blocked regardless of the reservation record.
pub const ACTIVE_BOOKING_STATUSES: &[&str] = &["approved", "processing", "created"];

/// A booking as the wider booking workflow sees it. Its status is independent
/// of the reservation status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRecord {
    pub ride_id: String,
    pub date: Option<String>,
    pub time: Option<String>,
    pub status: String,
}

impl BookingRecord {
    pub fn slot(&self) -> Slot {
        Slot::new(self.ride_id.as_str(), self.date.as_deref(), self.time.as_deref())
    }

    pub fn is_active(&self) -> bool {
        ACTIVE_BOOKING_STATUSES
            .iter()
            .any(|s| s.eq_ignore_ascii_case(self.status.trim()))
    }
}

/// Secondary source of blocks: booking records that may exist without a live reservation.
#[async_trait]
pub trait BookingLedger: Send + Sync {
    async fn bookings_for(&self, ride_id: &str, date: &str) -> Result<Vec<BookingRecord>, EngineError>;
}

/// Ledger with nothing in it.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoLedger;

#[async_trait]
impl BookingLedger for NoLedger {
    async fn bookings_for(&self, _ride_id: &str, _date: &str) -> Result<Vec<BookingRecord>, EngineError> {
        Ok(Vec::new())
    }
}

/// Canonical spelling when the value parses, otherwise the value as given.
/// Unparseable times never block anything, so they are kept rather than refused.
fn normalized(value: Option<String>, canonical: fn(&str) -> Result<String, EngineError>) -> Option<String> {
    value.map(|v| canonical(&v).unwrap_or(v))
}

/// In-memory mirror of booking statuses, fed by whoever owns the booking records.
/// One record per slot key; the latest status wins.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    days: DashMap<DayKey, Vec<BookingRecord>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, record: BookingRecord) -> Result<(), EngineError> {
        if record.ride_id.trim().is_empty() {
            return Err(EngineError::InvalidInput("ride_id must not be empty".into()));
        }
        if record.ride_id.len() > MAX_RIDE_ID_LEN {
            return Err(EngineError::LimitExceeded("ride_id too long"));
        }
        if record.status.len() > MAX_STATUS_LEN {
            return Err(EngineError::LimitExceeded("status too long"));
        }
        let record = BookingRecord {
            date: normalized(record.date, canonical_date),
            time: normalized(record.time, canonical_time),
            ..record
        };

        let key = record.slot().day();
        let mut day = self.days.entry(key).or_default();
        let slot_key = record.slot().key();
        if let Some(existing) = day.iter_mut().find(|r| r.slot().key() == slot_key) {
            existing.status = record.status;
            return Ok(());
        }
        if day.len() >= MAX_LEDGER_RECORDS_PER_DAY {
            return Err(EngineError::LimitExceeded("too many booking records for one day"));
        }
        day.push(record);
        Ok(())
    }
}

#[async_trait]
impl BookingLedger for InMemoryLedger {
    async fn bookings_for(&self, ride_id: &str, date: &str) -> Result<Vec<BookingRecord>, EngineError> {
        let date = canonical_date(date).unwrap_or_else(|_| date.to_string());
        Ok(self
            .days
            .get(&DayKey::new(ride_id, &date))
            .map(|day| day.value().clone())
            .unwrap_or_default())
    }
}
