use async_trait::async_trait;

use crate::engine::{Engine, EngineError};
use crate::model::*;

/// An expiring key-value store of slot reservations.
///
/// Implementations must make `try_hold` atomic per slot key: of any number of
/// concurrent callers on an absent or expired key, exactly one succeeds.
#[async_trait]
pub trait SlotStore: Send + Sync {
    async fn try_hold(&self, slot: Slot, ttl_minutes: u32, now: Ms) -> Result<SlotRecord, EngineError>;

    async fn promote(&self, slot: &Slot, now: Ms) -> Result<Promotion, EngineError>;

    /// Unexpired holds and booked records for one ride on one date.
    async fn live_records(&self, ride_id: &str, date: &str, now: Ms) -> Result<Vec<SlotRecord>, EngineError>;

    /// Physically remove expired holds. Returns how many went.
    async fn reclaim_expired(&self, now: Ms) -> Result<usize, EngineError>;
}

/// Source of configured ride durations.
pub trait RideCatalog: Send + Sync {
    fn configured_duration(&self, ride_id: &str) -> Option<Minutes>;
}

#[async_trait]
impl SlotStore for Engine {
    async fn try_hold(&self, slot: Slot, ttl_minutes: u32, now: Ms) -> Result<SlotRecord, EngineError> {
        Engine::try_hold(self, slot, ttl_minutes, now).await
    }

    async fn promote(&self, slot: &Slot, now: Ms) -> Result<Promotion, EngineError> {
        Engine::promote(self, slot, now).await
    }

    async fn live_records(&self, ride_id: &str, date: &str, now: Ms) -> Result<Vec<SlotRecord>, EngineError> {
        Ok(Engine::live_records(self, ride_id, date, now).await)
    }

    async fn reclaim_expired(&self, now: Ms) -> Result<usize, EngineError> {
        Engine::reclaim_expired(self, now).await
    }
}

impl RideCatalog for Engine {
    fn configured_duration(&self, ride_id: &str) -> Option<Minutes> {
        Engine::configured_duration(self, ride_id)
    }
}
