use crate::model::*;

use super::Engine;

impl Engine {
    /// Records currently occupying their slot on `(ride_id, date)`, ordered by time.
    pub async fn live_records(&self, ride_id: &str, date: &str, now: Ms) -> Vec<SlotRecord> {
        let Some(day) = self.get_day(&DayKey::new(ride_id, date)) else {
            return Vec::new();
        };
        let guard = day.read().await;
        guard.live(now).cloned().collect()
    }

    pub fn configured_duration(&self, ride_id: &str) -> Option<Minutes> {
        self.rides.get(ride_id).map(|e| *e.value())
    }

    pub fn list_rides(&self) -> Vec<RideInfo> {
        let mut rides: Vec<RideInfo> = self
            .rides
            .iter()
            .map(|e| RideInfo {
                ride_id: e.key().clone(),
                duration_minutes: *e.value(),
            })
            .collect();
        rides.sort_by(|a, b| a.ride_id.cmp(&b.ride_id));
        rides
    }

    /// Number of (ride, date) shards currently held in memory.
    pub fn day_count(&self) -> usize {
        self.days.len()
    }
}
