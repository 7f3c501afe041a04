use std::sync::Arc;

use tokio::sync::oneshot;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError, WalCommand};

fn check_slot(slot: &Slot) -> Result<(), EngineError> {
    if slot.ride_id.trim().is_empty() {
        return Err(EngineError::InvalidInput("ride_id must not be empty".into()));
    }
    if slot.ride_id.len() > MAX_RIDE_ID_LEN {
        return Err(EngineError::LimitExceeded("ride_id too long"));
    }
    if slot.date.as_ref().is_some_and(|d| d.len() > MAX_DATE_LEN) {
        return Err(EngineError::LimitExceeded("date too long"));
    }
    if slot.time.as_ref().is_some_and(|t| t.len() > MAX_TIME_LEN) {
        return Err(EngineError::LimitExceeded("time too long"));
    }
    Ok(())
}

impl Engine {
    /// Atomic create-if-absent. An expired hold counts as absent and is replaced.
    pub async fn try_hold(
        &self,
        slot: Slot,
        ttl_minutes: u32,
        now: Ms,
    ) -> Result<SlotRecord, EngineError> {
        check_slot(&slot)?;
        let ttl_minutes = ttl_minutes.max(MIN_HOLD_TTL_MINUTES);
        if ttl_minutes > MAX_HOLD_TTL_MINUTES {
            return Err(EngineError::LimitExceeded("hold TTL too long"));
        }

        let day = self.day_or_create(slot.day());
        let _gate = self.commit_gate.read().await;
        let mut guard = day.write().await;

        match guard.get(&slot) {
            Some(existing) if existing.is_live(now) => {
                return Err(EngineError::Conflict(slot.key()));
            }
            Some(_) => {}
            None if guard.slots.len() >= MAX_SLOTS_PER_DAY => {
                return Err(EngineError::LimitExceeded("too many reservations for one day"));
            }
            None => {}
        }

        let id = Ulid::new();
        let expires_at = now + i64::from(ttl_minutes) * 60_000;
        let event = Event::HoldPlaced {
            id,
            slot: slot.clone(),
            expires_at,
            created_at: now,
        };
        self.persist_and_apply(&mut guard, &event).await?;

        Ok(SlotRecord {
            id,
            slot,
            status: SlotStatus::Hold { expires_at },
            created_at: now,
        })
    }

    /// hold → booked. Already booked is a success that changes nothing.
    pub async fn promote(&self, slot: &Slot, now: Ms) -> Result<Promotion, EngineError> {
        check_slot(slot)?;
        let day = self
            .get_day(&slot.day())
            .ok_or_else(|| EngineError::HoldLost(slot.key()))?;
        let _gate = self.commit_gate.read().await;
        let mut guard = day.write().await;

        match guard.get(slot).map(|r| r.status) {
            Some(SlotStatus::Booked) => Ok(Promotion::AlreadyBooked),
            Some(SlotStatus::Hold { expires_at }) if expires_at > now => {
                let event = Event::HoldPromoted { slot: slot.clone() };
                self.persist_and_apply(&mut guard, &event).await?;
                Ok(Promotion::Promoted)
            }
            _ => Err(EngineError::HoldLost(slot.key())),
        }
    }

    pub async fn configure_ride(&self, ride_id: &str, duration_minutes: Minutes) -> Result<(), EngineError> {
        if ride_id.trim().is_empty() {
            return Err(EngineError::InvalidInput("ride_id must not be empty".into()));
        }
        if ride_id.len() > MAX_RIDE_ID_LEN {
            return Err(EngineError::LimitExceeded("ride_id too long"));
        }
        if duration_minutes <= 0 || duration_minutes > MAX_DURATION_MINUTES {
            return Err(EngineError::InvalidInput(format!(
                "duration_minutes must be between 1 and {MAX_DURATION_MINUTES}, got {duration_minutes}"
            )));
        }

        let _gate = self.commit_gate.read().await;
        let _catalog = self.catalog_lock.lock().await;
        if !self.rides.contains_key(ride_id) && self.rides.len() >= MAX_RIDES {
            return Err(EngineError::LimitExceeded("too many rides"));
        }

        let event = Event::RideConfigured {
            ride_id: ride_id.to_string(),
            duration_minutes,
        };
        self.wal_append(&event).await?;
        self.rides.insert(ride_id.to_string(), duration_minutes);
        Ok(())
    }

    /// Holds whose expiry has passed. Days locked by a writer are skipped; the next pass gets them.
    pub fn collect_expired_holds(&self, now: Ms) -> Vec<(Ulid, Slot)> {
        let mut expired = Vec::new();
        for entry in self.days.iter() {
            let day = entry.value().clone();
            if let Ok(guard) = day.try_read() {
                for record in guard.expired_holds(now) {
                    expired.push((record.id, record.slot.clone()));
                }
            }
        }
        expired
    }

    /// Remove one expired hold, provided it is still the same hold and still expired.
    /// Returns whether anything was removed. Booked records are never touched.
    pub async fn reclaim_hold(&self, id: Ulid, slot: &Slot, now: Ms) -> Result<bool, EngineError> {
        let Some(day) = self.get_day(&slot.day()) else {
            return Ok(false);
        };
        let _gate = self.commit_gate.read().await;
        let mut guard = day.write().await;

        let still_expired = guard
            .get(slot)
            .is_some_and(|r| r.id == id && r.is_expired_hold(now));
        if !still_expired {
            return Ok(false);
        }

        let event = Event::HoldExpired {
            id,
            slot: slot.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        tracing::debug!("reclaimed expired hold {id} on {}", slot.key());
        Ok(true)
    }

    /// One reclamation pass: remove every expired hold, then drop days left empty.
    pub async fn reclaim_expired(&self, now: Ms) -> Result<usize, EngineError> {
        let mut reclaimed = 0;
        for (id, slot) in self.collect_expired_holds(now) {
            if self.reclaim_hold(id, &slot, now).await? {
                reclaimed += 1;
            }
        }
        self.prune_empty_days();
        Ok(reclaimed)
    }

    /// Drop day entries with no records. A day someone else holds a handle to is kept.
    fn prune_empty_days(&self) {
        self.days.retain(|_, day| {
            if Arc::strong_count(day) > 1 {
                return true;
            }
            day.try_read().map(|g| !g.slots.is_empty()).unwrap_or(true)
        });
    }

    /// Rewrite the WAL with only the events needed to recreate the current state.
    /// Expired holds are dropped; booked records are written as placed + promoted.
    pub async fn compact_wal(&self, now: Ms) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;
        let mut events = Vec::new();

        let mut rides: Vec<(String, Minutes)> =
            self.rides.iter().map(|e| (e.key().clone(), *e.value())).collect();
        rides.sort();
        for (ride_id, duration_minutes) in rides {
            events.push(Event::RideConfigured {
                ride_id,
                duration_minutes,
            });
        }

        let mut days: Vec<_> = self
            .days
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        days.sort_by(|a, b| a.0.cmp(&b.0));

        for (_, day) in days {
            let guard = day.read().await;
            for record in guard.live(now) {
                let expires_at = record.hold_expires_at().unwrap_or(record.created_at);
                events.push(Event::HoldPlaced {
                    id: record.id,
                    slot: record.slot.clone(),
                    expires_at,
                    created_at: record.created_at,
                });
                if record.status == SlotStatus::Booked {
                    events.push(Event::HoldPromoted {
                        slot: record.slot.clone(),
                    });
                }
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
