use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only wall-clock type.
pub type Ms = i64;

/// Minutes since local midnight.
pub type Minutes = i32;

pub const MINUTES_PER_DAY: Minutes = 24 * 60;

/// Half-open interval `[start, end)` in minutes since midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Minutes,
    pub end: Minutes,
}

impl Span {
    pub fn new(start: Minutes, end: Minutes) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// `[a,b)` and `[c,d)` overlap iff `!(b <= c || a >= d)`.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// A (ride, date, time) triple. Missing date/time are legal and key as "".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Slot {
    pub ride_id: String,
    pub date: Option<String>,
    pub time: Option<String>,
}

impl Slot {
    pub fn new(ride_id: impl Into<String>, date: Option<&str>, time: Option<&str>) -> Self {
        Self {
            ride_id: ride_id.into(),
            date: date.map(str::to_string),
            time: time.map(str::to_string),
        }
    }

    /// Exclusivity token: `ride|date|time`.
    pub fn key(&self) -> String {
        format!(
            "{}|{}|{}",
            self.ride_id,
            self.date.as_deref().unwrap_or(""),
            self.time.as_deref().unwrap_or("")
        )
    }

    pub fn day(&self) -> DayKey {
        DayKey::new(&self.ride_id, self.date.as_deref().unwrap_or(""))
    }

    /// Position of the slot inside its day.
    pub fn time_key(&self) -> &str {
        self.time.as_deref().unwrap_or("")
    }
}

/// Shard key for reservation state: one ride on one date.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DayKey {
    pub ride_id: String,
    pub date: String,
}

impl DayKey {
    pub fn new(ride_id: &str, date: &str) -> Self {
        Self {
            ride_id: ride_id.to_string(),
            date: date.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotStatus {
    /// Tentative claim pending payment.
    Hold { expires_at: Ms },
    /// Terminal.
    Booked,
}

impl SlotStatus {
    pub fn label(&self) -> &'static str {
        match self {
            SlotStatus::Hold { .. } => "hold",
            SlotStatus::Booked => "booked",
        }
    }
}

/// One reservation record. Absence of a record means the slot is free.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotRecord {
    pub id: Ulid,
    pub slot: Slot,
    pub status: SlotStatus,
    pub created_at: Ms,
}

impl SlotRecord {
    pub fn key(&self) -> String {
        self.slot.key()
    }

    pub fn hold_expires_at(&self) -> Option<Ms> {
        match self.status {
            SlotStatus::Hold { expires_at } => Some(expires_at),
            SlotStatus::Booked => None,
        }
    }

    /// Booked, or held with an expiry still in the future.
    pub fn is_live(&self, now: Ms) -> bool {
        match self.status {
            SlotStatus::Hold { expires_at } => expires_at > now,
            SlotStatus::Booked => true,
        }
    }

    pub fn is_expired_hold(&self, now: Ms) -> bool {
        matches!(self.status, SlotStatus::Hold { expires_at } if expires_at <= now)
    }
}

/// Outcome of a successful promotion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Promotion {
    /// hold → booked happened on this call.
    Promoted,
    /// The slot was already booked; nothing changed.
    AlreadyBooked,
}

/// All reservation records of one ride on one date, keyed by time.
#[derive(Debug, Clone)]
pub struct DayState {
    pub key: DayKey,
    pub slots: BTreeMap<String, SlotRecord>,
}

impl DayState {
    pub fn new(key: DayKey) -> Self {
        Self {
            key,
            slots: BTreeMap::new(),
        }
    }

    pub fn get(&self, slot: &Slot) -> Option<&SlotRecord> {
        self.slots.get(slot.time_key())
    }

    /// Records that currently occupy their slot.
    pub fn live(&self, now: Ms) -> impl Iterator<Item = &SlotRecord> {
        self.slots.values().filter(move |r| r.is_live(now))
    }

    pub fn expired_holds(&self, now: Ms) -> impl Iterator<Item = &SlotRecord> {
        self.slots.values().filter(move |r| r.is_expired_hold(now))
    }
}

/// WAL record format. Flat, no nesting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    RideConfigured {
        ride_id: String,
        duration_minutes: Minutes,
    },
    HoldPlaced {
        id: Ulid,
        slot: Slot,
        expires_at: Ms,
        created_at: Ms,
    },
    HoldPromoted {
        slot: Slot,
    },
    HoldExpired {
        id: Ulid,
        slot: Slot,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RideInfo {
    pub ride_id: String,
    pub duration_minutes: Minutes,
}
