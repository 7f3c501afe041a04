use crate::model::Minutes;

pub const MAX_RIDE_ID_LEN: usize = 128;
pub const MAX_DATE_LEN: usize = 32;
pub const MAX_TIME_LEN: usize = 32;
pub const MAX_STATUS_LEN: usize = 64;

pub const MIN_HOLD_TTL_MINUTES: u32 = 1;
pub const MAX_HOLD_TTL_MINUTES: u32 = 24 * 60;

pub const MAX_DURATION_MINUTES: Minutes = 24 * 60;

/// Reservation records per (ride, date), including not-yet-reaped holds.
pub const MAX_SLOTS_PER_DAY: usize = 24 * 60;

pub const MAX_RIDES: usize = 10_000;

/// Ledger rows kept per (ride, date).
pub const MAX_LEDGER_RECORDS_PER_DAY: usize = 1_000;
