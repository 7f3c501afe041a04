use crate::limits::MAX_DURATION_MINUTES;
use crate::model::Minutes;
use crate::store::RideCatalog;

pub const DEFAULT_DURATION_MINUTES: Minutes = 30;

/// Durations used when the catalog has nothing (or nonsense) for a ride.
pub const FALLBACK_DURATIONS: &[(&str, Minutes)] = &[
    ("30-1", 30),
    ("30-2", 30),
    ("30-3", 30),
    ("30-4", 30),
    ("30-5", 30),
    ("60-1", 60),
    ("60-2", 60),
    ("60-3", 60),
    ("60-4", 60),
    ("60-5", 60),
    ("joy", 10),
    ("group", 150),
];

fn is_valid_duration(minutes: Minutes) -> bool {
    minutes > 0 && minutes <= MAX_DURATION_MINUTES
}

/// Static fallback: exact table hit, then the `30-<n>` / `60-<n>` pattern, then 30.
pub fn fallback_duration(ride_id: &str) -> Minutes {
    if let Some((_, minutes)) = FALLBACK_DURATIONS.iter().find(|(id, _)| *id == ride_id) {
        return *minutes;
    }
    if let Some((prefix, count)) = ride_id.split_once('-')
        && !count.is_empty()
        && count.bytes().all(|b| b.is_ascii_digit())
    {
        match prefix {
            "30" => return 30,
            "60" => return 60,
            _ => {}
        }
    }
    DEFAULT_DURATION_MINUTES
}

/// Occupancy duration for a ride. Never fails; always positive.
pub fn resolve_duration(catalog: &dyn RideCatalog, ride_id: &str) -> Minutes {
    match catalog.configured_duration(ride_id) {
        Some(minutes) if is_valid_duration(minutes) => minutes,
        Some(minutes) => {
            tracing::warn!("ride {ride_id} has invalid configured duration {minutes}, using fallback");
            fallback_duration(ride_id)
        }
        None => fallback_duration(ride_id),
    }
}
