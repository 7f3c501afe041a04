use chrono::NaiveDate;

use crate::model::*;

use super::EngineError;

// ── Slot policy ───────────────────────────────────────────────────

/// Operating window and granularity for candidate start times.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotPolicy {
    pub day_start: Minutes,
    pub day_end: Minutes,
    pub step: Minutes,
    /// Padding applied before and after every occupancy interval.
    pub buffer: Minutes,
}

impl Default for SlotPolicy {
    fn default() -> Self {
        Self {
            day_start: 8 * 60,
            day_end: 17 * 60,
            step: 15,
            buffer: 10,
        }
    }
}

// ── Parsing ───────────────────────────────────────────────────────

/// `HH:MM` → minutes since midnight. Requires `0 <= HH < 24` and `0 <= MM < 60`.
pub fn parse_hhmm(s: &str) -> Option<Minutes> {
    let (h, m) = s.trim().split_once(':')?;
    if h.is_empty() || m.is_empty() || h.len() > 2 || m.len() > 2 {
        return None;
    }
    if !h.bytes().chain(m.bytes()).all(|b| b.is_ascii_digit()) {
        return None;
    }
    let h: Minutes = h.parse().ok()?;
    let m: Minutes = m.parse().ok()?;
    if !(0..24).contains(&h) || !(0..60).contains(&m) {
        return None;
    }
    Some(h * 60 + m)
}

pub fn format_hhmm(minutes: Minutes) -> String {
    format!("{:02}:{:02}", minutes / 60, minutes % 60)
}

pub fn validate_date(date: &str) -> Result<NaiveDate, EngineError> {
    NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .map_err(|_| EngineError::InvalidInput(format!("date must be YYYY-MM-DD, got {date:?}")))
}

/// Zero-padded `YYYY-MM-DD`. Equal calendar days always get equal strings.
pub fn canonical_date(date: &str) -> Result<String, EngineError> {
    Ok(validate_date(date)?.format("%Y-%m-%d").to_string())
}

/// Zero-padded `HH:MM`.
pub fn canonical_time(time: &str) -> Result<String, EngineError> {
    Ok(format_hhmm(validate_time(time)?))
}

pub fn validate_time(time: &str) -> Result<Minutes, EngineError> {
    parse_hhmm(time)
        .ok_or_else(|| EngineError::InvalidInput(format!("time must be HH:MM, got {time:?}")))
}

// ── Blocking and generation ───────────────────────────────────────

/// Expand each occupied start time into `[t - buffer, t + duration + buffer)`,
/// clamped to the day. Malformed times are skipped. No merging.
pub fn blocked_intervals<'a>(
    times: impl IntoIterator<Item = &'a str>,
    duration: Minutes,
    buffer: Minutes,
) -> Vec<Span> {
    times
        .into_iter()
        .filter_map(parse_hhmm)
        .filter_map(|t| {
            let start = (t - buffer).max(0);
            let end = (t + duration + buffer).min(MINUTES_PER_DAY);
            (start < end).then(|| Span::new(start, end))
        })
        .collect()
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

/// Candidate starts `t` in `[day_start, day_end - duration]` at `step`, kept iff
/// `[t, t + duration)` overlaps no blocked interval. Ascending `HH:MM`.
pub fn available_starts(blocked: &[Span], duration: Minutes, policy: &SlotPolicy) -> Vec<String> {
    let mut blocked = blocked.to_vec();
    blocked.sort_by_key(|s| s.start);
    let blocked = merge_overlapping(&blocked);

    let step = policy.step.max(1);
    let mut starts = Vec::new();
    let mut bi = 0;
    let mut t = policy.day_start;
    while t + duration <= policy.day_end {
        let candidate = Span::new(t, t + duration);
        // Blocks ending at or before `t` can never touch a later candidate.
        while bi < blocked.len() && blocked[bi].end <= candidate.start {
            bi += 1;
        }
        let hit = blocked.get(bi).is_some_and(|b| b.overlaps(&candidate));
        if !hit {
            starts.push(format_hhmm(t));
        }
        t += step;
    }
    starts
}
