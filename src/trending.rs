//! Recency-decayed popularity ranking.
//!
//! Age is measured by subtracting ISO calendar components (year, week,
//! weekday) and the hour of day rather than raw timestamps, with 364 days per
//! ISO year. Across a 53-week year boundary this is off by a week; rankings
//! depend on the exact figure, so it is kept as is.

use chrono::{DateTime, Datelike, Timelike, Utc};

const HOURS_PER_DAY: i64 = 24;
const HOURS_PER_WEEK: i64 = 7 * HOURS_PER_DAY;
const HOURS_PER_YEAR: i64 = 364 * HOURS_PER_DAY;
const AGE_OFFSET: f64 = 1.01;
const SCORE_OFFSET: f64 = 0.01;

#[derive(Debug, Clone, PartialEq)]
pub struct TrendingCandidate {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub pos: i64,
    pub neg: i64,
}

/// Hours between `created_at` and `now`, plus a 1.01 offset
pub fn age_hours(created_at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let (current, created) = (now.iso_week(), created_at.iso_week());

    let years = i64::from(current.year() - created.year());
    let weeks = i64::from(current.week()) - i64::from(created.week());
    let days = i64::from(now.weekday().number_from_monday())
        - i64::from(created_at.weekday().number_from_monday());
    let hours = i64::from(now.hour()) - i64::from(created_at.hour());

    let whole = years * HOURS_PER_YEAR + weeks * HOURS_PER_WEEK + days * HOURS_PER_DAY + hours;
    whole as f64 + AGE_OFFSET
}

pub fn popularity(pos: i64, neg: i64, age_hours: f64) -> f64 {
    ((pos - neg) as f64 + SCORE_OFFSET) / age_hours
}

pub fn score(candidate: &TrendingCandidate, now: DateTime<Utc>) -> f64 {
    popularity(candidate.pos, candidate.neg, age_hours(candidate.created_at, now))
}

/// Candidate ids by descending popularity, ties newest id first
pub fn rank(candidates: &[TrendingCandidate], now: DateTime<Utc>) -> Vec<i64> {
    let mut scored: Vec<(i64, f64)> = candidates
        .iter()
        .map(|candidate| (candidate.id, score(candidate, now)))
        .collect();
    scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(b.0.cmp(&a.0)));
    scored.into_iter().map(|(id, _)| id).collect()
}
