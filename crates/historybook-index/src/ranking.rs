//! Secondary scoring applied on top of text relevance.
//!
//! A [`ScoreTransform`] sees the base relevance score of each match together
//! with the page's fetch time and returns the score used for grouping and
//! ordering.

use std::fmt::Debug;

use tantivy::Score;

/// Seconds in a 365-day year.
pub const SECONDS_PER_YEAR: f64 = 365.0 * 24.0 * 60.0 * 60.0;

/// Decay rate of the default recency boost.
pub const RECENCY_RECIP: f64 = 1.0 / SECONDS_PER_YEAR;

/// Combines a base relevance score with document age.
pub trait ScoreTransform: Debug + Send + Sync {
    /// Returns the final score for a match fetched at `timestamp` (epoch
    /// seconds), evaluated at `now`. `timestamp` is `None` when the document
    /// carries no fetch time.
    fn transform(&self, score: Score, timestamp: Option<i64>, now: i64) -> Score;

    /// Human-readable description of how `transform` treated a match.
    fn explain(&self, timestamp: Option<i64>, now: i64) -> String;
}

/// Reciprocal age decay: `1 / (1 + recip * age_seconds)`.
///
/// With the default rate a page one year old scores half of an identical page
/// fetched now, and a third at two years.
#[derive(Debug, Clone, Copy)]
pub struct RecencyBoost {
    recip: f64,
}

impl RecencyBoost {
    pub fn new() -> Self {
        Self::with_recip(RECENCY_RECIP)
    }

    pub fn with_recip(recip: f64) -> Self {
        Self { recip }
    }

    /// Boost multiplier for a page of the given age. Future timestamps count
    /// as age zero.
    pub fn factor(&self, timestamp: i64, now: i64) -> f64 {
        let age = now.saturating_sub(timestamp).max(0) as f64;
        1.0 / (1.0 + self.recip * age)
    }
}

impl Default for RecencyBoost {
    fn default() -> Self {
        Self::new()
    }
}

impl ScoreTransform for RecencyBoost {
    fn transform(&self, score: Score, timestamp: Option<i64>, now: i64) -> Score {
        match timestamp {
            Some(ts) => (f64::from(score) * self.factor(ts, now)) as Score,
            None => score,
        }
    }

    fn explain(&self, timestamp: Option<i64>, now: i64) -> String {
        match timestamp {
            Some(ts) => format!(
                "recency boost {:.6} = 1 / (1 + {:e} * max(0, {} - {}))",
                self.factor(ts, now),
                self.recip,
                now,
                ts
            ),
            None => "recency boost 1.0 (no timestamp)".to_string(),
        }
    }
}

/// Leaves relevance scores untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityTransform;

impl ScoreTransform for IdentityTransform {
    fn transform(&self, score: Score, _timestamp: Option<i64>, _now: i64) -> Score {
        score
    }

    fn explain(&self, _timestamp: Option<i64>, _now: i64) -> String {
        "no score transform".to_string()
    }
}
