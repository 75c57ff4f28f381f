//! Query-text to time-interval resolution.
//!
//! Pure and deterministic: the same `(query, now)` pair always yields
//! the same interval. Ambiguity never blocks the pipeline; it falls
//! back to the configured default window.

use chrono::{DateTime, Datelike, Duration, Months, TimeZone, Utc};
use hivesift_schema::TimeInterval;

#[derive(Debug, Clone, Copy)]
pub struct TimeframeDefaults {
    /// Window used for vague terms and for queries with no usable
    /// timeframe at all.
    pub window: Duration,
}

impl Default for TimeframeDefaults {
    fn default() -> Self {
        Self {
            window: Duration::days(7),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionKind {
    /// "last 3 hours", "past 2 weeks"
    Relative,
    /// "today", "yesterday", "this week", "this month"
    Named,
    /// "recent", "recently", "lately"
    Vague,
    /// No timeframe in the query; default window applied.
    Default,
    /// Conflicting explicit ranges; default window applied.
    Ambiguous,
}

#[derive(Debug, Clone, Copy)]
pub struct Resolution {
    pub interval: TimeInterval,
    pub kind: ResolutionKind,
}

impl Resolution {
    /// Whether the query itself carried a timeframe. Follow-up reuse
    /// yields to any explicit range.
    pub fn is_explicit(&self) -> bool {
        matches!(self.kind, ResolutionKind::Relative | ResolutionKind::Named)
    }
}

pub fn resolve(query: &str, now: DateTime<Utc>, defaults: &TimeframeDefaults) -> Resolution {
    let lower = query.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();

    let mut explicit: Vec<TimeInterval> = Vec::new();

    for (i, word) in words.iter().enumerate() {
        match *word {
            "last" | "past" => {
                if let Some(interval) = parse_relative(&words[i + 1..], now) {
                    explicit.push(interval);
                }
            }
            "this" => match words.get(i + 1).copied() {
                Some("week") => explicit.push(this_week(now)),
                Some("month") => explicit.push(this_month(now)),
                _ => {}
            },
            "today" => explicit.push(TimeInterval::new(start_of_day(now), now)),
            "yesterday" => {
                let midnight = start_of_day(now);
                explicit.push(TimeInterval::new(midnight - Duration::days(1), midnight));
            }
            _ => {}
        }
    }

    explicit.dedup();

    match explicit.len() {
        1 => Resolution {
            interval: explicit[0],
            kind: if words.contains(&"last") || words.contains(&"past") {
                ResolutionKind::Relative
            } else {
                ResolutionKind::Named
            },
        },
        0 => {
            let vague = words
                .iter()
                .any(|w| matches!(*w, "recent" | "recently" | "lately"));
            Resolution {
                interval: TimeInterval::new(now - defaults.window, now),
                kind: if vague {
                    ResolutionKind::Vague
                } else {
                    ResolutionKind::Default
                },
            }
        }
        _ => Resolution {
            interval: TimeInterval::new(now - defaults.window, now),
            kind: ResolutionKind::Ambiguous,
        },
    }
}

/// Parses the tail after "last"/"past": an optional count then a unit.
fn parse_relative(tail: &[&str], now: DateTime<Utc>) -> Option<TimeInterval> {
    let (count, unit) = match tail {
        [n, unit, ..] if n.chars().all(|c| c.is_ascii_digit()) => (n.parse::<u32>().ok()?, *unit),
        [unit, ..] => (1, *unit),
        [] => return None,
    };
    if count == 0 {
        return None;
    }

    let start = match unit {
        "minute" | "minutes" => now - Duration::minutes(count as i64),
        "hour" | "hours" => now - Duration::hours(count as i64),
        "day" | "days" => now - Duration::days(count as i64),
        "week" | "weeks" => now - Duration::weeks(count as i64),
        "month" | "months" => now - Months::new(count),
        _ => return None,
    };
    Some(TimeInterval::new(start, now))
}

fn start_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(now.year(), now.month(), now.day(), 0, 0, 0)
        .single()
        .unwrap_or(now)
}

fn this_week(now: DateTime<Utc>) -> TimeInterval {
    let days_from_monday = now.weekday().num_days_from_monday() as i64;
    let start = start_of_day(now) - Duration::days(days_from_monday);
    TimeInterval::new(start, now)
}

fn this_month(now: DateTime<Utc>) -> TimeInterval {
    let start = Utc
        .with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(now);
    TimeInterval::new(start, now)
}
