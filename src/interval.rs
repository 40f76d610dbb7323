//! Interval specs and the bucketizer that reduces a time-ordered stream into
//! fixed-width, optionally calendar-aligned buckets
//!
//! # Grammar
//!
//! ```text
//! spec   := group*
//! group  := digits unit
//! unit   := s | m | h | d | w | n | y     (seconds .. years, n = months)
//! ```
//!
//! An uppercase unit letter aligns buckets to that unit's calendar boundary
//! (`1H` starts buckets on the hour, `1h` starts them at the first sample).
//! When several units are aligned the coarsest one wins.

use crate::event::Value;
use crate::rollup::{Rollup, RollupError, RollupKind};
use crate::timestamp::encode_millis;
use chrono::{Datelike, Duration, Months, NaiveDate, TimeZone, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimeUnit {
    Seconds,
    Minutes,
    Hours,
    Days,
    Weeks,
    Months,
    Years,
}

impl TimeUnit {
    /// Finest to coarsest.
    pub fn all() -> [TimeUnit; 7] {
        [
            TimeUnit::Seconds,
            TimeUnit::Minutes,
            TimeUnit::Hours,
            TimeUnit::Days,
            TimeUnit::Weeks,
            TimeUnit::Months,
            TimeUnit::Years,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TimeUnit::Seconds => "seconds",
            TimeUnit::Minutes => "minutes",
            TimeUnit::Hours => "hours",
            TimeUnit::Days => "days",
            TimeUnit::Weeks => "weeks",
            TimeUnit::Months => "months",
            TimeUnit::Years => "years",
        }
    }

    /// Unit for a grammar letter, plus whether the letter requests alignment.
    fn from_letter(c: char) -> Option<(TimeUnit, bool)> {
        let unit = match c.to_ascii_lowercase() {
            's' => TimeUnit::Seconds,
            'm' => TimeUnit::Minutes,
            'h' => TimeUnit::Hours,
            'd' => TimeUnit::Days,
            'w' => TimeUnit::Weeks,
            'n' => TimeUnit::Months,
            'y' => TimeUnit::Years,
            _ => return None,
        };
        Some((unit, c.is_ascii_uppercase()))
    }

    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum IntervalError {
    UnknownUnit(char),
    MissingMagnitude(char),
    InvalidMagnitude(String),
    TrailingDigits(String),
    DuplicateUnit(TimeUnit),
    ZeroIncrement,
    Overflow,
    UnknownRollup(String),
}

impl std::fmt::Display for IntervalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IntervalError::UnknownUnit(c) => write!(f, "Unknown interval unit: '{}'", c),
            IntervalError::MissingMagnitude(c) => write!(f, "Interval unit '{}' has no magnitude", c),
            IntervalError::InvalidMagnitude(n) => write!(f, "Invalid interval magnitude: {}", n),
            IntervalError::TrailingDigits(n) => write!(f, "Invalid expression: trailing digits '{}'", n),
            IntervalError::DuplicateUnit(unit) => write!(f, "{} is already set", unit.as_str()),
            IntervalError::ZeroIncrement => write!(f, "Interval must span a positive duration"),
            IntervalError::Overflow => write!(f, "Interval is too large"),
            IntervalError::UnknownRollup(name) => write!(f, "Invalid rollup: {}", name),
        }
    }
}

impl std::error::Error for IntervalError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntervalSpec {
    magnitudes: [Option<u32>; 7],
    align: [bool; 7],
    increment_millis: i64,
}

impl IntervalSpec {
    pub fn parse(spec: &str) -> Result<Self, IntervalError> {
        let mut magnitudes = [None; 7];
        let mut align = [false; 7];
        let mut number = String::new();

        for c in spec.trim().chars() {
            if c.is_ascii_digit() {
                number.push(c);
                continue;
            }

            let (unit, aligned) = TimeUnit::from_letter(c).ok_or(IntervalError::UnknownUnit(c))?;
            if number.is_empty() {
                return Err(IntervalError::MissingMagnitude(c));
            }
            if magnitudes[unit.index()].is_some() {
                return Err(IntervalError::DuplicateUnit(unit));
            }

            let magnitude = number
                .parse::<u32>()
                .map_err(|_| IntervalError::InvalidMagnitude(number.clone()))?;
            magnitudes[unit.index()] = Some(magnitude);
            align[unit.index()] |= aligned;
            number.clear();
        }

        if !number.is_empty() {
            return Err(IntervalError::TrailingDigits(number));
        }

        let increment_millis = fold_increment(&magnitudes)?;
        if increment_millis <= 0 {
            return Err(IntervalError::ZeroIncrement);
        }

        Ok(Self {
            magnitudes,
            align,
            increment_millis,
        })
    }

    pub fn magnitude(&self, unit: TimeUnit) -> Option<u32> {
        self.magnitudes[unit.index()]
    }

    pub fn is_aligned(&self, unit: TimeUnit) -> bool {
        self.align[unit.index()]
    }

    pub fn increment_millis(&self) -> i64 {
        self.increment_millis
    }

    /// Truncate a timestamp to the coarsest aligned unit's calendar boundary (UTC).
    pub fn align(&self, timestamp_millis: i64) -> i64 {
        let coarsest = TimeUnit::all()
            .into_iter()
            .rev()
            .find(|unit| self.is_aligned(*unit));

        let floor = |step: i64| timestamp_millis.div_euclid(step) * step;
        match coarsest {
            None => timestamp_millis,
            Some(TimeUnit::Seconds) => floor(1_000),
            Some(TimeUnit::Minutes) => floor(60_000),
            Some(TimeUnit::Hours) => floor(3_600_000),
            Some(TimeUnit::Days) => floor(86_400_000),
            Some(unit) => {
                let Some(dt) = Utc.timestamp_millis_opt(timestamp_millis).single() else {
                    return timestamp_millis;
                };
                let date = dt.date_naive();
                let start = match unit {
                    // Weeks start on Sunday
                    TimeUnit::Weeks => date
                        .checked_sub_days(chrono::Days::new(date.weekday().num_days_from_sunday() as u64)),
                    TimeUnit::Months => NaiveDate::from_ymd_opt(date.year(), date.month(), 1),
                    _ => NaiveDate::from_ymd_opt(date.year(), 1, 1),
                };
                start
                    .and_then(|d| d.and_hms_opt(0, 0, 0))
                    .map(|d| d.and_utc().timestamp_millis())
                    .unwrap_or(timestamp_millis)
            }
        }
    }
}

/// Apply every magnitude to the epoch, coarsest first, and return the offset.
fn fold_increment(magnitudes: &[Option<u32>; 7]) -> Result<i64, IntervalError> {
    let mut t = Utc.timestamp_millis_opt(0).single().ok_or(IntervalError::Overflow)?;
    let get = |unit: TimeUnit| magnitudes[unit.index()].unwrap_or(0);

    let months = get(TimeUnit::Years)
        .checked_mul(12)
        .and_then(|m| m.checked_add(get(TimeUnit::Months)))
        .ok_or(IntervalError::Overflow)?;
    t = t.checked_add_months(Months::new(months)).ok_or(IntervalError::Overflow)?;

    let fixed = [
        Duration::try_weeks(get(TimeUnit::Weeks) as i64),
        Duration::try_days(get(TimeUnit::Days) as i64),
        Duration::try_hours(get(TimeUnit::Hours) as i64),
        Duration::try_minutes(get(TimeUnit::Minutes) as i64),
        Duration::try_seconds(get(TimeUnit::Seconds) as i64),
    ];
    for step in fixed {
        let step = step.ok_or(IntervalError::Overflow)?;
        t = t.checked_add_signed(step).ok_or(IntervalError::Overflow)?;
    }

    Ok(t.timestamp_millis())
}

/// One emitted history row.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub timestamp_millis: i64,
    pub timestamp: String,
    pub value: Value,
}

impl Row {
    pub fn new(timestamp_millis: i64, value: Value) -> Self {
        Self {
            timestamp_millis,
            timestamp: encode_millis(timestamp_millis),
            value,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct BucketState {
    start_millis: Option<i64>,
    last_value: Option<Value>,
}

/// Reduces a non-decreasing stream of samples into one row per bucket.
///
/// A bucket covers `[start, start + increment)` in aligned time, where `start`
/// is the aligned timestamp of the sample that opened it. Samples inside that
/// span are folded in; the first sample past it closes the bucket (emitting its
/// row) and opens the next one.
#[derive(Debug, Clone)]
pub struct Bucketizer {
    spec: IntervalSpec,
    rollup: RollupKind,
    /// Reused across buckets; reset when a bucket opens.
    accumulator: Option<Rollup>,
    state: BucketState,
}

impl Bucketizer {
    pub fn new(spec: IntervalSpec, rollup: RollupKind) -> Self {
        Self {
            spec,
            rollup,
            accumulator: rollup.accumulator(),
            state: BucketState::default(),
        }
    }

    /// Build a bucketizer from user input.
    ///
    /// Returns `Ok(None)` for the "none"/"default" (or empty) interval, meaning
    /// every raw sample should be returned as-is.
    pub fn parse(interval: &str, rollup: &str) -> Result<Option<Self>, IntervalError> {
        let rollup = RollupKind::from_str(rollup.trim())
            .ok_or_else(|| IntervalError::UnknownRollup(rollup.to_string()))?;

        let interval = interval.trim();
        if interval.is_empty() || interval == "none" || interval == "default" {
            return Ok(None);
        }

        Ok(Some(Self::new(IntervalSpec::parse(interval)?, rollup)))
    }

    pub fn spec(&self) -> &IntervalSpec {
        &self.spec
    }

    pub fn rollup_kind(&self) -> RollupKind {
        self.rollup
    }

    /// Offer the next sample; returns the row of a bucket this sample closed.
    pub fn offer(&mut self, value: Value, timestamp_millis: i64) -> Result<Option<Row>, RollupError> {
        let aligned = self.spec.align(timestamp_millis);

        if let Some(start) = self.state.start_millis {
            if aligned.saturating_sub(start) < self.spec.increment_millis {
                if let Some(rollup) = self.accumulator.as_mut() {
                    rollup.update(&value, timestamp_millis)?;
                }
                self.state.last_value = Some(value);
                return Ok(None);
            }
        }

        let closed = self.close_bucket();
        self.open_bucket(aligned, value, timestamp_millis)?;
        Ok(closed)
    }

    /// Close the open bucket at end of stream.
    pub fn finish(&mut self) -> Option<Row> {
        self.close_bucket()
    }

    fn close_bucket(&mut self) -> Option<Row> {
        let state = std::mem::take(&mut self.state);
        let start = state.start_millis?;
        let value = match self.accumulator.as_ref() {
            Some(rollup) => rollup.value(),
            None => state.last_value?,
        };
        Some(Row::new(start, value))
    }

    fn open_bucket(&mut self, aligned: i64, value: Value, timestamp_millis: i64) -> Result<(), RollupError> {
        if let Some(rollup) = self.accumulator.as_mut() {
            rollup.reset();
            rollup.update(&value, timestamp_millis)?;
        }
        self.state = BucketState {
            start_millis: Some(aligned),
            last_value: Some(value),
        };
        Ok(())
    }
}
