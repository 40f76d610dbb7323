//! Rollup accumulators applied to the samples of one bucket

use crate::event::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RollupKind {
    None,
    Avg,
    Min,
    Max,
    Sum,
    Count,
    First,
    Last,
    Delta,
}

impl RollupKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RollupKind::None => "none",
            RollupKind::Avg => "avg",
            RollupKind::Min => "min",
            RollupKind::Max => "max",
            RollupKind::Sum => "sum",
            RollupKind::Count => "count",
            RollupKind::First => "first",
            RollupKind::Last => "last",
            RollupKind::Delta => "delta",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "none" => Some(RollupKind::None),
            "avg" => Some(RollupKind::Avg),
            "min" => Some(RollupKind::Min),
            "max" => Some(RollupKind::Max),
            "sum" => Some(RollupKind::Sum),
            "count" => Some(RollupKind::Count),
            "first" => Some(RollupKind::First),
            "last" => Some(RollupKind::Last),
            "delta" => Some(RollupKind::Delta),
            _ => None,
        }
    }

    pub fn all() -> [RollupKind; 9] {
        [
            RollupKind::None,
            RollupKind::Avg,
            RollupKind::Min,
            RollupKind::Max,
            RollupKind::Sum,
            RollupKind::First,
            RollupKind::Last,
            RollupKind::Count,
            RollupKind::Delta,
        ]
    }

    /// Fresh accumulator for this kind; `None` means raw pass-through.
    pub fn accumulator(&self) -> Option<Rollup> {
        let rollup = match self {
            RollupKind::None => return None,
            RollupKind::Avg => Rollup::Avg { sum: 0.0, count: 0 },
            RollupKind::Min => Rollup::Min(None),
            RollupKind::Max => Rollup::Max(None),
            RollupKind::Sum => Rollup::Sum(None),
            RollupKind::Count => Rollup::Count(0),
            RollupKind::First => Rollup::First(None),
            RollupKind::Last => Rollup::Last(None),
            RollupKind::Delta => Rollup::Delta { first: None, last: None },
        };
        Some(rollup)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RollupError {
    NonNumeric {
        rollup: RollupKind,
        found: &'static str,
    },
}

impl std::fmt::Display for RollupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RollupError::NonNumeric { rollup, found } => write!(
                f,
                "Rollup '{}' requires numeric samples, got {}",
                rollup.as_str(),
                found
            ),
        }
    }
}

impl std::error::Error for RollupError {}

/// Running aggregate. State lives until the next `reset`.
#[derive(Debug, Clone, PartialEq)]
pub enum Rollup {
    Avg { sum: f64, count: u64 },
    Min(Option<f64>),
    Max(Option<f64>),
    Sum(Option<f64>),
    Count(u64),
    First(Option<Value>),
    Last(Option<Value>),
    Delta { first: Option<f64>, last: Option<f64> },
}

impl Rollup {
    pub fn kind(&self) -> RollupKind {
        match self {
            Rollup::Avg { .. } => RollupKind::Avg,
            Rollup::Min(_) => RollupKind::Min,
            Rollup::Max(_) => RollupKind::Max,
            Rollup::Sum(_) => RollupKind::Sum,
            Rollup::Count(_) => RollupKind::Count,
            Rollup::First(_) => RollupKind::First,
            Rollup::Last(_) => RollupKind::Last,
            Rollup::Delta { .. } => RollupKind::Delta,
        }
    }

    pub fn reset(&mut self) {
        *self = match self.kind().accumulator() {
            Some(fresh) => fresh,
            None => return,
        };
    }

    /// Fold one sample in. The timestamp is accepted for symmetry with the
    /// bucketizer; none of the current kinds weight by time.
    pub fn update(&mut self, value: &Value, _timestamp_millis: i64) -> Result<(), RollupError> {
        match self {
            Rollup::Count(count) => *count += 1,
            Rollup::First(first) => {
                if first.is_none() {
                    *first = Some(value.clone());
                }
            }
            Rollup::Last(last) => *last = Some(value.clone()),
            Rollup::Avg { sum, count } => {
                *sum += numeric(RollupKind::Avg, value)?;
                *count += 1;
            }
            Rollup::Min(min) => {
                let n = numeric(RollupKind::Min, value)?;
                *min = Some(min.map_or(n, |m| m.min(n)));
            }
            Rollup::Max(max) => {
                let n = numeric(RollupKind::Max, value)?;
                *max = Some(max.map_or(n, |m| m.max(n)));
            }
            Rollup::Sum(total) => {
                let n = numeric(RollupKind::Sum, value)?;
                *total = Some(total.unwrap_or(0.0) + n);
            }
            Rollup::Delta { first, last } => {
                let n = numeric(RollupKind::Delta, value)?;
                if first.is_none() {
                    *first = Some(n);
                }
                *last = Some(n);
            }
        }
        Ok(())
    }

    /// Current aggregate; `Value::Null` before the first numeric sample.
    pub fn value(&self) -> Value {
        match self {
            Rollup::Avg { sum, count } => {
                if *count == 0 {
                    Value::Null
                } else {
                    Value::Number(sum / *count as f64)
                }
            }
            Rollup::Min(n) | Rollup::Max(n) | Rollup::Sum(n) => {
                n.map(Value::Number).unwrap_or(Value::Null)
            }
            Rollup::Count(count) => Value::Number(*count as f64),
            Rollup::First(v) | Rollup::Last(v) => v.clone().unwrap_or(Value::Null),
            Rollup::Delta { first, last } => match (first, last) {
                (Some(first), Some(last)) => Value::Number(last - first),
                _ => Value::Null,
            },
        }
    }
}

fn numeric(rollup: RollupKind, value: &Value) -> Result<f64, RollupError> {
    value.as_f64().ok_or(RollupError::NonNumeric {
        rollup,
        found: value.type_name(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(kind: RollupKind, samples: &[f64]) -> Value {
        let mut rollup = kind.accumulator().unwrap();
        for (i, sample) in samples.iter().enumerate() {
            rollup.update(&Value::Number(*sample), i as i64).unwrap();
        }
        rollup.value()
    }

    #[test]
    fn test_avg() {
        assert_eq!(feed(RollupKind::Avg, &[10.0, 20.0, 30.0]), Value::Number(20.0));
    }

    #[test]
    fn test_count() {
        assert_eq!(feed(RollupKind::Count, &[4.0, 4.0, 9.0]), Value::Number(3.0));
    }

    #[test]
    fn test_delta() {
        assert_eq!(feed(RollupKind::Delta, &[5.0, 2.0, 9.0]), Value::Number(4.0));
    }

    #[test]
    fn test_first_last() {
        assert_eq!(feed(RollupKind::First, &[1.0, 2.0, 3.0]), Value::Number(1.0));
        assert_eq!(feed(RollupKind::Last, &[1.0, 2.0, 3.0]), Value::Number(3.0));
    }

    #[test]
    fn test_min_max_sum() {
        assert_eq!(feed(RollupKind::Min, &[3.0, -1.0, 2.0]), Value::Number(-1.0));
        assert_eq!(feed(RollupKind::Max, &[3.0, -1.0, 2.0]), Value::Number(3.0));
        assert_eq!(feed(RollupKind::Sum, &[3.0, -1.0, 2.0]), Value::Number(4.0));
    }

    #[test]
    fn test_empty_numeric_rollups_are_null() {
        for kind in [RollupKind::Avg, RollupKind::Min, RollupKind::Max, RollupKind::Sum, RollupKind::Delta] {
            assert_eq!(feed(kind, &[]), Value::Null, "{}", kind.as_str());
        }
        assert_eq!(feed(RollupKind::Count, &[]), Value::Number(0.0));
    }

    #[test]
    fn test_reset_clears_state() {
        let mut rollup = RollupKind::First.accumulator().unwrap();
        rollup.update(&Value::from("a"), 0).unwrap();
        rollup.reset();
        rollup.update(&Value::from("b"), 1).unwrap();
        assert_eq!(rollup.value(), Value::from("b"));
    }

    #[test]
    fn test_non_numeric_is_rejected() {
        let mut rollup = RollupKind::Sum.accumulator().unwrap();
        let err = rollup.update(&Value::from("x"), 0).unwrap_err();
        assert_eq!(
            err,
            RollupError::NonNumeric {
                rollup: RollupKind::Sum,
                found: "string"
            }
        );

        // Count, first and last accept any value
        let mut count = RollupKind::Count.accumulator().unwrap();
        assert!(count.update(&Value::Bool(true), 0).is_ok());
    }

    #[test]
    fn test_names_round_trip() {
        for kind in RollupKind::all() {
            assert_eq!(RollupKind::from_str(kind.as_str()), Some(kind));
        }
        assert_eq!(RollupKind::from_str("median"), None);
        assert!(RollupKind::None.accumulator().is_none());
    }
}
