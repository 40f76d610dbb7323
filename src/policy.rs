//! Write policy: decides per update whether a watch's value is persisted

use crate::event::{UpdateEvent, Value};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoggingMode {
    None,
    AllData,
    /// Persist at most once per period (milliseconds) per watch.
    Interval(u64),
    PointChange,
    PointTime,
}

impl LoggingMode {
    /// Display name used by the configuration layer.
    pub fn as_str(&self) -> &'static str {
        match self {
            LoggingMode::None => "None",
            LoggingMode::AllData => "All data",
            LoggingMode::Interval(_) => "Interval",
            LoggingMode::PointChange => "Point Change",
            LoggingMode::PointTime => "Point Time",
        }
    }

    /// Parse a display name. `Interval` takes its period in seconds; negative
    /// periods clamp to zero.
    pub fn from_name(name: &str, interval_secs: i64) -> Option<Self> {
        match name {
            "None" => Some(LoggingMode::None),
            "All data" => Some(LoggingMode::AllData),
            "Interval" => Some(LoggingMode::interval(Duration::from_secs(interval_secs.max(0) as u64))),
            "Point Change" => Some(LoggingMode::PointChange),
            "Point Time" => Some(LoggingMode::PointTime),
            _ => None,
        }
    }

    pub fn interval(period: Duration) -> Self {
        LoggingMode::Interval(period.as_millis() as u64)
    }
}

impl Default for LoggingMode {
    fn default() -> Self {
        LoggingMode::AllData
    }
}

/// Per-watch bookkeeping. Owned by exactly one watch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WatchState {
    pub last_interval_update_millis: i64,
    /// Most recent value received from the feed (the "displayed" value).
    pub current_value: Option<Value>,
    pub last_written_value: Option<Value>,
    /// Earliest written timestamp, widened by stored history when seeded.
    pub start_millis: Option<i64>,
    /// End of the written range.
    pub end_millis: Option<i64>,
}

impl WatchState {
    /// Record that `event` reached the sink.
    pub fn record_written(&mut self, event: &UpdateEvent) {
        if self.start_millis.is_none() {
            self.start_millis = Some(event.timestamp_millis);
        }
        self.end_millis = Some(event.timestamp_millis);
        self.last_written_value = Some(event.value.clone());
    }

    /// Widen the written range with one already held by the store.
    pub fn seed_range(&mut self, start_millis: i64, end_millis: i64) {
        self.start_millis = Some(self.start_millis.map_or(start_millis, |s| s.min(start_millis)));
        self.end_millis = Some(self.end_millis.map_or(end_millis, |e| e.max(end_millis)));
    }
}

/// Decide whether `event` is persisted and update `state` accordingly.
///
/// The displayed value is always replaced by the event's value, persisted or not.
pub fn evaluate(mode: LoggingMode, state: &mut WatchState, event: &UpdateEvent) -> bool {
    let previous = state.current_value.replace(event.value.clone());

    match mode {
        LoggingMode::None => false,
        LoggingMode::AllData => true,
        LoggingMode::Interval(period_millis) => {
            let elapsed = event.timestamp_millis.saturating_sub(state.last_interval_update_millis);
            if elapsed > period_millis as i64 {
                state.last_interval_update_millis = event.timestamp_millis;
                true
            } else {
                false
            }
        }
        LoggingMode::PointChange => previous.as_ref() != Some(&event.value),
        LoggingMode::PointTime => match previous {
            Some(previous) if !previous.is_null() => previous.time_component() != event.value.time_component(),
            _ => false,
        },
    }
}
