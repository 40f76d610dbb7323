//! Sink records and the backends that persist them
//!
//! Every backend writes one JSON object per line:
//!
//! ```text
//! {"timestamp":1438768800000,"path":"/sensors/temp","value":21.5}
//! ```

pub mod jsonl;
pub mod memory;
pub mod tcp;

pub use jsonl::{JsonlConnector, JsonlSink};
pub use memory::{MemoryConnector, MemorySink};
pub use tcp::{TcpConnector, TcpSink};

use crate::event::{UpdateEvent, Value};
use crate::supervisor::{ConnectionError, ConnectionSupervisor, Connector};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinkRecord {
    pub timestamp: i64,
    pub path: String,
    pub value: Value,
}

impl From<&UpdateEvent> for SinkRecord {
    fn from(event: &UpdateEvent) -> Self {
        Self {
            timestamp: event.timestamp_millis,
            path: event.path.clone(),
            value: event.value.clone(),
        }
    }
}

impl SinkRecord {
    pub fn to_line(&self) -> Result<String, SinkWriteError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug)]
pub enum SinkWriteError {
    Io(std::io::Error),
    Serialization(serde_json::Error),
    Connection(ConnectionError),
}

impl SinkWriteError {
    /// Classification handed to the supervisor when a write fails.
    pub fn to_connection_error(&self) -> ConnectionError {
        match self {
            SinkWriteError::Io(e) => ConnectionError::Io(e.to_string()),
            SinkWriteError::Serialization(e) => ConnectionError::Protocol(e.to_string()),
            SinkWriteError::Connection(e) => e.clone(),
        }
    }
}

impl From<std::io::Error> for SinkWriteError {
    fn from(err: std::io::Error) -> Self {
        SinkWriteError::Io(err)
    }
}

impl From<serde_json::Error> for SinkWriteError {
    fn from(err: serde_json::Error) -> Self {
        SinkWriteError::Serialization(err)
    }
}

impl From<ConnectionError> for SinkWriteError {
    fn from(err: ConnectionError) -> Self {
        SinkWriteError::Connection(err)
    }
}

impl std::fmt::Display for SinkWriteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SinkWriteError::Io(e) => write!(f, "IO error: {}", e),
            SinkWriteError::Serialization(e) => write!(f, "Serialization error: {}", e),
            SinkWriteError::Connection(e) => write!(f, "Sink unavailable: {}", e),
        }
    }
}

impl std::error::Error for SinkWriteError {}

/// A live, shareable sink handle.
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Write a single record. Nothing is acknowledged by the other side.
    async fn write_record(&self, record: &SinkRecord) -> Result<(), SinkWriteError>;

    /// Flush pending writes to storage
    async fn flush(&self) -> Result<(), SinkWriteError>;

    /// Get backend type for logging
    fn backend_type(&self) -> &'static str;
}

/// Where watch groups get their writable handle from.
///
/// Implemented for every supervisor whose connector yields a `RecordSink`, so
/// groups need not know which backend is configured.
#[async_trait]
pub trait SinkProvider: Send + Sync {
    async fn acquire_sink(&self) -> Result<Arc<dyn RecordSink>, ConnectionError>;

    fn invalidate_sink(&self, reason: &ConnectionError) -> bool;

    fn shutdown(&self);

    fn endpoint(&self) -> String;
}

#[async_trait]
impl<C> SinkProvider for ConnectionSupervisor<C>
where
    C: Connector,
    C::Handle: RecordSink,
{
    async fn acquire_sink(&self) -> Result<Arc<dyn RecordSink>, ConnectionError> {
        let handle: Arc<dyn RecordSink> = self.acquire().await?;
        Ok(handle)
    }

    fn invalidate_sink(&self, reason: &ConnectionError) -> bool {
        self.invalidate(reason)
    }

    fn shutdown(&self) {
        ConnectionSupervisor::shutdown(self)
    }

    fn endpoint(&self) -> String {
        self.connector().endpoint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::WatchId;

    #[test]
    fn test_record_line_format() {
        let event = UpdateEvent::new(WatchId(3), "/plant/boiler/temp", Value::Number(21.5), 1_438_768_800_000);
        let line = SinkRecord::from(&event).to_line().unwrap();
        assert_eq!(
            line,
            r#"{"timestamp":1438768800000,"path":"/plant/boiler/temp","value":21.5}"#
        );
    }

    #[test]
    fn test_record_parses_back() {
        let line = r#"{"timestamp":5,"path":"/a","value":{"time":7}}"#;
        let record: SinkRecord = serde_json::from_str(line).unwrap();
        assert_eq!(record.value, Value::Time(7));
    }
}
