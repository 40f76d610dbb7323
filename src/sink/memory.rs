use crate::sink::{RecordSink, SinkRecord, SinkWriteError};
use crate::supervisor::{ConnectionError, Connector};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};

/// In-process sink. Clones share the same record list.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<SinkRecord>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<SinkRecord> {
        self.records.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RecordSink for MemorySink {
    async fn write_record(&self, record: &SinkRecord) -> Result<(), SinkWriteError> {
        self.records
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(record.clone());
        Ok(())
    }

    async fn flush(&self) -> Result<(), SinkWriteError> {
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "Memory"
    }
}

/// Hands out clones of one shared `MemorySink`.
#[derive(Debug, Clone, Default)]
pub struct MemoryConnector {
    sink: MemorySink,
}

impl MemoryConnector {
    pub fn new(sink: MemorySink) -> Self {
        Self { sink }
    }

    pub fn sink(&self) -> &MemorySink {
        &self.sink
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    type Handle = MemorySink;

    async fn connect(&self) -> Result<MemorySink, ConnectionError> {
        Ok(self.sink.clone())
    }

    fn endpoint(&self) -> String {
        "memory://".to_string()
    }
}
