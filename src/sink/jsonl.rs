use crate::sink::{RecordSink, SinkRecord, SinkWriteError};
use crate::supervisor::{ConnectionError, Connector};
use async_trait::async_trait;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

struct JsonlFile {
    file: BufWriter<File>,
    current_size: u64,
    rotation_count: u32,
}

/// Append-only JSONL file with size-based rotation.
pub struct JsonlSink {
    inner: Mutex<JsonlFile>,
    max_size: u64,
    base_path: PathBuf,
    max_rotations: u32,
}

impl JsonlSink {
    pub fn new(path: impl AsRef<Path>, max_size_mb: u64, max_rotations: u32) -> Result<Self, SinkWriteError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let current_size = file.metadata()?.len();

        Ok(Self {
            inner: Mutex::new(JsonlFile {
                file: BufWriter::new(file),
                current_size,
                rotation_count: 0,
            }),
            max_size: max_size_mb.saturating_mul(1024 * 1024),
            base_path: path.to_path_buf(),
            max_rotations,
        })
    }

    pub fn path(&self) -> &Path {
        &self.base_path
    }

    pub fn write_line(&self, record: &SinkRecord) -> Result<(), SinkWriteError> {
        let json = record.to_line()?;
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());

        writeln!(inner.file, "{}", json)?;
        inner.file.flush()?;
        inner.current_size += (json.len() + 1) as u64;

        if self.max_size > 0 && inner.current_size >= self.max_size {
            self.rotate(&mut inner)?;
        }

        Ok(())
    }

    fn rotate(&self, inner: &mut JsonlFile) -> Result<(), SinkWriteError> {
        inner.file.flush()?;

        if self.max_rotations == 0 {
            // No history kept: start the file over
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&self.base_path)?;
            inner.file = BufWriter::new(file);
            inner.current_size = 0;
            return Ok(());
        }

        for i in (1..self.max_rotations).rev() {
            let old_path = self.rotated_path(i);
            if old_path.exists() {
                std::fs::rename(&old_path, self.rotated_path(i + 1))?;
            }
        }

        if self.base_path.exists() {
            std::fs::rename(&self.base_path, self.rotated_path(1))?;
        }

        let file = OpenOptions::new().create(true).append(true).open(&self.base_path)?;

        inner.file = BufWriter::new(file);
        inner.current_size = 0;
        inner.rotation_count += 1;

        log::info!("📄 Rotated sink file (rotation #{})", inner.rotation_count);

        Ok(())
    }

    fn rotated_path(&self, index: u32) -> PathBuf {
        let mut name = self.base_path.as_os_str().to_os_string();
        name.push(format!(".{}", index));
        PathBuf::from(name)
    }
}

#[async_trait]
impl RecordSink for JsonlSink {
    async fn write_record(&self, record: &SinkRecord) -> Result<(), SinkWriteError> {
        self.write_line(record)
    }

    async fn flush(&self) -> Result<(), SinkWriteError> {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.file.flush()?;
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "JSONL"
    }
}

/// Opens the sink file; the open file is the "connection".
#[derive(Debug, Clone)]
pub struct JsonlConnector {
    pub path: PathBuf,
    pub max_size_mb: u64,
    pub max_rotations: u32,
}

#[async_trait]
impl Connector for JsonlConnector {
    type Handle = JsonlSink;

    async fn connect(&self) -> Result<JsonlSink, ConnectionError> {
        JsonlSink::new(&self.path, self.max_size_mb, self.max_rotations).map_err(|e| e.to_connection_error())
    }

    fn endpoint(&self) -> String {
        format!("file://{}", self.path.display())
    }
}
