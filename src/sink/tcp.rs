use crate::sink::{RecordSink, SinkRecord, SinkWriteError};
use crate::supervisor::{ConnectionError, Connector};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

/// Newline-delimited JSON over one persistent TCP stream.
pub struct TcpSink {
    stream: Mutex<BufWriter<TcpStream>>,
    peer: String,
}

impl TcpSink {
    pub fn new(stream: TcpStream, peer: impl Into<String>) -> Self {
        Self {
            stream: Mutex::new(BufWriter::new(stream)),
            peer: peer.into(),
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }
}

#[async_trait]
impl RecordSink for TcpSink {
    async fn write_record(&self, record: &SinkRecord) -> Result<(), SinkWriteError> {
        let mut line = record.to_line()?;
        line.push('\n');

        let mut stream = self.stream.lock().await;
        stream.write_all(line.as_bytes()).await?;
        stream.flush().await?;
        Ok(())
    }

    async fn flush(&self) -> Result<(), SinkWriteError> {
        self.stream.lock().await.flush().await?;
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "TCP"
    }
}

#[derive(Debug, Clone)]
pub struct TcpConnector {
    pub addr: String,
    pub connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    type Handle = TcpSink;

    async fn connect(&self) -> Result<TcpSink, ConnectionError> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| ConnectionError::Io(format!("connect to {} timed out", self.addr)))??;
        stream.set_nodelay(true)?;
        Ok(TcpSink::new(stream, self.addr.clone()))
    }

    fn endpoint(&self) -> String {
        format!("tcp://{}", self.addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Value;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_streams_one_line_per_record() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let reader = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut lines = BufReader::new(socket).lines();
            let mut received = Vec::new();
            while let Some(line) = lines.next_line().await.unwrap() {
                received.push(line);
            }
            received
        });

        let sink = TcpConnector::new(addr).connect().await.unwrap();
        for i in 0..3 {
            let record = SinkRecord {
                timestamp: i,
                path: "/tcp/test".to_string(),
                value: Value::Bool(i % 2 == 0),
            };
            sink.write_record(&record).await.unwrap();
        }
        drop(sink);

        let received = reader.await.unwrap();
        assert_eq!(received.len(), 3);
        assert_eq!(received[2], r#"{"timestamp":2,"path":"/tcp/test","value":true}"#);
    }

    #[tokio::test]
    async fn test_refused_connection_is_io_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let result = TcpConnector::new(addr).connect().await;
        assert!(matches!(result, Err(ConnectionError::Io(_))));
    }
}
