//! HTTP query-service adapter
//!
//! Talks to a search head's REST API: the connection check hits
//! `services/server/info`, searches stream from `services/search/jobs/export`
//! with `output_mode=json`, one JSON object per line:
//!
//! ```text
//! {"preview":false,"offset":0,"result":{"time":"1438768800000","value":"21.5"}}
//! ```

use crate::history::{QueryRequest, QueryService, RecordCursor, SearchRecord, StreamReadError};
use crate::supervisor::{ConnectionError, Connector};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct HttpQueryConnector {
    pub base_url: String,
    pub credentials: Option<Credentials>,
    pub connect_timeout: Duration,
    /// Route through `HTTP_PROXY`/`HTTPS_PROXY` when set.
    pub use_system_proxy: bool,
}

impl HttpQueryConnector {
    pub fn new(base_url: impl Into<String>, credentials: Option<Credentials>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
            connect_timeout: Duration::from_secs(10),
            use_system_proxy: true,
        }
    }
}

#[async_trait]
impl Connector for HttpQueryConnector {
    type Handle = HttpQueryService;

    async fn connect(&self) -> Result<HttpQueryService, ConnectionError> {
        let mut builder = reqwest::Client::builder().connect_timeout(self.connect_timeout);
        if !self.use_system_proxy {
            builder = builder.no_proxy();
        }
        let client = builder.build()?;

        let service = HttpQueryService {
            client,
            base_url: self.base_url.clone(),
            credentials: self.credentials.clone(),
        };

        // Fails fast on bad credentials (401) instead of on the first search
        service
            .request(reqwest::Method::GET, "services/server/info")
            .query(&[("output_mode", "json")])
            .send()
            .await?
            .error_for_status()?;

        Ok(service)
    }

    fn endpoint(&self) -> String {
        self.base_url.clone()
    }
}

pub struct HttpQueryService {
    client: reqwest::Client,
    base_url: String,
    credentials: Option<Credentials>,
}

impl HttpQueryService {
    fn request(&self, method: reqwest::Method, endpoint: &str) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}/{}", self.base_url, endpoint));
        match &self.credentials {
            Some(credentials) => builder.basic_auth(&credentials.username, Some(&credentials.password)),
            None => builder,
        }
    }
}

#[async_trait]
impl QueryService for HttpQueryService {
    async fn export(&self, request: &QueryRequest) -> Result<Box<dyn RecordCursor>, ConnectionError> {
        let response = self
            .request(reqwest::Method::POST, "services/search/jobs/export")
            .form(&export_params(request))
            .send()
            .await?
            .error_for_status()?;

        Ok(Box::new(ExportCursor::new(response)))
    }
}

fn export_params(request: &QueryRequest) -> Vec<(&'static str, String)> {
    let search = request.search.trim_start();
    let search = if search.starts_with("search") || search.starts_with('|') {
        search.to_string()
    } else {
        format!("search {}", search)
    };

    let mut params = vec![
        ("search", search),
        ("output_mode", "json".to_string()),
        ("preview", "false".to_string()),
    ];
    if let Some(earliest) = &request.earliest {
        params.push(("earliest_time", earliest.clone()));
    }
    if let Some(latest) = &request.latest {
        params.push(("latest_time", latest.clone()));
    }
    // A latest time of "rt" implies a real-time search
    let realtime = request.realtime || request.latest.as_deref() == Some("rt");
    if realtime {
        params.push(("search_mode", "realtime".to_string()));
    }
    params
}

/// Reads the export body chunk by chunk and splits it into JSON lines.
pub struct ExportCursor {
    response: Option<reqwest::Response>,
    buffer: Vec<u8>,
    pending: VecDeque<SearchRecord>,
}

impl ExportCursor {
    fn new(response: reqwest::Response) -> Self {
        Self {
            response: Some(response),
            buffer: Vec::new(),
            pending: VecDeque::new(),
        }
    }

    fn parse_buffered(&mut self, at_end: bool) -> Result<(), StreamReadError> {
        while let Some(newline) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            if let Some(record) = parse_export_line(&line)? {
                self.pending.push_back(record);
            }
        }

        if at_end && !self.buffer.is_empty() {
            let line = std::mem::take(&mut self.buffer);
            if let Some(record) = parse_export_line(&line)? {
                self.pending.push_back(record);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RecordCursor for ExportCursor {
    async fn next_record(&mut self) -> Result<Option<SearchRecord>, StreamReadError> {
        loop {
            if let Some(record) = self.pending.pop_front() {
                return Ok(Some(record));
            }

            let Some(response) = self.response.as_mut() else {
                return Ok(None);
            };

            match response.chunk().await? {
                Some(chunk) => {
                    self.buffer.extend_from_slice(&chunk);
                    self.parse_buffered(false)?;
                }
                None => {
                    self.response = None;
                    self.parse_buffered(true)?;
                }
            }
        }
    }

    async fn close(&mut self) {
        // Dropping the response releases the connection
        self.response = None;
        self.buffer.clear();
        self.pending.clear();
    }
}

/// One export line. Lines without a `result` object (progress, messages,
/// `lastrow` markers) yield `None`.
fn parse_export_line(line: &[u8]) -> Result<Option<SearchRecord>, StreamReadError> {
    let line = line.trim_ascii();
    if line.is_empty() {
        return Ok(None);
    }

    let json: serde_json::Value = serde_json::from_slice(line)?;
    match json.get("result") {
        Some(serde_json::Value::Object(fields)) => Ok(Some(SearchRecord::new(fields.clone()))),
        _ => Ok(None),
    }
}
