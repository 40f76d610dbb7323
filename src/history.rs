//! History query path
//!
//! Replays stored records for one path from the query service, either as raw
//! `(timestamp, value)` rows or reduced through a `Bucketizer`. Results are
//! streamed over a bounded channel; the remote cursor is closed when the
//! stream ends, when the consumer cancels (or drops the stream) and on error.

use crate::event::{Value, WatchId};
use crate::interval::{Bucketizer, IntervalError, Row};
use crate::rollup::RollupError;
use crate::runtime::SchedulingContext;
use crate::scheduler::{SchedulerError, WatchGroup};
use crate::supervisor::{ConnectionError, ConnectionSupervisor, Connector};
use crate::timestamp::{decode_millis, TimestampError};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const STREAM_BUFFER: usize = 256;

/// One search request as understood by the query service.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueryRequest {
    pub search: String,
    pub earliest: Option<String>,
    pub latest: Option<String>,
    /// Keep the search open and stream new results as they arrive.
    pub realtime: bool,
}

impl QueryRequest {
    pub fn new(search: impl Into<String>) -> Self {
        Self {
            search: search.into(),
            ..Self::default()
        }
    }
}

/// A result record: field name to value.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SearchRecord {
    fields: serde_json::Map<String, serde_json::Value>,
}

impl SearchRecord {
    pub fn new(fields: serde_json::Map<String, serde_json::Value>) -> Self {
        Self { fields }
    }

    pub fn from_pairs<K: Into<String>, V: Into<String>>(pairs: impl IntoIterator<Item = (K, V)>) -> Self {
        Self {
            fields: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), serde_json::Value::String(v.into())))
                .collect(),
        }
    }

    /// Field as text. Non-string fields are returned JSON-encoded.
    pub fn get(&self, name: &str) -> Option<String> {
        match self.fields.get(name)? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Null => None,
            other => Some(other.to_string()),
        }
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn fields(&self) -> &serde_json::Map<String, serde_json::Value> {
        &self.fields
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamReadError {
    Io(String),
    /// The response could not be framed or decoded.
    Protocol(String),
    /// A record lacked a usable `time` or carried one that does not parse.
    InvalidRecord(String),
    Rollup(RollupError),
}

impl StreamReadError {
    /// Reason to hand to the supervisor, if this failure means the handle is bad.
    pub fn invalidation(&self) -> Option<ConnectionError> {
        match self {
            StreamReadError::Io(e) => Some(ConnectionError::Io(e.clone())),
            StreamReadError::Protocol(e) => Some(ConnectionError::Protocol(e.clone())),
            StreamReadError::InvalidRecord(_) | StreamReadError::Rollup(_) => None,
        }
    }
}

impl From<RollupError> for StreamReadError {
    fn from(err: RollupError) -> Self {
        StreamReadError::Rollup(err)
    }
}

impl From<std::io::Error> for StreamReadError {
    fn from(err: std::io::Error) -> Self {
        StreamReadError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for StreamReadError {
    fn from(err: serde_json::Error) -> Self {
        StreamReadError::Protocol(err.to_string())
    }
}

impl From<reqwest::Error> for StreamReadError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            StreamReadError::Protocol(err.to_string())
        } else {
            StreamReadError::Io(err.to_string())
        }
    }
}

impl std::fmt::Display for StreamReadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamReadError::Io(e) => write!(f, "Stream read failed: {}", e),
            StreamReadError::Protocol(e) => write!(f, "Malformed result stream: {}", e),
            StreamReadError::InvalidRecord(e) => write!(f, "Invalid record: {}", e),
            StreamReadError::Rollup(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for StreamReadError {}

/// An open, ordered result set.
#[async_trait]
pub trait RecordCursor: Send {
    /// Next record, or `None` once the result set is exhausted.
    async fn next_record(&mut self) -> Result<Option<SearchRecord>, StreamReadError>;

    /// Release the underlying stream. Idempotent.
    async fn close(&mut self);
}

/// A live handle to the query service.
#[async_trait]
pub trait QueryService: Send + Sync {
    async fn export(&self, request: &QueryRequest) -> Result<Box<dyn RecordCursor>, ConnectionError>;
}

#[derive(Debug)]
pub enum HistoryError {
    InvalidRange(String),
    Interval(IntervalError),
    Connection(ConnectionError),
    Read(StreamReadError),
    Scheduler(SchedulerError),
}

impl From<IntervalError> for HistoryError {
    fn from(err: IntervalError) -> Self {
        HistoryError::Interval(err)
    }
}

impl From<ConnectionError> for HistoryError {
    fn from(err: ConnectionError) -> Self {
        HistoryError::Connection(err)
    }
}

impl From<StreamReadError> for HistoryError {
    fn from(err: StreamReadError) -> Self {
        HistoryError::Read(err)
    }
}

impl From<SchedulerError> for HistoryError {
    fn from(err: SchedulerError) -> Self {
        HistoryError::Scheduler(err)
    }
}

impl From<TimestampError> for HistoryError {
    fn from(err: TimestampError) -> Self {
        HistoryError::InvalidRange(err.to_string())
    }
}

impl std::fmt::Display for HistoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HistoryError::InvalidRange(e) => write!(f, "Invalid time range: {}", e),
            HistoryError::Interval(e) => write!(f, "{}", e),
            HistoryError::Connection(e) => write!(f, "{}", e),
            HistoryError::Read(e) => write!(f, "{}", e),
            HistoryError::Scheduler(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for HistoryError {}

/// Inclusive range in epoch millis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub from_millis: i64,
    pub to_millis: i64,
}

impl TimeRange {
    /// Parse `"<from>/<to>"`; each side is RFC 3339 or epoch millis.
    pub fn parse(range: &str) -> Result<Self, HistoryError> {
        let (from, to) = range
            .split_once('/')
            .ok_or_else(|| HistoryError::InvalidRange(format!("expected <from>/<to>, got '{}'", range)))?;

        let from_millis = decode_millis(from)?;
        let to_millis = decode_millis(to)?;
        if from_millis > to_millis {
            return Err(HistoryError::InvalidRange(format!("{} is after {}", from.trim(), to.trim())));
        }

        Ok(Self { from_millis, to_millis })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistoryRequest {
    pub path: String,
    pub range: TimeRange,
    /// Interval spec, or "none" for raw rows.
    pub interval: String,
    pub rollup: String,
}

impl HistoryRequest {
    pub fn raw(path: impl Into<String>, range: TimeRange) -> Self {
        Self {
            path: path.into(),
            range,
            interval: "none".to_string(),
            rollup: "none".to_string(),
        }
    }

    /// Search selecting the path's records inside the range, oldest first.
    pub fn search(&self) -> String {
        let path = self.path.replace('\\', "\\\\").replace('"', "\\\"");
        format!(
            "search path=\"{}\" | spath output=time path=timestamp | spath value \
             | where time >= {} and time <= {} | sort time | table time value",
            path, self.range.from_millis, self.range.to_millis
        )
    }
}

/// Search yielding one record with the earliest (`start`) and latest (`end`)
/// stored time for `path`.
fn stored_range_search(path: &str) -> String {
    let path = path.replace('\\', "\\\\").replace('"', "\\\"");
    format!(
        "search path=\"{}\" | spath output=time path=timestamp | where time > 0 \
         | stats min(time) as start max(time) as end",
        path
    )
}

/// Results of a running query. Dropping it cancels the query.
pub struct ResultStream<T> {
    rx: mpsc::Receiver<Result<T, StreamReadError>>,
    task: JoinHandle<()>,
}

impl<T> ResultStream<T> {
    /// Next result. An `Err` is always the last item.
    pub async fn next(&mut self) -> Option<Result<T, StreamReadError>> {
        self.rx.recv().await
    }

    /// Stop reading. Resolves once the remote cursor is closed.
    pub async fn cancel(self) {
        let Self { rx, task } = self;
        drop(rx);
        let _ = task.await;
    }

    /// Read to the end; the first error aborts.
    pub async fn collect(mut self) -> Result<Vec<T>, StreamReadError> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await {
            items.push(item?);
        }
        Ok(items)
    }
}

/// History and free-form search over a supervised query service.
pub struct History<C: Connector> {
    supervisor: Arc<ConnectionSupervisor<C>>,
    ctx: SchedulingContext,
}

impl<C> History<C>
where
    C: Connector,
    C::Handle: QueryService,
{
    pub fn new(supervisor: Arc<ConnectionSupervisor<C>>, ctx: SchedulingContext) -> Self {
        Self { supervisor, ctx }
    }

    pub fn supervisor(&self) -> &Arc<ConnectionSupervisor<C>> {
        &self.supervisor
    }

    /// Stream the rows of `request`.
    ///
    /// Interval and rollup are validated before anything is sent.
    pub async fn query(&self, request: &HistoryRequest) -> Result<ResultStream<Row>, HistoryError> {
        let bucketizer = Bucketizer::parse(&request.interval, &request.rollup)?;
        let search = request.search();
        log::debug!("History query: {}", search);

        let cursor = self.open(&QueryRequest::new(search)).await?;
        Ok(self.spawn_stream(cursor, RowCollector { bucketizer }))
    }

    /// Run a free-form search, streaming its records until exhausted or cancelled.
    pub async fn run_search(&self, request: &QueryRequest) -> Result<ResultStream<SearchRecord>, HistoryError> {
        log::debug!("Search (realtime: {}): {}", request.realtime, request.search);
        let cursor = self.open(request).await?;
        Ok(self.spawn_stream(cursor, PassThrough))
    }

    /// Earliest and latest stored timestamps for `path`, or `None` when
    /// nothing has been stored yet.
    pub async fn stored_range(&self, path: &str) -> Result<Option<(i64, i64)>, HistoryError> {
        let mut records = self.run_search(&QueryRequest::new(stored_range_search(path))).await?;
        let first = records.next().await;
        records.cancel().await;

        let record = match first {
            Some(record) => record?,
            None => return Ok(None),
        };
        let field = |name: &str| record.get(name).filter(|v| !v.trim().is_empty());
        match (field("start"), field("end")) {
            (Some(start), Some(end)) => Ok(Some((parse_time(&start)?, parse_time(&end)?))),
            _ => Ok(None),
        }
    }

    /// Seed a watch's written range from the store. Returns whether anything
    /// was stored for its path.
    pub async fn seed_watch(&self, group: &WatchGroup, id: WatchId) -> Result<bool, HistoryError> {
        let path = group.snapshot(id).ok_or(SchedulerError::UnknownWatch(id))?.path;
        match self.stored_range(&path).await? {
            Some((start, end)) => {
                group.seed_range(id, start, end)?;
                log::info!("📚 {} has stored history from {} to {}", path, start, end);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn open(&self, request: &QueryRequest) -> Result<Box<dyn RecordCursor>, HistoryError> {
        let service = self.supervisor.acquire().await?;
        match service.export(request).await {
            Ok(cursor) => Ok(cursor),
            Err(e) => {
                self.supervisor.invalidate(&e);
                Err(HistoryError::Connection(e))
            }
        }
    }

    fn spawn_stream<K: Collector>(&self, mut cursor: Box<dyn RecordCursor>, mut collector: K) -> ResultStream<K::Item> {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let supervisor = self.supervisor.clone();

        let task = self.ctx.spawn(async move {
            let outcome = pump_cursor(cursor.as_mut(), &tx, &mut collector).await;
            cursor.close().await;

            match outcome {
                Ok(Flow::Finished(count)) => log::debug!("Query finished ({} results)", count),
                Ok(Flow::Cancelled) => log::debug!("Query cancelled by consumer"),
                Err(e) => {
                    log::error!("❌ Query aborted: {}", e);
                    if let Some(reason) = e.invalidation() {
                        supervisor.invalidate(&reason);
                    }
                    let _ = tx.send(Err(e)).await;
                }
            }
        });

        ResultStream { rx, task }
    }
}

enum Flow {
    Finished(usize),
    Cancelled,
}

/// Turns search records into stream items.
trait Collector: Send + 'static {
    type Item: Send + 'static;

    fn offer(&mut self, record: SearchRecord) -> Result<Option<Self::Item>, StreamReadError>;

    fn finish(&mut self) -> Option<Self::Item>;
}

struct PassThrough;

impl Collector for PassThrough {
    type Item = SearchRecord;

    fn offer(&mut self, record: SearchRecord) -> Result<Option<SearchRecord>, StreamReadError> {
        Ok(Some(record))
    }

    fn finish(&mut self) -> Option<SearchRecord> {
        None
    }
}

struct RowCollector {
    bucketizer: Option<Bucketizer>,
}

impl Collector for RowCollector {
    type Item = Row;

    fn offer(&mut self, record: SearchRecord) -> Result<Option<Row>, StreamReadError> {
        let (timestamp_millis, value) = sample(&record)?;
        match self.bucketizer.as_mut() {
            Some(bucketizer) => Ok(bucketizer.offer(value, timestamp_millis)?),
            None => Ok(Some(Row::new(timestamp_millis, value))),
        }
    }

    fn finish(&mut self) -> Option<Row> {
        self.bucketizer.as_mut().and_then(Bucketizer::finish)
    }
}

async fn pump_cursor<K: Collector>(
    cursor: &mut dyn RecordCursor,
    tx: &mpsc::Sender<Result<K::Item, StreamReadError>>,
    collector: &mut K,
) -> Result<Flow, StreamReadError> {
    let mut sent = 0;

    loop {
        let next = tokio::select! {
            _ = tx.closed() => return Ok(Flow::Cancelled),
            next = cursor.next_record() => next?,
        };
        let Some(record) = next else {
            break;
        };

        if let Some(item) = collector.offer(record)? {
            if tx.send(Ok(item)).await.is_err() {
                return Ok(Flow::Cancelled);
            }
            sent += 1;
        }
    }

    if let Some(item) = collector.finish() {
        if tx.send(Ok(item)).await.is_err() {
            return Ok(Flow::Cancelled);
        }
        sent += 1;
    }

    Ok(Flow::Finished(sent))
}

/// Extract `(timestamp, value)` from a stored record.
///
/// Reads the `time`/`value` fields, falling back to the raw JSON line.
fn sample(record: &SearchRecord) -> Result<(i64, Value), StreamReadError> {
    if let Some(time) = record.get("time") {
        let value = record
            .get("value")
            .map(|encoded| Value::from_encoded(&encoded))
            .unwrap_or(Value::Null);
        return Ok((parse_time(&time)?, value));
    }

    let raw = record
        .get("_raw")
        .ok_or_else(|| StreamReadError::InvalidRecord("record has no time".to_string()))?;
    let json: serde_json::Value =
        serde_json::from_str(&raw).map_err(|e| StreamReadError::InvalidRecord(e.to_string()))?;

    let time = json
        .get("time")
        .or_else(|| json.get("timestamp"))
        .and_then(|t| t.as_i64().or_else(|| t.as_f64().map(|f| f as i64)))
        .ok_or_else(|| StreamReadError::InvalidRecord(format!("no time in {}", raw)))?;
    let value = json.get("value").map(Value::from_json).unwrap_or(Value::Null);

    Ok((time, value))
}

fn parse_time(time: &str) -> Result<i64, StreamReadError> {
    let time = time.trim();
    if let Ok(ms) = time.parse::<i64>() {
        return Ok(ms);
    }
    match time.parse::<f64>() {
        Ok(ms) if ms.is_finite() => Ok(ms as i64),
        _ => Err(StreamReadError::InvalidRecord(format!("bad time '{}'", time))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_range_parse() {
        let range = TimeRange::parse("2015-08-05T10:00:00Z/2015-08-05T11:00:00.000Z").unwrap();
        assert_eq!(range.from_millis, 1_438_768_800_000);
        assert_eq!(range.to_millis, 1_438_772_400_000);

        let range = TimeRange::parse("0/5000").unwrap();
        assert_eq!(range, TimeRange { from_millis: 0, to_millis: 5000 });

        assert!(matches!(TimeRange::parse("0"), Err(HistoryError::InvalidRange(_))));
        assert!(matches!(TimeRange::parse("5000/0"), Err(HistoryError::InvalidRange(_))));
        assert!(matches!(TimeRange::parse("soon/later"), Err(HistoryError::InvalidRange(_))));
    }

    #[test]
    fn test_search_expression() {
        let request = HistoryRequest::raw("/plant/\"boiler\"", TimeRange { from_millis: 1, to_millis: 2 });
        assert_eq!(
            request.search(),
            "search path=\"/plant/\\\"boiler\\\"\" | spath output=time path=timestamp | spath value \
             | where time >= 1 and time <= 2 | sort time | table time value"
        );
    }

    #[test]
    fn test_sample_from_fields_and_raw() {
        let record = SearchRecord::from_pairs([("time", "1000"), ("value", "{\"time\":7}")]);
        assert_eq!(sample(&record).unwrap(), (1000, Value::Time(7)));

        let record = SearchRecord::from_pairs([("time", "1.5e3"), ("value", "hello")]);
        assert_eq!(sample(&record).unwrap(), (1500, Value::String("hello".into())));

        let record = SearchRecord::from_pairs([("_raw", r#"{"timestamp":42,"path":"/a","value":true}"#)]);
        assert_eq!(sample(&record).unwrap(), (42, Value::Bool(true)));

        let record = SearchRecord::from_pairs([("value", "1")]);
        assert!(matches!(sample(&record), Err(StreamReadError::InvalidRecord(_))));
    }

    #[test]
    fn test_read_errors_classify() {
        assert!(StreamReadError::Io("reset".into()).invalidation().is_some());
        assert!(StreamReadError::Protocol("eof in object".into()).invalidation().is_some());
        assert!(StreamReadError::InvalidRecord("x".into()).invalidation().is_none());
    }
}
