//! Integration tests for the history query path against a scripted query service
//!
//! Verifies row shaping (raw and bucketized) and that the remote cursor is
//! closed on completion, on consumer cancellation and on read errors.

#[cfg(test)]
mod history_integration_tests {
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use watchlog::history::{
        History, HistoryError, HistoryRequest, QueryRequest, QueryService, RecordCursor, SearchRecord,
        StreamReadError, TimeRange,
    };
    use watchlog::feed::ChannelFeed;
    use watchlog::scheduler::{GroupConfig, WatchGroup};
    use watchlog::sink::{MemoryConnector, MemorySink};
    use watchlog::supervisor::{ConnectionError, ConnectionSupervisor, Connector, RetryPolicy};
    use watchlog::{IntervalError, LoggingMode, SchedulingContext, UpdateEvent, Value};

    #[derive(Clone, Default)]
    struct Script {
        records: Vec<SearchRecord>,
        /// Fail with an I/O error after serving this many records.
        fail_after: Option<usize>,
        /// Never end; wait for more results like a real-time search.
        endless: bool,
        reject_export: bool,
    }

    struct ScriptedCursor {
        records: VecDeque<SearchRecord>,
        script: Script,
        served: usize,
        closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl RecordCursor for ScriptedCursor {
        async fn next_record(&mut self) -> Result<Option<SearchRecord>, StreamReadError> {
            if self.script.fail_after == Some(self.served) {
                return Err(StreamReadError::Io("connection reset by peer".to_string()));
            }
            match self.records.pop_front() {
                Some(record) => {
                    self.served += 1;
                    Ok(Some(record))
                }
                None if self.script.endless => std::future::pending().await,
                None => Ok(None),
            }
        }

        async fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    struct ScriptedService {
        script: Script,
        closed: Arc<AtomicBool>,
        searches: Arc<Mutex<Vec<QueryRequest>>>,
    }

    #[async_trait]
    impl QueryService for ScriptedService {
        async fn export(&self, request: &QueryRequest) -> Result<Box<dyn RecordCursor>, ConnectionError> {
            self.searches.lock().unwrap().push(request.clone());
            if self.script.reject_export {
                return Err(ConnectionError::Unauthorized("HTTP 401".to_string()));
            }
            Ok(Box::new(ScriptedCursor {
                records: self.script.records.iter().cloned().collect(),
                script: self.script.clone(),
                served: 0,
                closed: self.closed.clone(),
            }))
        }
    }

    struct ScriptedConnector {
        script: Script,
        closed: Arc<AtomicBool>,
        searches: Arc<Mutex<Vec<QueryRequest>>>,
        connects: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        type Handle = ScriptedService;

        async fn connect(&self) -> Result<ScriptedService, ConnectionError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(ScriptedService {
                script: self.script.clone(),
                closed: self.closed.clone(),
                searches: self.searches.clone(),
            })
        }

        fn endpoint(&self) -> String {
            "scripted://".to_string()
        }
    }

    struct Fixture {
        history: History<ScriptedConnector>,
        closed: Arc<AtomicBool>,
        searches: Arc<Mutex<Vec<QueryRequest>>>,
        connects: Arc<AtomicU32>,
    }

    fn fixture(script: Script) -> Fixture {
        let closed = Arc::new(AtomicBool::new(false));
        let searches = Arc::new(Mutex::new(Vec::new()));
        let connects = Arc::new(AtomicU32::new(0));
        let supervisor = Arc::new(ConnectionSupervisor::new(
            ScriptedConnector {
                script,
                closed: closed.clone(),
                searches: searches.clone(),
                connects: connects.clone(),
            },
            RetryPolicy::default(),
            SchedulingContext::current(),
        ));
        Fixture {
            history: History::new(supervisor, SchedulingContext::current()),
            closed,
            searches,
            connects,
        }
    }

    fn sample(time_millis: i64, value: &str) -> SearchRecord {
        SearchRecord::from_pairs([("time", time_millis.to_string()), ("value", value.to_string())])
    }

    fn range() -> TimeRange {
        TimeRange::parse("0/3600000").unwrap()
    }

    #[tokio::test]
    async fn test_raw_rows_pass_through() {
        let f = fixture(Script {
            records: vec![sample(1_000, "21.5"), sample(2_000, "\"open\""), sample(3_000, "{\"time\":5}")],
            ..Script::default()
        });

        let rows = f
            .history
            .query(&HistoryRequest::raw("/plant/temp", range()))
            .await
            .unwrap()
            .collect()
            .await
            .unwrap();

        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].timestamp, "1970-01-01T00:00:01.000Z");
        assert_eq!(rows[0].value, Value::Number(21.5));
        assert_eq!(rows[1].value, Value::String("open".to_string()));
        assert_eq!(rows[2].value, Value::Time(5));
        assert!(f.closed.load(Ordering::SeqCst));

        let searches = f.searches.lock().unwrap();
        assert!(searches[0].search.starts_with("search path=\"/plant/temp\""));
        assert!(searches[0].search.contains("where time >= 0 and time <= 3600000"));
    }

    #[tokio::test]
    async fn test_bucketized_average() {
        let f = fixture(Script {
            records: vec![
                sample(0, "10"),
                sample(60_000, "20"),
                sample(120_000, "30"),
                sample(300_000, "50"),
                sample(301_000, "70"),
            ],
            ..Script::default()
        });

        let request = HistoryRequest {
            interval: "5m".to_string(),
            rollup: "avg".to_string(),
            ..HistoryRequest::raw("/plant/temp", range())
        };
        let rows = f.history.query(&request).await.unwrap().collect().await.unwrap();

        let shaped: Vec<(i64, Value)> = rows.into_iter().map(|r| (r.timestamp_millis, r.value)).collect();
        assert_eq!(
            shaped,
            vec![(0, Value::Number(20.0)), (300_000, Value::Number(60.0))]
        );
        assert!(f.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_bad_rollup_rejected_before_connecting() {
        let f = fixture(Script::default());
        let request = HistoryRequest {
            interval: "5m".to_string(),
            rollup: "median".to_string(),
            ..HistoryRequest::raw("/plant/temp", range())
        };

        match f.history.query(&request).await {
            Err(HistoryError::Interval(IntervalError::UnknownRollup(name))) => assert_eq!(name, "median"),
            Err(e) => panic!("unexpected error: {}", e),
            Ok(_) => panic!("median is not a rollup"),
        }
        assert_eq!(f.connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancel_closes_cursor() {
        let f = fixture(Script {
            records: vec![sample(1_000, "1")],
            endless: true,
            ..Script::default()
        });

        let mut rows = f.history.query(&HistoryRequest::raw("/plant/temp", range())).await.unwrap();
        let first = rows.next().await.unwrap().unwrap();
        assert_eq!(first.value, Value::Number(1.0));
        assert!(!f.closed.load(Ordering::SeqCst));

        rows.cancel().await;
        assert!(f.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_read_error_closes_cursor_and_invalidates() {
        let f = fixture(Script {
            records: vec![sample(1_000, "1"), sample(2_000, "2")],
            fail_after: Some(1),
            ..Script::default()
        });

        let mut rows = f.history.query(&HistoryRequest::raw("/plant/temp", range())).await.unwrap();
        assert!(rows.next().await.unwrap().is_ok());
        match rows.next().await {
            Some(Err(StreamReadError::Io(_))) => {}
            other => panic!("expected read error, got {:?}", other),
        }
        assert!(rows.next().await.is_none());
        assert!(f.closed.load(Ordering::SeqCst));

        // The broken handle was dropped: the next query reconnects
        assert!(f.history.supervisor().current().is_none());
        let _ = f.history.query(&HistoryRequest::raw("/plant/temp", range())).await.unwrap();
        assert_eq!(f.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_rejected_export_invalidates_handle() {
        let f = fixture(Script {
            reject_export: true,
            ..Script::default()
        });

        match f.history.query(&HistoryRequest::raw("/plant/temp", range())).await {
            Err(HistoryError::Connection(ConnectionError::Unauthorized(_))) => {}
            Err(e) => panic!("unexpected error: {}", e),
            Ok(_) => panic!("export should have been rejected"),
        }
        assert!(f.history.supervisor().current().is_none());
    }

    #[tokio::test]
    async fn test_realtime_search_streams_until_cancelled() {
        let f = fixture(Script {
            records: vec![
                SearchRecord::from_pairs([("host", "boiler-1"), ("status", "ok")]),
                SearchRecord::from_pairs([("host", "boiler-2"), ("status", "alarm")]),
            ],
            endless: true,
            ..Script::default()
        });

        let request = QueryRequest {
            search: "search index=plant".to_string(),
            earliest: Some("rt-1m".to_string()),
            latest: Some("rt".to_string()),
            realtime: true,
        };
        let mut records = f.history.run_search(&request).await.unwrap();

        let first = records.next().await.unwrap().unwrap();
        let second = records.next().await.unwrap().unwrap();
        assert_eq!(first.get("host").as_deref(), Some("boiler-1"));
        assert_eq!(second.get("status").as_deref(), Some("alarm"));

        records.cancel().await;
        assert!(f.closed.load(Ordering::SeqCst));
        assert_eq!(f.searches.lock().unwrap()[0], request);
    }

    fn memory_group(sink: &MemorySink) -> WatchGroup {
        WatchGroup::new(
            "plant",
            GroupConfig {
                write_period_secs: 0,
                logging_mode: LoggingMode::AllData,
            },
            Arc::new(ConnectionSupervisor::new(
                MemoryConnector::new(sink.clone()),
                RetryPolicy::default(),
                SchedulingContext::current(),
            )),
            Arc::new(ChannelFeed::new()),
            SchedulingContext::current(),
        )
    }

    #[tokio::test]
    async fn test_watch_range_seeded_from_store() {
        let f = fixture(Script {
            records: vec![SearchRecord::from_pairs([("start", "1000"), ("end", "9000")])],
            ..Script::default()
        });
        let sink = MemorySink::new();
        let group = memory_group(&sink);
        let id = group.add_watch("/plant/temp", false).unwrap();

        assert!(f.history.seed_watch(&group, id).await.unwrap());
        let state = group.snapshot(id).unwrap().state;
        assert_eq!((state.start_millis, state.end_millis), (Some(1_000), Some(9_000)));
        assert!(f.closed.load(Ordering::SeqCst));

        let search = f.searches.lock().unwrap()[0].search.clone();
        assert!(search.starts_with("search path=\"/plant/temp\""));
        assert!(search.contains("stats min(time) as start max(time) as end"));

        // New writes extend the seeded range
        group
            .submit(UpdateEvent::new(id, "/plant/temp", Value::Number(1.0), 12_000))
            .await
            .unwrap();
        let state = group.snapshot(id).unwrap().state;
        assert_eq!((state.start_millis, state.end_millis), (Some(1_000), Some(12_000)));
        assert_eq!(sink.len(), 1);
    }

    #[tokio::test]
    async fn test_seeding_with_empty_store_leaves_range_unset() {
        let f = fixture(Script {
            records: vec![SearchRecord::from_pairs([("start", ""), ("end", "")])],
            ..Script::default()
        });
        let group = memory_group(&MemorySink::new());
        let id = group.add_watch("/plant/new", false).unwrap();

        assert!(!f.history.seed_watch(&group, id).await.unwrap());
        assert_eq!(group.snapshot(id).unwrap().state.start_millis, None);

        group.remove_watch(id).unwrap();
        assert!(matches!(
            f.history.seed_watch(&group, id).await,
            Err(HistoryError::Scheduler(_))
        ));
    }

    #[tokio::test]
    async fn test_identical_input_identical_output() {
        let records: Vec<SearchRecord> = (0..50).map(|i| sample(i * 7_000, &format!("{}", i % 9))).collect();
        let request = HistoryRequest {
            interval: "1m".to_string(),
            rollup: "max".to_string(),
            ..HistoryRequest::raw("/plant/temp", range())
        };

        let mut outputs = Vec::new();
        for _ in 0..2 {
            let f = fixture(Script {
                records: records.clone(),
                ..Script::default()
            });
            outputs.push(f.history.query(&request).await.unwrap().collect().await.unwrap());
        }
        assert_eq!(outputs[0], outputs[1]);
        assert!(!outputs[0].is_empty());
    }
}
