//! watchlog - bridge a live value feed to the configured sink
//!
//! Reads feed updates from stdin, one JSON object per line:
//!
//! ```text
//! {"path":"/plant/boiler/temp","value":21.5,"timestamp":"2015-08-05T10:00:00.000Z"}
//! ```
//!
//! `timestamp` may be RFC 3339 or epoch millis and defaults to now.
//!
//! ## Usage
//!
//! ```bash
//! watchlog [--group <name>] [--watch <path>]...
//! ```
//!
//! Without `--watch`, every path seen on stdin is watched.
//!
//! ## Environment Variables
//!
//! - `SINK_BACKEND` - `jsonl` (default) or `tcp`
//! - `SINK_PATH` / `SINK_ADDR` - sink file or `host:port`
//! - `WRITE_PERIOD_SECS` - seconds between drains, 0 writes immediately (default: 5)
//! - `LOGGING_MODE` / `LOGGING_INTERVAL_SECS` - write policy (default: All data)
//! - `QUERY_URL` / `QUERY_USERNAME` / `QUERY_PASSWORD` - when set, each watch's
//!   start/end range is seeded from what the store already holds
//! - `RUST_LOG` - log level (default: info)

use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use watchlog::config::{RuntimeConfig, SinkBackend};
use watchlog::feed::{ChannelFeed, FeedUpdate};
use watchlog::history::History;
use watchlog::remote::HttpQueryConnector;
use watchlog::scheduler::{GroupConfig, SchedulerError, WatchGroup};
use watchlog::sink::{JsonlConnector, SinkProvider, TcpConnector};
use watchlog::supervisor::ConnectionSupervisor;
use watchlog::timestamp::{encode_millis, now_millis};
use watchlog::{SchedulingContext, Value, WatchId, WatchRegistry};

type StoredHistory = Arc<History<HttpQueryConnector>>;

#[derive(serde::Deserialize)]
struct InputLine {
    path: String,
    #[serde(default)]
    value: Option<Value>,
    #[serde(default)]
    timestamp: Option<serde_json::Value>,
}

impl InputLine {
    fn into_update(self) -> FeedUpdate {
        let timestamp = match self.timestamp {
            Some(serde_json::Value::String(s)) => s,
            Some(serde_json::Value::Number(n)) => n.to_string(),
            _ => encode_millis(now_millis()),
        };
        FeedUpdate {
            path: self.path,
            value: self.value.unwrap_or(Value::Null),
            timestamp,
        }
    }
}

struct BridgeArgs {
    group: String,
    watches: Vec<String>,
}

impl BridgeArgs {
    fn from_args() -> Result<Self, Box<dyn std::error::Error>> {
        let args: Vec<String> = std::env::args().skip(1).collect();
        let mut group = "default".to_string();
        let mut watches = Vec::new();

        let mut iter = args.into_iter();
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "--group" => group = iter.next().ok_or("--group needs a name")?,
                "--watch" => watches.push(iter.next().ok_or("--watch needs a path")?),
                other => return Err(format!("Unknown argument: {}", other).into()),
            }
        }

        Ok(Self { group, watches })
    }
}

fn build_sink(config: &RuntimeConfig, ctx: &SchedulingContext) -> Result<Arc<dyn SinkProvider>, Box<dyn std::error::Error>> {
    let sink: Arc<dyn SinkProvider> = match config.sink_backend {
        SinkBackend::Jsonl => {
            log::info!("📁 JSONL sink: {}", config.sink_path.display());
            Arc::new(ConnectionSupervisor::new(
                JsonlConnector {
                    path: config.sink_path.clone(),
                    max_size_mb: config.output_max_size_mb,
                    max_rotations: config.output_max_rotations,
                },
                config.retry_policy(),
                ctx.clone(),
            ))
        }
        SinkBackend::Tcp => {
            let addr = config.sink_addr.clone().ok_or("SINK_ADDR is required for the tcp sink")?;
            log::info!("🌐 TCP sink: {}", addr);
            Arc::new(ConnectionSupervisor::new(
                TcpConnector::new(addr),
                config.retry_policy(),
                ctx.clone(),
            ))
        }
    };
    Ok(sink)
}

fn build_history(config: &RuntimeConfig, ctx: &SchedulingContext) -> Option<StoredHistory> {
    let url = config.query_url.clone()?;
    log::info!("🔎 Query service: {}", url);
    let supervisor = Arc::new(ConnectionSupervisor::new(
        HttpQueryConnector::new(url, config.query_credentials.clone()),
        config.retry_policy(),
        ctx.clone(),
    ));
    Some(Arc::new(History::new(supervisor, ctx.clone())))
}

/// Add a watch and seed its range from the store in the background.
fn watch_path(
    group: &WatchGroup,
    history: Option<&StoredHistory>,
    path: String,
) -> Result<WatchId, SchedulerError> {
    let id = group.add_watch(path, true)?;

    if let Some(history) = history {
        let history = history.clone();
        let group = group.clone();
        tokio::spawn(async move {
            if let Err(e) = history.seed_watch(&group, id).await {
                log::warn!("⚠️  Could not seed {} from stored history: {}", id, e);
            }
        });
    }

    Ok(id)
}

async fn handle_line(
    group: &WatchGroup,
    history: Option<&StoredHistory>,
    line: &str,
    auto_watch: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let update = serde_json::from_str::<InputLine>(line)?.into_update();

    if auto_watch && group.watch_id(&update.path).is_none() {
        watch_path(group, history, update.path.clone())?;
    }

    match group.ingest(update).await {
        Ok(_) | Err(SchedulerError::UnknownPath(_)) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();

    let config = RuntimeConfig::from_env()?;
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&config.rust_log))
        .target(env_logger::Target::Stderr)
        .init();

    let args = BridgeArgs::from_args()?;

    log::info!("🚀 Starting watchlog...");
    log::info!("   Logging mode: {}", config.logging_mode.as_str());
    log::info!("   Write period: {}s", config.write_period_secs);

    let ctx = SchedulingContext::current();
    let sink = build_sink(&config, &ctx)?;
    let history = build_history(&config, &ctx);
    let feed = Arc::new(ChannelFeed::new());
    let registry = WatchRegistry::new(sink, feed, ctx);
    if let Some(history) = &history {
        registry.attach(history.supervisor().clone());
    }

    let group = registry.create_group(
        &args.group,
        GroupConfig {
            write_period_secs: config.write_period_secs,
            logging_mode: config.logging_mode,
        },
    )?;
    for path in &args.watches {
        watch_path(&group, history.as_ref(), path.clone())?;
    }
    let auto_watch = args.watches.is_empty();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut line_number = 0u64;
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    log::info!("📭 End of input");
                    break;
                };
                line_number += 1;
                if line.trim().is_empty() {
                    continue;
                }
                if let Err(e) = handle_line(&group, history.as_ref(), &line, auto_watch).await {
                    log::warn!("⚠️  Line {} skipped: {}", line_number, e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                log::info!("🛑 Interrupted");
                break;
            }
        }
    }

    let written = registry.flush_all().await;
    log::info!("✅ Final flush wrote {} events", written);
    registry.shutdown();

    Ok(())
}
