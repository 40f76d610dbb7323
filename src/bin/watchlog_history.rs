//! watchlog_history - replay stored values from the query service
//!
//! ## Usage
//!
//! ```bash
//! # History of one path, optionally bucketized
//! watchlog_history --path /plant/boiler/temp --range 2015-08-05T00:00:00Z/2015-08-06T00:00:00Z \
//!     [--interval 15M] [--rollup avg]
//!
//! # Free-form search
//! watchlog_history --search 'index=main | head 10' [--earliest -d] [--latest now] [--realtime]
//! ```
//!
//! Rows are printed to stdout as JSON lines.
//!
//! ## Environment Variables
//!
//! - `QUERY_URL` - base URL of the query service (required)
//! - `QUERY_USERNAME` / `QUERY_PASSWORD` - basic auth (optional)
//! - `CONNECT_MAX_ATTEMPTS` / `CONNECT_RETRY_DELAY_SECS` - connection retries (default: 5 / 3s)
//! - `RUST_LOG` - log level (default: info)

use serde_json::json;
use std::sync::Arc;
use watchlog::config::RuntimeConfig;
use watchlog::history::{History, HistoryRequest, QueryRequest, TimeRange};
use watchlog::remote::HttpQueryConnector;
use watchlog::supervisor::ConnectionSupervisor;
use watchlog::SchedulingContext;

enum Command {
    History(HistoryRequest),
    Search(QueryRequest),
}

fn flag_value(args: &[String], flag: &str) -> Option<String> {
    args.windows(2).find(|w| w[0] == flag).map(|w| w[1].clone())
}

fn parse_command() -> Result<Command, Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();

    if let Some(search) = flag_value(&args, "--search") {
        return Ok(Command::Search(QueryRequest {
            search,
            earliest: flag_value(&args, "--earliest"),
            latest: flag_value(&args, "--latest"),
            realtime: args.iter().any(|a| a == "--realtime"),
        }));
    }

    let path = flag_value(&args, "--path")
        .ok_or("Missing --path or --search. Usage: watchlog_history --path <PATH> --range <FROM>/<TO>")?;
    let range = flag_value(&args, "--range").ok_or("Missing --range <FROM>/<TO>")?;

    Ok(Command::History(HistoryRequest {
        path,
        range: TimeRange::parse(&range)?,
        interval: flag_value(&args, "--interval").unwrap_or_else(|| "none".to_string()),
        rollup: flag_value(&args, "--rollup").unwrap_or_else(|| "none".to_string()),
    }))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();

    let config = RuntimeConfig::from_env()?;
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&config.rust_log))
        .target(env_logger::Target::Stderr)
        .init();

    let command = parse_command()?;
    let query_url = config.query_url.clone().ok_or("QUERY_URL must be set")?;

    let ctx = SchedulingContext::current();
    let supervisor = Arc::new(ConnectionSupervisor::new(
        HttpQueryConnector::new(query_url, config.query_credentials.clone()),
        config.retry_policy(),
        ctx.clone(),
    ));
    let history = History::new(supervisor.clone(), ctx);

    let mut printed = 0usize;
    let outcome: Result<(), Box<dyn std::error::Error>> = async {
        match command {
            Command::History(request) => {
                let mut rows = history.query(&request).await?;
                while let Some(row) = rows.next().await {
                    let row = row?;
                    println!("{}", json!({ "timestamp": row.timestamp, "value": row.value }));
                    printed += 1;
                }
            }
            Command::Search(request) => {
                let mut records = history.run_search(&request).await?;
                let mut interrupted = false;
                loop {
                    tokio::select! {
                        record = records.next() => {
                            let Some(record) = record else { break };
                            println!("{}", serde_json::Value::Object(record?.fields().clone()));
                            printed += 1;
                        }
                        _ = tokio::signal::ctrl_c() => {
                            interrupted = true;
                            break;
                        }
                    }
                }
                if interrupted {
                    log::info!("🛑 Interrupted, closing search");
                    records.cancel().await;
                }
            }
        }
        Ok(())
    }
    .await;

    supervisor.shutdown();
    log::info!("📊 {} results", printed);
    outcome
}
