//! watchlog: bridges a live value feed to a durable line-oriented sink and
//! replays stored values through time-bucketed rollups.

pub mod config;
pub mod event;
pub mod feed;
pub mod history;
pub mod interval;
pub mod policy;
pub mod registry;
pub mod remote;
pub mod rollup;
pub mod runtime;
pub mod scheduler;
pub mod sink;
pub mod supervisor;
pub mod timestamp;

pub use config::{ConfigError, RuntimeConfig, SinkBackend};
pub use event::{UpdateEvent, Value, WatchId};
pub use feed::{ChannelFeed, FeedUpdate, SubscriptionFeed};
pub use history::{History, HistoryError, HistoryRequest, QueryRequest, StreamReadError, TimeRange};
pub use interval::{Bucketizer, IntervalError, IntervalSpec, Row};
pub use policy::{LoggingMode, WatchState};
pub use registry::{RegistryError, WatchRegistry};
pub use rollup::{Rollup, RollupError, RollupKind};
pub use runtime::SchedulingContext;
pub use scheduler::{GroupConfig, SchedulerError, WatchGroup, WatchSnapshot};
pub use sink::{RecordSink, SinkProvider, SinkRecord, SinkWriteError};
pub use supervisor::{ConnectionError, ConnectionSupervisor, Connector, RetryPolicy};
