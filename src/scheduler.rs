//! Buffer & flush scheduler
//!
//! A `WatchGroup` owns its watches, applies the write policy to every update
//! and persists accepted updates through the sink supervisor:
//!
//! - write period 0: each accepted update is written before `submit` returns
//! - write period N: updates are queued and a timer drains the queue every N
//!   seconds, taking exactly the events queued when it fires
//!
//! A drain that fails part way puts the undelivered remainder back at the head
//! of the queue for the next tick.

use crate::event::{UpdateEvent, WatchId};
use crate::feed::{FeedError, FeedUpdate, SubscriptionFeed};
use crate::policy::{evaluate, LoggingMode, WatchState};
use crate::runtime::SchedulingContext;
use crate::sink::{SinkProvider, SinkRecord};
use crate::supervisor::ConnectionError;
use crate::timestamp::{decode_millis, TimestampError};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

#[derive(Debug)]
pub enum SchedulerError {
    Stopped,
    UnknownWatch(WatchId),
    UnknownPath(String),
    DuplicatePath(String),
    InvalidTimestamp(TimestampError),
    Feed(FeedError),
    Sink(ConnectionError),
}

impl From<TimestampError> for SchedulerError {
    fn from(err: TimestampError) -> Self {
        SchedulerError::InvalidTimestamp(err)
    }
}

impl From<FeedError> for SchedulerError {
    fn from(err: FeedError) -> Self {
        SchedulerError::Feed(err)
    }
}

impl From<ConnectionError> for SchedulerError {
    fn from(err: ConnectionError) -> Self {
        SchedulerError::Sink(err)
    }
}

impl std::fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedulerError::Stopped => write!(f, "Watch group is stopped"),
            SchedulerError::UnknownWatch(id) => write!(f, "Unknown watch: {}", id),
            SchedulerError::UnknownPath(path) => write!(f, "No watch for path: {}", path),
            SchedulerError::DuplicatePath(path) => write!(f, "Path already watched: {}", path),
            SchedulerError::InvalidTimestamp(e) => write!(f, "{}", e),
            SchedulerError::Feed(e) => write!(f, "Feed error: {}", e),
            SchedulerError::Sink(e) => write!(f, "Sink write failed: {}", e),
        }
    }
}

impl std::error::Error for SchedulerError {}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GroupConfig {
    /// Seconds between drains; zero or negative writes synchronously.
    pub write_period_secs: i64,
    pub logging_mode: LoggingMode,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            write_period_secs: 5,
            logging_mode: LoggingMode::AllData,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WatchSnapshot {
    pub id: WatchId,
    pub path: String,
    pub enabled: bool,
    pub state: WatchState,
}

struct Watch {
    path: String,
    enabled: bool,
    state: WatchState,
}

#[derive(Default)]
struct Watches {
    by_id: HashMap<WatchId, Watch>,
    by_path: HashMap<String, WatchId>,
}

struct GroupInner {
    name: String,
    ctx: SchedulingContext,
    sink: Arc<dyn SinkProvider>,
    feed: Arc<dyn SubscriptionFeed>,
    feed_tx: mpsc::UnboundedSender<FeedUpdate>,
    queue: Mutex<VecDeque<UpdateEvent>>,
    watches: Mutex<Watches>,
    mode: Mutex<LoggingMode>,
    write_period_secs: AtomicU64,
    timer: Mutex<Option<JoinHandle<()>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    draining: tokio::sync::Mutex<()>,
    stopped: AtomicBool,
    next_watch_id: AtomicU64,
}

impl Drop for GroupInner {
    fn drop(&mut self) {
        for task in [&self.timer, &self.pump] {
            if let Some(task) = lock(task).take() {
                task.abort();
            }
        }
    }
}

/// A set of watches sharing one logging mode, write period and queue.
///
/// Cheap to clone; clones share the group.
#[derive(Clone)]
pub struct WatchGroup {
    inner: Arc<GroupInner>,
}

impl WatchGroup {
    pub fn new(
        name: impl Into<String>,
        config: GroupConfig,
        sink: Arc<dyn SinkProvider>,
        feed: Arc<dyn SubscriptionFeed>,
        ctx: SchedulingContext,
    ) -> Self {
        let (feed_tx, feed_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(GroupInner {
            name: name.into(),
            ctx,
            sink,
            feed,
            feed_tx,
            queue: Mutex::new(VecDeque::new()),
            watches: Mutex::new(Watches::default()),
            mode: Mutex::new(config.logging_mode),
            write_period_secs: AtomicU64::new(clamp_period(config.write_period_secs)),
            timer: Mutex::new(None),
            pump: Mutex::new(None),
            draining: tokio::sync::Mutex::new(()),
            stopped: AtomicBool::new(false),
            next_watch_id: AtomicU64::new(1),
        });

        let pump = inner.ctx.spawn(pump_feed(Arc::downgrade(&inner), feed_rx));
        *lock(&inner.pump) = Some(pump);

        let group = Self { inner };
        group.schedule_timer();
        log::info!(
            "📋 Watch group '{}' started (mode: {}, write period: {}s)",
            group.name(),
            config.logging_mode.as_str(),
            group.write_period().as_secs()
        );
        group
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Apply the write policy to `event` and persist it if accepted.
    ///
    /// Returns whether the event was accepted. With a zero write period the
    /// event is written before this returns and a sink failure is returned to
    /// the caller; otherwise it is only queued.
    pub async fn submit(&self, event: UpdateEvent) -> Result<bool, SchedulerError> {
        if self.is_stopped() {
            return Err(SchedulerError::Stopped);
        }

        let mode = self.logging_mode();
        let accepted = {
            let mut watches = lock(&self.inner.watches);
            let watch = watches
                .by_id
                .get_mut(&event.watch_id)
                .ok_or(SchedulerError::UnknownWatch(event.watch_id))?;
            evaluate(mode, &mut watch.state, &event)
        };

        if !accepted {
            log::debug!("Skipped {} = {} ({})", event.path, event.value, mode.as_str());
            return Ok(false);
        }

        if self.write_period().is_zero() {
            self.write_now(event).await?;
        } else {
            let mut queue = lock(&self.inner.queue);
            // stop() flips the flag under this lock
            if self.is_stopped() {
                return Err(SchedulerError::Stopped);
            }
            queue.push_back(event);
        }
        Ok(true)
    }

    /// Submit a raw feed update for the watch on its path.
    pub async fn ingest(&self, update: FeedUpdate) -> Result<bool, SchedulerError> {
        let id = self
            .watch_id(&update.path)
            .ok_or_else(|| SchedulerError::UnknownPath(update.path.clone()))?;
        let timestamp_millis = decode_millis(&update.timestamp)?;
        self.submit(UpdateEvent::new(id, update.path, update.value, timestamp_millis))
            .await
    }

    /// Drain the events queued right now to the sink, in enqueue order.
    ///
    /// Returns how many were written. On failure the undelivered events go
    /// back to the head of the queue.
    pub async fn flush(&self) -> Result<usize, SchedulerError> {
        let _draining = self.inner.draining.lock().await;

        let batch: Vec<UpdateEvent> = {
            let mut queue = lock(&self.inner.queue);
            let size = queue.len();
            queue.drain(..size).collect()
        };

        if batch.is_empty() {
            return Ok(0);
        }

        match self.write_batch(&batch).await {
            Ok(()) => {
                if let Some(last) = batch.last() {
                    self.record_written(last);
                }
                log::debug!("✅ Group '{}' wrote {} events", self.name(), batch.len());
                Ok(batch.len())
            }
            Err((written, e)) => {
                let remaining = batch.len() - written;
                self.requeue(batch.into_iter().skip(written).collect());
                log::error!(
                    "❌ Group '{}' failed to write to {} ({} events requeued): {}",
                    self.name(),
                    self.inner.sink.endpoint(),
                    remaining,
                    e
                );
                Err(SchedulerError::Sink(e))
            }
        }
    }

    /// Change the write period. Negative periods clamp to zero.
    ///
    /// Cancels the pending timer and schedules a new one. Returns the period
    /// actually applied, in seconds.
    pub fn set_write_period(&self, secs: i64) -> u64 {
        let period = clamp_period(secs);
        self.inner.write_period_secs.store(period, Ordering::SeqCst);
        self.schedule_timer();

        if period == 0 && self.queue_depth() > 0 {
            // Events queued under the old period would otherwise wait forever
            let group = self.clone();
            self.inner.ctx.spawn(async move {
                if let Err(e) = group.flush().await {
                    log::error!("❌ Group '{}' final drain failed: {}", group.name(), e);
                }
            });
        }

        log::info!("⏰ Group '{}' write period set to {}s", self.name(), period);
        period
    }

    pub fn write_period(&self) -> Duration {
        Duration::from_secs(self.inner.write_period_secs.load(Ordering::SeqCst))
    }

    pub fn set_logging_mode(&self, mode: LoggingMode) {
        *lock(&self.inner.mode) = mode;
        log::info!("Group '{}' logging mode set to {}", self.name(), mode.as_str());
    }

    pub fn logging_mode(&self) -> LoggingMode {
        *lock(&self.inner.mode)
    }

    /// Add a watch for `path`, subscribing it to the feed when `enabled`.
    pub fn add_watch(&self, path: impl Into<String>, enabled: bool) -> Result<WatchId, SchedulerError> {
        if self.is_stopped() {
            return Err(SchedulerError::Stopped);
        }

        let path = path.into();
        let id = {
            let mut watches = lock(&self.inner.watches);
            if watches.by_path.contains_key(&path) {
                return Err(SchedulerError::DuplicatePath(path));
            }
            let id = WatchId(self.inner.next_watch_id.fetch_add(1, Ordering::Relaxed));
            watches.by_path.insert(path.clone(), id);
            watches.by_id.insert(
                id,
                Watch {
                    path: path.clone(),
                    enabled,
                    state: WatchState::default(),
                },
            );
            id
        };

        if enabled {
            if let Err(e) = self.subscribe(&path) {
                self.forget(id);
                return Err(e);
            }
        }

        log::info!("👀 Group '{}' watching {} as {}", self.name(), path, id);
        Ok(id)
    }

    pub fn remove_watch(&self, id: WatchId) -> Result<(), SchedulerError> {
        let watch = self.forget(id).ok_or(SchedulerError::UnknownWatch(id))?;
        if watch.enabled {
            self.inner.feed.unsubscribe(&watch.path);
        }
        log::info!("Group '{}' removed watch on {}", self.name(), watch.path);
        Ok(())
    }

    pub fn enable_watch(&self, id: WatchId) -> Result<(), SchedulerError> {
        self.set_enabled(id, true)
    }

    pub fn disable_watch(&self, id: WatchId) -> Result<(), SchedulerError> {
        self.set_enabled(id, false)
    }

    pub fn watch_id(&self, path: &str) -> Option<WatchId> {
        lock(&self.inner.watches).by_path.get(path).copied()
    }

    pub fn snapshot(&self, id: WatchId) -> Option<WatchSnapshot> {
        lock(&self.inner.watches).by_id.get(&id).map(|watch| WatchSnapshot {
            id,
            path: watch.path.clone(),
            enabled: watch.enabled,
            state: watch.state.clone(),
        })
    }

    /// Snapshots of every watch, ordered by id.
    /// Widen a watch's written range with what the store already holds.
    pub fn seed_range(&self, id: WatchId, start_millis: i64, end_millis: i64) -> Result<(), SchedulerError> {
        let mut watches = lock(&self.inner.watches);
        let watch = watches.by_id.get_mut(&id).ok_or(SchedulerError::UnknownWatch(id))?;
        watch.state.seed_range(start_millis, end_millis);
        log::debug!("Seeded {} with stored range {}..{}", watch.path, start_millis, end_millis);
        Ok(())
    }

    pub fn watches(&self) -> Vec<WatchSnapshot> {
        let mut ids: Vec<WatchId> = lock(&self.inner.watches).by_id.keys().copied().collect();
        ids.sort();
        ids.into_iter().filter_map(|id| self.snapshot(id)).collect()
    }

    pub fn queue_depth(&self) -> usize {
        lock(&self.inner.queue).len()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Cancel the timer, drop queued events and reject further submissions.
    pub fn stop(&self) {
        let dropped = {
            let mut queue = lock(&self.inner.queue);
            if self.inner.stopped.swap(true, Ordering::SeqCst) {
                return;
            }
            let dropped = queue.len();
            queue.clear();
            dropped
        };

        for task in [&self.inner.timer, &self.inner.pump] {
            if let Some(task) = lock(task).take() {
                task.abort();
            }
        }

        let subscribed: Vec<String> = lock(&self.inner.watches)
            .by_id
            .values()
            .filter(|watch| watch.enabled)
            .map(|watch| watch.path.clone())
            .collect();
        for path in subscribed {
            self.inner.feed.unsubscribe(&path);
        }

        if dropped > 0 {
            log::warn!("⚠️  Group '{}' stopped with {} unwritten events", self.name(), dropped);
        } else {
            log::info!("🛑 Group '{}' stopped", self.name());
        }
    }

    fn set_enabled(&self, id: WatchId, enabled: bool) -> Result<(), SchedulerError> {
        let path = {
            let mut watches = lock(&self.inner.watches);
            let watch = watches.by_id.get_mut(&id).ok_or(SchedulerError::UnknownWatch(id))?;
            watch.enabled = enabled;
            watch.path.clone()
        };

        if enabled {
            self.subscribe(&path)
        } else {
            self.inner.feed.unsubscribe(&path);
            Ok(())
        }
    }

    fn subscribe(&self, path: &str) -> Result<(), SchedulerError> {
        if self.inner.feed.is_subscribed(path) {
            self.inner.feed.unsubscribe(path);
        }
        self.inner.feed.subscribe(path, self.inner.feed_tx.clone())?;
        Ok(())
    }

    fn forget(&self, id: WatchId) -> Option<Watch> {
        let mut watches = lock(&self.inner.watches);
        let watch = watches.by_id.remove(&id)?;
        watches.by_path.remove(&watch.path);
        Some(watch)
    }

    async fn write_now(&self, event: UpdateEvent) -> Result<(), SchedulerError> {
        let batch = [event];
        self.write_batch(&batch).await.map_err(|(_, e)| {
            log::error!("❌ Group '{}' failed to write {}: {}", self.name(), batch[0].path, e);
            SchedulerError::Sink(e)
        })?;
        self.record_written(&batch[0]);
        Ok(())
    }

    /// Write `batch` in order. On failure returns how many were written.
    async fn write_batch(&self, batch: &[UpdateEvent]) -> Result<(), (usize, ConnectionError)> {
        let sink = self.inner.sink.acquire_sink().await.map_err(|e| (0, e))?;

        for (written, event) in batch.iter().enumerate() {
            if let Err(e) = sink.write_record(&SinkRecord::from(event)).await {
                let reason = e.to_connection_error();
                self.inner.sink.invalidate_sink(&reason);
                return Err((written, reason));
            }
        }

        if let Err(e) = sink.flush().await {
            let reason = e.to_connection_error();
            log::warn!("⚠️  {} flush failed: {}", sink.backend_type(), reason);
            self.inner.sink.invalidate_sink(&reason);
        }

        Ok(())
    }

    fn record_written(&self, event: &UpdateEvent) {
        if let Some(watch) = lock(&self.inner.watches).by_id.get_mut(&event.watch_id) {
            watch.state.record_written(event);
        }
    }

    fn requeue(&self, remaining: Vec<UpdateEvent>) {
        let mut queue = lock(&self.inner.queue);
        if self.is_stopped() {
            return;
        }
        for event in remaining.into_iter().rev() {
            queue.push_front(event);
        }
    }

    fn schedule_timer(&self) {
        let mut timer = lock(&self.inner.timer);
        if let Some(previous) = timer.take() {
            previous.abort();
        }

        let period = self.write_period();
        if period.is_zero() || self.is_stopped() {
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        let ctx = self.inner.ctx.clone();
        *timer = Some(self.inner.ctx.spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let group = WatchGroup { inner };

                // Rescheduling aborts this task; the drain itself runs to completion
                let drain = ctx.spawn(async move {
                    if let Err(e) = group.flush().await {
                        log::debug!("Drain of '{}' deferred to next tick: {}", group.name(), e);
                    }
                });
                let _ = drain.await;
            }
        }));
    }
}

async fn pump_feed(group: Weak<GroupInner>, mut updates: mpsc::UnboundedReceiver<FeedUpdate>) {
    while let Some(update) = updates.recv().await {
        let Some(inner) = group.upgrade() else {
            break;
        };
        let group = WatchGroup { inner };
        let path = update.path.clone();
        if let Err(e) = group.ingest(update).await {
            log::warn!("⚠️  Dropped update for {}: {}", path, e);
        }
    }
}

fn clamp_period(secs: i64) -> u64 {
    secs.max(0) as u64
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
