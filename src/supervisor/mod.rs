//! Resilient connection supervisor
//!
//! Owns one lazily created handle to a fragile remote service and shares it
//! with every caller. Establishment is single-flight: while an attempt (with
//! its retries) is running, every `acquire` waits on that same attempt and
//! observes its outcome.
//!
//! ```text
//! Idle ──acquire──▶ Connecting ──ok──▶ Ready ──invalidate──▶ Idle
//!                        └──retries exhausted──▶ Idle
//! any ──shutdown──▶ ShutDown
//! ```

pub mod retry;

pub use retry::{FixedBackoff, MaxRetriesExceeded, RetryPolicy};

use crate::runtime::SchedulingContext;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::task::AbortHandle;

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionError {
    Io(String),
    /// Malformed or unexpected data on the stream.
    Protocol(String),
    /// The service rejected our credentials (HTTP 401).
    Unauthorized(String),
    Other(String),
    RetriesExhausted {
        attempts: u32,
        last: Box<ConnectionError>,
    },
    ShutDown,
}

impl ConnectionError {
    /// Whether this failure should drop the shared handle.
    ///
    /// I/O, protocol and authentication failures invalidate; every other cause
    /// is currently handled the same way. Only shutdown leaves the slot alone.
    pub fn invalidates_handle(&self) -> bool {
        !matches!(self, ConnectionError::ShutDown)
    }
}

impl From<std::io::Error> for ConnectionError {
    fn from(err: std::io::Error) -> Self {
        ConnectionError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for ConnectionError {
    fn from(err: serde_json::Error) -> Self {
        ConnectionError::Protocol(err.to_string())
    }
}

impl From<reqwest::Error> for ConnectionError {
    fn from(err: reqwest::Error) -> Self {
        if err.status() == Some(reqwest::StatusCode::UNAUTHORIZED) {
            ConnectionError::Unauthorized(err.to_string())
        } else if err.is_decode() || err.is_body() {
            ConnectionError::Protocol(err.to_string())
        } else {
            ConnectionError::Io(err.to_string())
        }
    }
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::Io(e) => write!(f, "IO error: {}", e),
            ConnectionError::Protocol(e) => write!(f, "Protocol error: {}", e),
            ConnectionError::Unauthorized(e) => write!(f, "Authentication failed: {}", e),
            ConnectionError::Other(e) => write!(f, "Connection error: {}", e),
            ConnectionError::RetriesExhausted { attempts, last } => {
                write!(f, "Gave up after {} attempts: {}", attempts, last)
            }
            ConnectionError::ShutDown => write!(f, "Connection supervisor is shut down"),
        }
    }
}

impl std::error::Error for ConnectionError {}

/// Creates handles for one endpoint.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Handle: Send + Sync + 'static;

    /// One establishment attempt. Must not return a half-initialised handle.
    async fn connect(&self) -> Result<Self::Handle, ConnectionError>;

    /// Endpoint description for logging.
    fn endpoint(&self) -> String;
}

/// Object-safe view of a supervisor, for owners that only manage lifecycles.
pub trait Supervised: Send + Sync {
    fn endpoint(&self) -> String;

    fn shut_down(&self);
}

impl<C: Connector> Supervised for ConnectionSupervisor<C> {
    fn endpoint(&self) -> String {
        self.connector.endpoint()
    }

    fn shut_down(&self) {
        self.shutdown()
    }
}

type Outcome<H> = Result<Arc<H>, ConnectionError>;

enum Slot<H> {
    Idle,
    Connecting {
        attempt: u64,
        outcome: watch::Receiver<Option<Outcome<H>>>,
        task: AbortHandle,
    },
    Ready(Arc<H>),
    ShutDown,
}

pub struct ConnectionSupervisor<C: Connector> {
    connector: Arc<C>,
    policy: RetryPolicy,
    ctx: SchedulingContext,
    slot: Arc<Mutex<Slot<C::Handle>>>,
    next_attempt: AtomicU64,
}

impl<C: Connector> ConnectionSupervisor<C> {
    pub fn new(connector: C, policy: RetryPolicy, ctx: SchedulingContext) -> Self {
        Self {
            connector: Arc::new(connector),
            policy,
            ctx,
            slot: Arc::new(Mutex::new(Slot::Idle)),
            next_attempt: AtomicU64::new(0),
        }
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Shared handle, establishing it first if needed.
    pub async fn acquire(&self) -> Result<Arc<C::Handle>, ConnectionError> {
        let mut outcome = {
            let mut slot = lock(&self.slot);
            let in_flight = match &*slot {
                Slot::Ready(handle) => return Ok(handle.clone()),
                Slot::ShutDown => return Err(ConnectionError::ShutDown),
                Slot::Connecting { outcome, .. } => Some(outcome.clone()),
                Slot::Idle => None,
            };
            match in_flight {
                Some(outcome) => outcome,
                None => self.start_attempt(&mut slot),
            }
        };

        // A dropped sender means the attempt was aborted by shutdown
        let resolved = match outcome.wait_for(Option::is_some).await {
            Ok(resolved) => resolved.clone(),
            Err(_) => None,
        };
        resolved.unwrap_or(Err(ConnectionError::ShutDown))
    }

    /// Drop the current handle so the next `acquire` reconnects.
    ///
    /// Returns whether a handle was dropped.
    pub fn invalidate(&self, reason: &ConnectionError) -> bool {
        if !reason.invalidates_handle() {
            return false;
        }

        let mut slot = lock(&self.slot);
        if let Slot::Ready(_) = &*slot {
            log::warn!("🔌 Invalidating connection to {}: {}", self.connector.endpoint(), reason);
            *slot = Slot::Idle;
            true
        } else {
            false
        }
    }

    /// Release the handle and fail every outstanding and future `acquire`.
    pub fn shutdown(&self) {
        let mut slot = lock(&self.slot);
        if let Slot::Connecting { task, .. } = &*slot {
            task.abort();
        }
        *slot = Slot::ShutDown;
        log::info!("🛑 Connection supervisor for {} shut down", self.connector.endpoint());
    }

    pub fn is_shut_down(&self) -> bool {
        matches!(&*lock(&self.slot), Slot::ShutDown)
    }

    /// The live handle, without triggering establishment.
    pub fn current(&self) -> Option<Arc<C::Handle>> {
        match &*lock(&self.slot) {
            Slot::Ready(handle) => Some(handle.clone()),
            _ => None,
        }
    }

    fn start_attempt(&self, slot: &mut MutexGuard<'_, Slot<C::Handle>>) -> watch::Receiver<Option<Outcome<C::Handle>>> {
        let attempt = self.next_attempt.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = watch::channel(None);

        let connector = self.connector.clone();
        let policy = self.policy;
        let shared_slot = self.slot.clone();

        let task = self.ctx.spawn(async move {
            let outcome = establish(connector.as_ref(), policy).await.map(Arc::new);
            {
                let mut slot = lock(&shared_slot);
                let current = matches!(&*slot, Slot::Connecting { attempt: a, .. } if *a == attempt);
                if current {
                    *slot = match &outcome {
                        Ok(handle) => Slot::Ready(handle.clone()),
                        Err(_) => Slot::Idle,
                    };
                }
            }
            tx.send_replace(Some(outcome));
        });

        **slot = Slot::Connecting {
            attempt,
            outcome: rx.clone(),
            task: task.abort_handle(),
        };
        rx
    }
}

impl<C: Connector> Drop for ConnectionSupervisor<C> {
    fn drop(&mut self) {
        if let Slot::Connecting { task, .. } = &*lock(&self.slot) {
            task.abort();
        }
    }
}

async fn establish<C: Connector>(connector: &C, policy: RetryPolicy) -> Result<C::Handle, ConnectionError> {
    let mut backoff = FixedBackoff::new(policy);
    let mut attempts = 0;

    loop {
        attempts += 1;
        match connector.connect().await {
            Ok(handle) => {
                log::info!("✅ Connected to {}", connector.endpoint());
                return Ok(handle);
            }
            Err(e) => {
                log::warn!(
                    "❌ Failed to connect to {} (attempt {}): {}",
                    connector.endpoint(),
                    attempts,
                    e
                );
                if backoff.sleep().await.is_err() {
                    log::error!("❌ Giving up on {} after {} attempts", connector.endpoint(), attempts);
                    return Err(ConnectionError::RetriesExhausted {
                        attempts,
                        last: Box::new(e),
                    });
                }
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    struct SlowConnector {
        attempts: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Connector for SlowConnector {
        type Handle = u32;

        async fn connect(&self) -> Result<u32, ConnectionError> {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(self.attempts.fetch_add(1, Ordering::SeqCst) + 1)
        }

        fn endpoint(&self) -> String {
            "slow://test".to_string()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_acquires_share_one_attempt() {
        let attempts = Arc::new(AtomicU32::new(0));
        let supervisor = Arc::new(ConnectionSupervisor::new(
            SlowConnector { attempts: attempts.clone() },
            RetryPolicy::default(),
            SchedulingContext::current(),
        ));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let supervisor = supervisor.clone();
            tasks.push(tokio::spawn(async move { supervisor.acquire().await }));
        }

        let mut handles = Vec::new();
        for task in tasks {
            handles.push(task.await.unwrap().unwrap());
        }

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(handles.iter().all(|h| Arc::ptr_eq(h, &handles[0])));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_fails_waiting_callers() {
        let supervisor = Arc::new(ConnectionSupervisor::new(
            SlowConnector {
                attempts: Arc::new(AtomicU32::new(0)),
            },
            RetryPolicy::default(),
            SchedulingContext::current(),
        ));

        let waiting = {
            let supervisor = supervisor.clone();
            tokio::spawn(async move { supervisor.acquire().await })
        };
        tokio::task::yield_now().await;

        supervisor.shutdown();
        assert_eq!(waiting.await.unwrap(), Err(ConnectionError::ShutDown));
        assert_eq!(supervisor.acquire().await, Err(ConnectionError::ShutDown));
        assert!(supervisor.is_shut_down());
    }

    #[test]
    fn test_classification() {
        assert!(ConnectionError::Io("reset".into()).invalidates_handle());
        assert!(ConnectionError::Unauthorized("HTTP 401".into()).invalidates_handle());
        assert!(ConnectionError::Other("?".into()).invalidates_handle());
        assert!(!ConnectionError::ShutDown.invalidates_handle());
    }
}
