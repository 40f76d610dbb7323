//! Scheduling context passed explicitly to every component that spawns work

use std::future::Future;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Owned by the process lifecycle and handed down to groups and supervisors.
#[derive(Debug, Clone)]
pub struct SchedulingContext {
    handle: Handle,
}

impl SchedulingContext {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Context for the runtime the caller is running on.
    ///
    /// Panics outside a tokio runtime, like `Handle::current`.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }

    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }
}
