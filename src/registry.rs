//! Registry of watch groups
//!
//! Owns every group plus the supervisors they depend on, and tears the whole
//! system down in one call.

use crate::feed::SubscriptionFeed;
use crate::runtime::SchedulingContext;
use crate::scheduler::{GroupConfig, WatchGroup};
use crate::sink::SinkProvider;
use crate::supervisor::Supervised;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, PartialEq)]
pub enum RegistryError {
    DuplicateGroup(String),
    UnknownGroup(String),
    ShutDown,
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::DuplicateGroup(name) => write!(f, "Watch group already exists: {}", name),
            RegistryError::UnknownGroup(name) => write!(f, "No watch group named {}", name),
            RegistryError::ShutDown => write!(f, "Registry is shut down"),
        }
    }
}

impl std::error::Error for RegistryError {}

#[derive(Default)]
struct Groups {
    by_name: BTreeMap<String, WatchGroup>,
    shut_down: bool,
}

pub struct WatchRegistry {
    ctx: SchedulingContext,
    sink: Arc<dyn SinkProvider>,
    feed: Arc<dyn SubscriptionFeed>,
    supervisors: Mutex<Vec<Arc<dyn Supervised>>>,
    groups: Mutex<Groups>,
}

impl WatchRegistry {
    pub fn new(sink: Arc<dyn SinkProvider>, feed: Arc<dyn SubscriptionFeed>, ctx: SchedulingContext) -> Self {
        Self {
            ctx,
            sink,
            feed,
            supervisors: Mutex::new(Vec::new()),
            groups: Mutex::new(Groups::default()),
        }
    }

    /// Shut `supervisor` down together with the registry.
    pub fn attach(&self, supervisor: Arc<dyn Supervised>) {
        lock(&self.supervisors).push(supervisor);
    }

    pub fn create_group(&self, name: &str, config: GroupConfig) -> Result<WatchGroup, RegistryError> {
        let mut groups = lock(&self.groups);
        if groups.shut_down {
            return Err(RegistryError::ShutDown);
        }
        if groups.by_name.contains_key(name) {
            return Err(RegistryError::DuplicateGroup(name.to_string()));
        }

        let group = WatchGroup::new(
            name,
            config,
            self.sink.clone(),
            self.feed.clone(),
            self.ctx.clone(),
        );
        groups.by_name.insert(name.to_string(), group.clone());
        Ok(group)
    }

    pub fn group(&self, name: &str) -> Option<WatchGroup> {
        lock(&self.groups).by_name.get(name).cloned()
    }

    /// Stop and forget a group.
    pub fn remove_group(&self, name: &str) -> Result<(), RegistryError> {
        let group = lock(&self.groups)
            .by_name
            .remove(name)
            .ok_or_else(|| RegistryError::UnknownGroup(name.to_string()))?;
        group.stop();
        Ok(())
    }

    pub fn group_names(&self) -> Vec<String> {
        lock(&self.groups).by_name.keys().cloned().collect()
    }

    /// Flush every group once, returning how many events were written.
    ///
    /// Groups whose drain fails keep their events queued.
    pub async fn flush_all(&self) -> usize {
        let groups: Vec<WatchGroup> = lock(&self.groups).by_name.values().cloned().collect();
        let mut written = 0;
        for group in groups {
            match group.flush().await {
                Ok(count) => written += count,
                Err(e) => log::error!("❌ Flush of group '{}' failed: {}", group.name(), e),
            }
        }
        written
    }

    /// Stop every group and shut the supervisors down. Outstanding acquires fail.
    pub fn shutdown(&self) {
        let groups = {
            let mut groups = lock(&self.groups);
            if groups.shut_down {
                return;
            }
            groups.shut_down = true;
            std::mem::take(&mut groups.by_name)
        };

        for group in groups.values() {
            group.stop();
        }

        self.sink.shutdown();
        for supervisor in lock(&self.supervisors).drain(..) {
            supervisor.shut_down();
        }

        log::info!("🛑 Registry shut down ({} groups stopped)", groups.len());
    }

    pub fn is_shut_down(&self) -> bool {
        lock(&self.groups).shut_down
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{UpdateEvent, Value};
    use crate::feed::ChannelFeed;
    use crate::scheduler::SchedulerError;
    use crate::sink::{MemoryConnector, MemorySink};
    use crate::supervisor::{ConnectionError, ConnectionSupervisor, RetryPolicy};

    fn registry() -> (WatchRegistry, Arc<ConnectionSupervisor<MemoryConnector>>, MemorySink) {
        let sink = MemorySink::new();
        let supervisor = Arc::new(ConnectionSupervisor::new(
            MemoryConnector::new(sink.clone()),
            RetryPolicy::default(),
            SchedulingContext::current(),
        ));
        let registry = WatchRegistry::new(
            supervisor.clone(),
            Arc::new(ChannelFeed::new()),
            SchedulingContext::current(),
        );
        (registry, supervisor, sink)
    }

    #[tokio::test]
    async fn test_groups_by_name() {
        let (registry, _supervisor, _sink) = registry();
        registry.create_group("b", GroupConfig::default()).unwrap();
        registry.create_group("a", GroupConfig::default()).unwrap();

        assert_eq!(
            registry.create_group("a", GroupConfig::default()).err(),
            Some(RegistryError::DuplicateGroup("a".to_string()))
        );
        assert_eq!(registry.group_names(), vec!["a".to_string(), "b".to_string()]);

        let a = registry.group("a").unwrap();
        registry.remove_group("a").unwrap();
        assert!(a.is_stopped());
        assert!(registry.group("a").is_none());
        assert!(registry.remove_group("a").is_err());
    }

    #[tokio::test]
    async fn test_flush_all_then_shutdown() {
        let (registry, supervisor, sink) = registry();
        let group = registry
            .create_group(
                "plant",
                GroupConfig {
                    write_period_secs: 60,
                    ..GroupConfig::default()
                },
            )
            .unwrap();
        let id = group.add_watch("/plant/temp", false).unwrap();
        group
            .submit(UpdateEvent::new(id, "/plant/temp", Value::Number(20.0), 1))
            .await
            .unwrap();

        assert_eq!(registry.flush_all().await, 1);
        assert_eq!(sink.len(), 1);

        registry.shutdown();
        assert!(registry.is_shut_down());
        assert!(group.is_stopped());
        assert_eq!(supervisor.acquire().await.err(), Some(ConnectionError::ShutDown));
        assert!(matches!(
            group.submit(UpdateEvent::new(id, "/plant/temp", Value::Null, 2)).await,
            Err(SchedulerError::Stopped)
        ));
        assert_eq!(
            registry.create_group("late", GroupConfig::default()).err(),
            Some(RegistryError::ShutDown)
        );
    }
}
