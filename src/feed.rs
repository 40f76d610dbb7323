//! Subscription feed: the push source of live values
//!
//! A feed delivers `(path, value, timestamp)` updates to whoever subscribed to
//! the path. Each path has at most one subscriber; callers unsubscribe before
//! subscribing again.

use crate::event::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// A raw update as pushed by the feed. The timestamp is the feed's string form.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedUpdate {
    pub path: String,
    pub value: Value,
    pub timestamp: String,
}

pub type FeedSender = mpsc::UnboundedSender<FeedUpdate>;

#[derive(Debug, Clone, PartialEq)]
pub enum FeedError {
    AlreadySubscribed(String),
    Closed,
}

impl std::fmt::Display for FeedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FeedError::AlreadySubscribed(path) => write!(f, "Path already subscribed: {}", path),
            FeedError::Closed => write!(f, "Feed is closed"),
        }
    }
}

impl std::error::Error for FeedError {}

pub trait SubscriptionFeed: Send + Sync {
    /// Start delivering updates for `path` to `sender`.
    fn subscribe(&self, path: &str, sender: FeedSender) -> Result<(), FeedError>;

    /// Stop delivering updates for `path`. Unknown paths are ignored.
    fn unsubscribe(&self, path: &str);

    fn is_subscribed(&self, path: &str) -> bool;
}

/// In-process feed keyed by path.
#[derive(Debug, Default)]
pub struct ChannelFeed {
    subscribers: Mutex<HashMap<String, FeedSender>>,
}

impl ChannelFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push an update to the path's subscriber.
    ///
    /// Returns whether it was delivered. A subscriber whose receiver is gone is
    /// dropped.
    pub fn publish(&self, path: &str, value: Value, timestamp: impl Into<String>) -> bool {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|p| p.into_inner());
        let Some(sender) = subscribers.get(path) else {
            log::debug!("No subscriber for {}", path);
            return false;
        };

        let update = FeedUpdate {
            path: path.to_string(),
            value,
            timestamp: timestamp.into(),
        };
        if sender.send(update).is_err() {
            log::debug!("Subscriber for {} went away", path);
            subscribers.remove(path);
            return false;
        }
        true
    }

    pub fn subscribed_paths(&self) -> Vec<String> {
        let subscribers = self.subscribers.lock().unwrap_or_else(|p| p.into_inner());
        let mut paths: Vec<String> = subscribers.keys().cloned().collect();
        paths.sort();
        paths
    }
}

impl SubscriptionFeed for ChannelFeed {
    fn subscribe(&self, path: &str, sender: FeedSender) -> Result<(), FeedError> {
        if sender.is_closed() {
            return Err(FeedError::Closed);
        }

        let mut subscribers = self.subscribers.lock().unwrap_or_else(|p| p.into_inner());
        if subscribers.contains_key(path) {
            return Err(FeedError::AlreadySubscribed(path.to_string()));
        }
        subscribers.insert(path.to_string(), sender);
        Ok(())
    }

    fn unsubscribe(&self, path: &str) {
        self.subscribers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(path);
    }

    fn is_subscribed(&self, path: &str) -> bool {
        self.subscribers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains_key(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let feed = ChannelFeed::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        feed.subscribe("/a", tx).unwrap();

        assert!(feed.publish("/a", Value::Number(1.0), "2015-08-05T10:00:00Z"));
        assert!(!feed.publish("/b", Value::Number(2.0), "2015-08-05T10:00:00Z"));

        let update = rx.recv().await.unwrap();
        assert_eq!(update.path, "/a");
        assert_eq!(update.value, Value::Number(1.0));
    }

    #[test]
    fn test_duplicate_subscribe_rejected_until_unsubscribed() {
        let feed = ChannelFeed::new();
        let (tx, _rx) = mpsc::unbounded_channel();

        feed.subscribe("/a", tx.clone()).unwrap();
        assert_eq!(
            feed.subscribe("/a", tx.clone()),
            Err(FeedError::AlreadySubscribed("/a".to_string()))
        );

        feed.unsubscribe("/a");
        assert!(!feed.is_subscribed("/a"));
        feed.subscribe("/a", tx).unwrap();
        assert_eq!(feed.subscribed_paths(), vec!["/a".to_string()]);
    }

    #[test]
    fn test_gone_subscriber_is_dropped() {
        let feed = ChannelFeed::new();
        let (tx, rx) = mpsc::unbounded_channel();
        feed.subscribe("/a", tx).unwrap();
        drop(rx);

        assert!(!feed.publish("/a", Value::Null, "0"));
        assert!(!feed.is_subscribed("/a"));
    }
}
