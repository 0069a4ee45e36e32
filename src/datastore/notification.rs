//! Change feed for repository generation updates
//!
//! The datastore publishes a JSON payload naming every repository whose set
//! of up to date storages may have changed. Consumers receive the raw
//! payload and are responsible for decoding it, because a payload they
//! cannot decode must be treated as "anything may have changed".

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::mpsc;

/// Channel name used for repository generation changes
pub const REPOSITORIES_UPDATES_CHANNEL: &str = "repositories_updates";

/// Events delivered to a feed listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    /// The feed is live; caches may be trusted from now on.
    Connected,
    /// The feed is gone; anything cached may be stale.
    Disconnected(String),
    Notification(Notification),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub channel: String,
    pub payload: String,
}

/// One entry of a notification payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationEntry {
    pub virtual_storage: String,
    pub relative_paths: Vec<String>,
}

/// Decode a payload, `[{"virtual_storage": .., "relative_paths": [..]}]`
pub fn decode_payload(payload: &str) -> serde_json::Result<Vec<NotificationEntry>> {
    serde_json::from_str(payload)
}

/// Publishing side of the change feed
#[derive(Debug, Clone)]
pub struct ChangeFeed {
    tx: mpsc::UnboundedSender<FeedEvent>,
}

impl ChangeFeed {
    /// Create a feed and the receiver for its single listener
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<FeedEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn connected(&self) {
        self.send(FeedEvent::Connected);
    }

    pub fn disconnected(&self, reason: impl Into<String>) {
        self.send(FeedEvent::Disconnected(reason.into()));
    }

    /// Publish a raw payload on the repositories channel
    pub fn publish_raw(&self, payload: impl Into<String>) {
        self.send(FeedEvent::Notification(Notification {
            channel: REPOSITORIES_UPDATES_CHANNEL.to_string(),
            payload: payload.into(),
        }));
    }

    /// Publish changes to the given (virtual storage, relative path) pairs
    pub fn publish<'a>(&self, changes: impl IntoIterator<Item = (&'a str, &'a str)>) {
        let mut grouped: BTreeMap<&str, Vec<String>> = BTreeMap::new();
        for (virtual_storage, relative_path) in changes {
            grouped
                .entry(virtual_storage)
                .or_default()
                .push(relative_path.to_string());
        }
        if grouped.is_empty() {
            return;
        }

        let entries: Vec<NotificationEntry> = grouped
            .into_iter()
            .map(|(virtual_storage, relative_paths)| NotificationEntry {
                virtual_storage: virtual_storage.to_string(),
                relative_paths,
            })
            .collect();

        match serde_json::to_string(&entries) {
            Ok(payload) => self.publish_raw(payload),
            Err(e) => {
                // Listeners cannot learn what changed, so make them distrust everything.
                tracing::error!("failed to encode change notification: {}", e);
                self.disconnected(e.to_string());
            }
        }
    }

    fn send(&self, event: FeedEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!("change feed has no listener");
        }
    }
}
