//! Subscription bookkeeping and message fan-out
//!
//! Pure data structure: the connection manager owns one behind a lock, sends
//! the SUBSCRIBE/UNSUBSCRIBE frames itself, and calls `route` for every
//! incoming MESSAGE. Handlers are returned to the caller and invoked outside
//! the lock.
//!
//! Three callback sets:
//! - the subscription's own handler (one per key, dies with the transport)
//! - per-key listeners (survive reconnects, removed explicitly)
//! - global listeners (every routed message, whatever the topic)

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::frame::Frame;

/// A decoded MESSAGE as seen by application callbacks.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Subscription key the message was routed through (e.g. `room-12`).
    pub key: String,
    pub topic: String,
    pub headers: Vec<(String, String)>,
    pub body: Value,
}

impl Message {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

pub type MessageHandler = Arc<dyn Fn(&Message) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Subscription {
    id: String,
    topic: String,
    handler: MessageHandler,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}

/// Handlers selected for one message, ready to run.
pub struct Delivery {
    pub message: Message,
    handlers: Vec<MessageHandler>,
}

impl Delivery {
    pub fn deliver(self) {
        for handler in &self.handlers {
            handler(&self.message);
        }
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }
}

#[derive(Default)]
pub struct SubscriptionRegistry {
    subscriptions: HashMap<String, Subscription>,
    listeners: HashMap<String, Vec<(ListenerId, MessageHandler)>>,
    global: Vec<(ListenerId, MessageHandler)>,
    next_listener: u64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a subscription and return its wire id. When `key` was already
    /// subscribed, the replaced wire id is returned too so the caller can
    /// UNSUBSCRIBE it.
    pub fn insert(&mut self, key: &str, topic: &str, handler: MessageHandler) -> (String, Option<String>) {
        let id = format!("sub-{}", uuid::Uuid::new_v4());
        let replaced = self.subscriptions.insert(
            key.to_string(),
            Subscription {
                id: id.clone(),
                topic: topic.to_string(),
                handler,
            },
        );
        (id, replaced.map(|s| s.id))
    }

    /// Forget `key`, returning the wire id to unsubscribe.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.subscriptions.remove(key).map(|s| s.id)
    }

    /// Forget every subscription, returning their wire ids. Listeners stay.
    pub fn drain(&mut self) -> Vec<String> {
        self.subscriptions.drain().map(|(_, s)| s.id).collect()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.subscriptions.contains_key(key)
    }

    pub fn topic(&self, key: &str) -> Option<&str> {
        self.subscriptions.get(key).map(|s| s.topic.as_str())
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    pub fn add_listener(&mut self, key: &str, listener: MessageHandler) -> ListenerId {
        let id = self.next_id();
        self.listeners
            .entry(key.to_string())
            .or_default()
            .push((id, listener));
        id
    }

    pub fn add_global_listener(&mut self, listener: MessageHandler) -> ListenerId {
        let id = self.next_id();
        self.global.push((id, listener));
        id
    }

    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        let before = self.global.len();
        self.global.retain(|(l, _)| *l != id);
        if self.global.len() != before {
            return true;
        }
        let mut removed = false;
        for set in self.listeners.values_mut() {
            let before = set.len();
            set.retain(|(l, _)| *l != id);
            removed |= set.len() != before;
        }
        self.listeners.retain(|_, set| !set.is_empty());
        removed
    }

    fn next_id(&mut self) -> ListenerId {
        self.next_listener += 1;
        ListenerId(self.next_listener)
    }

    /// Match an incoming MESSAGE to its subscription and decode its body.
    ///
    /// Matching uses the `subscription` header, then falls back to the
    /// `destination` topic. Returns `None` for frames that match nothing or
    /// whose body is not JSON; those are logged and dropped.
    pub fn route(&self, frame: &Frame) -> Option<Delivery> {
        let by_id = frame
            .get("subscription")
            .and_then(|id| self.subscriptions.iter().find(|(_, s)| s.id == id));
        let by_topic = || {
            frame
                .get("destination")
                .and_then(|dest| self.subscriptions.iter().find(|(_, s)| s.topic == dest))
        };
        let Some((key, subscription)) = by_id.or_else(by_topic) else {
            debug!(
                destination = frame.get("destination"),
                "message for unknown subscription, dropping"
            );
            return None;
        };

        let body = if frame.body.trim().is_empty() {
            Value::Null
        } else {
            match serde_json::from_str(&frame.body) {
                Ok(body) => body,
                Err(e) => {
                    warn!(key = %key, topic = %subscription.topic, error = %e, "dropping unparseable message");
                    metrics::counter!("realtime_frames_dropped_total", "reason" => "body").increment(1);
                    return None;
                }
            }
        };

        let mut handlers = vec![subscription.handler.clone()];
        if let Some(set) = self.listeners.get(key) {
            handlers.extend(set.iter().map(|(_, l)| l.clone()));
        }
        handlers.extend(self.global.iter().map(|(_, l)| l.clone()));

        Some(Delivery {
            message: Message {
                key: key.clone(),
                topic: subscription.topic.clone(),
                headers: frame.headers.clone(),
                body,
            },
            handlers,
        })
    }
}
