//! Per-user notification channel
//!
//! Kept alive across reconnects: `attach` installs an `on_connected` hook
//! that (re)subscribes `user-{id}` to `/user/{id}/queue/notifications` after
//! every handshake.

use std::sync::Arc;

use tracing::info;

use crate::connection::{ConnectionManager, HookId};
use crate::registry::Message;

pub fn user_key(user_id: &str) -> String {
    format!("user-{user_id}")
}

pub fn user_topic(user_id: &str) -> String {
    format!("/user/{user_id}/queue/notifications")
}

pub struct UserNotifications {
    manager: ConnectionManager,
    user_id: String,
    hook: HookId,
}

impl UserNotifications {
    pub fn attach<F>(manager: &ConnectionManager, user_id: &str, handler: F) -> Self
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        let key = user_key(user_id);
        let topic = user_topic(user_id);
        let hook = manager.on_connected(move |m| {
            let handler = handler.clone();
            if m.subscribe(&key, &topic, move |msg: &Message| handler(msg)) {
                info!(key = %key, "user notifications subscribed");
            }
        });
        Self {
            manager: manager.clone(),
            user_id: user_id.to_string(),
            hook,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn is_active(&self) -> bool {
        self.manager.is_subscribed(&user_key(&self.user_id))
    }

    /// Stop resubscribing and drop the current subscription.
    pub fn detach(self) {
        self.manager.remove_hook(self.hook);
        self.manager.unsubscribe(&user_key(&self.user_id));
    }
}
