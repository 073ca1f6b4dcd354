//! Chat room channel
//!
//! Room `{id}` is subscription key `room-{id}` on topic `/topic/chat/{id}`.
//! Commands go to `/app/chat/{id}/{send|join|leave|read}`.

use serde_json::json;
use tracing::debug;

use crate::connection::ConnectionManager;
use crate::registry::{ListenerId, Message};

const ROOM_TOPIC_PREFIX: &str = "/topic/chat/";

pub fn room_key(room_id: &str) -> String {
    format!("room-{room_id}")
}

pub fn room_topic(room_id: &str) -> String {
    format!("{ROOM_TOPIC_PREFIX}{room_id}")
}

fn command(room_id: &str, action: &str) -> String {
    format!("/app/chat/{room_id}/{action}")
}

/// Chat operations over a shared connection.
#[derive(Clone)]
pub struct ChatRooms {
    manager: ConnectionManager,
}

impl ChatRooms {
    pub fn new(manager: ConnectionManager) -> Self {
        Self { manager }
    }

    /// Subscribe to the room and announce the join. Returns false when not
    /// connected.
    pub fn join<F>(&self, room_id: &str, handler: F) -> bool
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        if !self.manager.subscribe(&room_key(room_id), &room_topic(room_id), handler) {
            return false;
        }
        debug!(room_id, "joined chat room");
        self.manager.send(&command(room_id, "join"), &json!({ "roomId": room_id }))
    }

    /// Announce the leave and drop the subscription. Returns whether the room
    /// was joined.
    pub fn leave(&self, room_id: &str) -> bool {
        self.manager.send(&command(room_id, "leave"), &json!({ "roomId": room_id }));
        self.manager.unsubscribe(&room_key(room_id))
    }

    pub fn send_message(&self, room_id: &str, content: &str) -> bool {
        self.manager.send(
            &command(room_id, "send"),
            &json!({ "roomId": room_id, "content": content }),
        )
    }

    pub fn mark_read(&self, room_id: &str, message_id: &str) -> bool {
        self.manager.send(
            &command(room_id, "read"),
            &json!({ "roomId": room_id, "messageId": message_id }),
        )
    }

    pub fn is_joined(&self, room_id: &str) -> bool {
        self.manager.is_subscribed(&room_key(room_id))
    }

    /// Extra observer for one room's messages.
    pub fn on_room_message<F>(&self, room_id: &str, listener: F) -> ListenerId
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.manager.add_listener(&room_key(room_id), listener)
    }

    /// Observer for messages from every joined room.
    pub fn on_any_room_message<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.manager.add_global_listener(move |message: &Message| {
            if message.topic.starts_with(ROOM_TOPIC_PREFIX) {
                listener(message);
            }
        })
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.manager.remove_listener(id)
    }
}
