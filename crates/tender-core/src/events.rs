//! Per-user push channel.
//!
//! [`SessionHub`] fans [`UserEvent`]s out to every connected session of a
//! user. Each user gets its own `tokio::sync::broadcast` channel, created on
//! the first connect and dropped once the last session disconnects. Delivery
//! is at-most-once: a user with no sessions simply misses the event, and a
//! lagging session loses the oldest events.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::defaults;
use crate::models::AnalysisStatusView;

/// Events pushed to a user's sessions.
///
/// Serialized with a `type` tag, e.g.
/// `{"type":"AnalysisUpdated","noticeId":"...","status":"Completed",...}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum UserEvent {
    /// Authoritative status of one of the user's analyses.
    AnalysisUpdated(AnalysisStatusView),
    /// A saved query's embedding is available.
    #[serde(rename_all = "camelCase")]
    QueryVectorReady { query_vector_id: Uuid },
}

impl UserEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            UserEvent::AnalysisUpdated(_) => "AnalysisUpdated",
            UserEvent::QueryVectorReady { .. } => "QueryVectorReady",
        }
    }
}

/// Sink for user-addressed events. Returns how many sessions received it.
pub trait UserNotifier: Send + Sync {
    fn notify(&self, user_id: &str, event: UserEvent) -> usize;
}

/// Registry of active sessions keyed by user id.
#[derive(Clone)]
pub struct SessionHub {
    users: Arc<Mutex<HashMap<String, broadcast::Sender<UserEvent>>>>,
    buffer: usize,
}

impl Default for SessionHub {
    fn default() -> Self {
        Self::new(defaults::SESSION_BUFFER)
    }
}

impl SessionHub {
    /// Create a hub whose per-user channels buffer `buffer` events.
    pub fn new(buffer: usize) -> Self {
        Self {
            users: Arc::new(Mutex::new(HashMap::new())),
            buffer: buffer.max(1),
        }
    }

    /// Register a new session for `user_id`.
    pub fn connect(&self, user_id: &str) -> SessionHandle {
        let mut users = self.users.lock().unwrap_or_else(|e| e.into_inner());
        let sender = users
            .entry(user_id.to_string())
            .or_insert_with(|| broadcast::channel(self.buffer).0);
        let receiver = sender.subscribe();
        tracing::debug!(
            subsystem = "events",
            component = "session_hub",
            user_id,
            sessions = sender.receiver_count(),
            "Session connected"
        );
        SessionHandle {
            user_id: user_id.to_string(),
            receiver,
            hub: self.clone(),
        }
    }

    /// Number of connected sessions for `user_id`.
    pub fn session_count(&self, user_id: &str) -> usize {
        let users = self.users.lock().unwrap_or_else(|e| e.into_inner());
        users.get(user_id).map_or(0, |s| s.receiver_count())
    }

    /// Send `event` to every session of `user_id`.
    pub fn push(&self, user_id: &str, event: UserEvent) -> usize {
        let mut users = self.users.lock().unwrap_or_else(|e| e.into_inner());
        let Some(sender) = users.get(user_id) else {
            tracing::debug!(
                subsystem = "events",
                component = "session_hub",
                user_id,
                event_type = event.event_type(),
                "No active sessions, event dropped"
            );
            return 0;
        };
        match sender.send(event) {
            Ok(delivered) => delivered,
            Err(_) => {
                users.remove(user_id);
                0
            }
        }
    }

    fn release(&self, user_id: &str) {
        let mut users = self.users.lock().unwrap_or_else(|e| e.into_inner());
        // The departing receiver is dropped after this call, so one remaining
        // receiver means this was the last session.
        if users
            .get(user_id)
            .is_some_and(|sender| sender.receiver_count() <= 1)
        {
            users.remove(user_id);
        }
    }
}

impl UserNotifier for SessionHub {
    fn notify(&self, user_id: &str, event: UserEvent) -> usize {
        self.push(user_id, event)
    }
}

/// One connected session. Dropping it unregisters the session.
pub struct SessionHandle {
    user_id: String,
    receiver: broadcast::Receiver<UserEvent>,
    hub: SessionHub,
}

impl SessionHandle {
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Wait for the next event. Returns `None` once the hub is gone.
    ///
    /// Events missed because the session lagged are skipped.
    pub async fn recv(&mut self) -> Option<UserEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        subsystem = "events",
                        component = "session_hub",
                        user_id = %self.user_id,
                        skipped,
                        "Session lagged, events dropped"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next event if one is already buffered.
    pub fn try_recv(&mut self) -> Option<UserEvent> {
        self.receiver.try_recv().ok()
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.hub.release(&self.user_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AnalysisStatus;

    fn updated(user: &str) -> UserEvent {
        UserEvent::AnalysisUpdated(AnalysisStatusView::not_started(Uuid::nil(), user))
    }

    #[tokio::test]
    async fn test_push_reaches_all_sessions_of_user() {
        let hub = SessionHub::new(8);
        let mut a = hub.connect("alice");
        let mut b = hub.connect("alice");
        let mut other = hub.connect("bob");

        assert_eq!(hub.push("alice", updated("alice")), 2);
        assert_eq!(a.recv().await, Some(updated("alice")));
        assert_eq!(b.recv().await, Some(updated("alice")));
        assert!(other.try_recv().is_none());
    }

    #[test]
    fn test_push_without_sessions_is_dropped() {
        let hub = SessionHub::default();
        assert_eq!(hub.push("nobody", updated("nobody")), 0);
    }

    #[test]
    fn test_disconnect_releases_user() {
        let hub = SessionHub::new(4);
        let first = hub.connect("carol");
        let second = hub.connect("carol");
        assert_eq!(hub.session_count("carol"), 2);

        drop(first);
        assert_eq!(hub.session_count("carol"), 1);
        drop(second);
        assert_eq!(hub.session_count("carol"), 0);
        assert_eq!(hub.push("carol", updated("carol")), 0);
    }

    #[test]
    fn test_user_event_json_shape() {
        let mut view = AnalysisStatusView::not_started(Uuid::nil(), "u1");
        view.status = AnalysisStatus::Completed;
        let json = serde_json::to_value(UserEvent::AnalysisUpdated(view)).unwrap();
        assert_eq!(json["type"], "AnalysisUpdated");
        assert_eq!(json["status"], "Completed");
        assert_eq!(json["userId"], "u1");

        let ready = serde_json::to_value(UserEvent::QueryVectorReady {
            query_vector_id: Uuid::nil(),
        })
        .unwrap();
        assert_eq!(ready["type"], "QueryVectorReady");
        assert!(ready.get("queryVectorId").is_some());
    }

    #[tokio::test]
    async fn test_lagged_session_skips_to_newest() {
        let hub = SessionHub::new(1);
        let mut session = hub.connect("dave");
        hub.push("dave", updated("first"));
        hub.push("dave", updated("second"));
        assert_eq!(session.recv().await, Some(updated("second")));
    }
}
