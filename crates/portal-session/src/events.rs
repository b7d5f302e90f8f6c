//! Session events broadcast to the application.
//!
//! The session manager publishes an event on every visible transition so the
//! shell can show toasts, refresh views or log activity without polling.
//!
//! # Event Types
//!
//! - `restore_started` - A restoration attempt began
//! - `restored` - The session is authenticated and the gate is open
//! - `unauthenticated` - No usable session; the user must log in
//! - `logged_out` - Logout completed (locally or because another tab logged out)
//! - `navigated` - The core moved the application to a route
//! - `error` - A restoration or login error the user should see

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::models::Role;

/// Payload for the `restore_started` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreStartedPayload {
    /// Device the restoration runs for.
    pub device_id: String,
    /// When the attempt began.
    pub timestamp: DateTime<Utc>,
}

/// Payload for the `restored` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoredPayload {
    /// Confirmed user id.
    pub user_id: String,
    /// Role of the user.
    pub role: Role,
    /// Number of queued requests released by opening the gate.
    pub released: usize,
}

/// Payload for the `unauthenticated` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnauthenticatedPayload {
    /// Why no session could be established.
    pub reason: String,
}

/// What caused a logout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogoutOrigin {
    /// Logout requested in this tab.
    Local,
    /// Another tab cleared the login marker.
    CrossTab,
}

/// Payload for the `logged_out` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggedOutPayload {
    /// What caused the logout.
    pub origin: LogoutOrigin,
}

/// Payload for the `navigated` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NavigatedPayload {
    /// Target route.
    pub path: String,
}

/// Payload for the `error` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Human-readable error message.
    pub message: String,
}

/// Session events, serialized as `{"event": ..., "payload": ...}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum SessionEvent {
    /// A restoration attempt began.
    RestoreStarted(RestoreStartedPayload),
    /// The session was established.
    Restored(RestoredPayload),
    /// No session could be established.
    Unauthenticated(UnauthenticatedPayload),
    /// Logout completed.
    LoggedOut(LoggedOutPayload),
    /// The core navigated.
    Navigated(NavigatedPayload),
    /// A user-facing error occurred.
    Error(ErrorPayload),
}

impl SessionEvent {
    /// Creates a `RestoreStarted` event stamped with the current time.
    #[must_use]
    pub fn restore_started(device_id: impl Into<String>) -> Self {
        Self::RestoreStarted(RestoreStartedPayload {
            device_id: device_id.into(),
            timestamp: Utc::now(),
        })
    }

    /// Creates a `Restored` event.
    #[must_use]
    pub fn restored(user_id: impl Into<String>, role: Role, released: usize) -> Self {
        Self::Restored(RestoredPayload {
            user_id: user_id.into(),
            role,
            released,
        })
    }

    /// Creates an `Unauthenticated` event.
    #[must_use]
    pub fn unauthenticated(reason: impl Into<String>) -> Self {
        Self::Unauthenticated(UnauthenticatedPayload {
            reason: reason.into(),
        })
    }

    /// Creates a `LoggedOut` event.
    #[must_use]
    pub const fn logged_out(origin: LogoutOrigin) -> Self {
        Self::LoggedOut(LoggedOutPayload { origin })
    }

    /// Creates a `Navigated` event.
    #[must_use]
    pub fn navigated(path: impl Into<String>) -> Self {
        Self::Navigated(NavigatedPayload { path: path.into() })
    }

    /// Creates an `Error` event.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(ErrorPayload {
            message: message.into(),
        })
    }

    /// Returns the event name as a string.
    #[must_use]
    pub const fn event_name(&self) -> &'static str {
        match self {
            Self::RestoreStarted(_) => "restore_started",
            Self::Restored(_) => "restored",
            Self::Unauthenticated(_) => "unauthenticated",
            Self::LoggedOut(_) => "logged_out",
            Self::Navigated(_) => "navigated",
            Self::Error(_) => "error",
        }
    }
}

/// Broadcasts session events to every subscriber.
///
/// Events are not kept for subscribers that join later.
#[derive(Debug, Clone)]
pub struct EventBroadcaster {
    sender: broadcast::Sender<SessionEvent>,
}

impl EventBroadcaster {
    /// Creates a broadcaster buffering up to `capacity` events per subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Creates a new subscriber.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    /// Broadcasts an event, returning the number of subscribers reached.
    pub fn send(&self, event: SessionEvent) -> usize {
        // send() returns Err only if there are no receivers, which is fine
        self.sender.send(event).unwrap_or(0)
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_restored_wire_format() {
        let event = SessionEvent::restored("U1", Role::Student, 2);
        insta::assert_json_snapshot!(event, @r#"
        {
          "event": "restored",
          "payload": {
            "userId": "U1",
            "role": "Student",
            "released": 2
          }
        }
        "#);
    }

    #[test]
    fn test_restore_started_wire_format() {
        let event = SessionEvent::restore_started("D1");
        insta::assert_json_snapshot!(event, { ".payload.timestamp" => "[timestamp]" }, @r#"
        {
          "event": "restore_started",
          "payload": {
            "deviceId": "D1",
            "timestamp": "[timestamp]"
          }
        }
        "#);
    }

    #[test]
    fn test_logged_out_wire_format() {
        let event = SessionEvent::logged_out(LogoutOrigin::CrossTab);
        insta::assert_json_snapshot!(event, @r#"
        {
          "event": "logged_out",
          "payload": {
            "origin": "cross_tab"
          }
        }
        "#);
    }

    #[test]
    fn test_event_names_match_tags() {
        let events = [
            SessionEvent::restore_started("D1"),
            SessionEvent::restored("U1", Role::Admin, 0),
            SessionEvent::unauthenticated("no stored session"),
            SessionEvent::logged_out(LogoutOrigin::Local),
            SessionEvent::navigated("/login"),
            SessionEvent::error("boom"),
        ];
        for event in events {
            let json = serde_json::to_value(&event).unwrap();
            assert_eq!(json["event"], event.event_name());
        }
    }

    #[tokio::test]
    async fn test_broadcaster_delivers_to_subscribers() {
        let broadcaster = EventBroadcaster::default();
        assert_eq!(broadcaster.send(SessionEvent::navigated("/login")), 0);

        let mut receiver = broadcaster.subscribe();
        assert_eq!(broadcaster.send(SessionEvent::navigated("/dashboard")), 1);

        let event = receiver.recv().await.unwrap();
        assert!(matches!(event, SessionEvent::Navigated(NavigatedPayload { path }) if path == "/dashboard"));
    }
}
