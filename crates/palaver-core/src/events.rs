use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single entry in a room's history, and the unit of live broadcast.
///
/// The serialized form is the wire form: clients receive these objects
/// verbatim, both inside a `chat_history` replay and as live events.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RoomEvent {
    NewMessage {
        username: String,
        content: String,
        timestamp: DateTime<Utc>,
    },
    UserJoined {
        username: String,
        timestamp: DateTime<Utc>,
    },
    UserLeft {
        username: String,
        timestamp: DateTime<Utc>,
    },
}

impl RoomEvent {
    pub fn message(username: impl Into<String>, content: impl Into<String>) -> Self {
        Self::NewMessage {
            username: username.into(),
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn joined(username: impl Into<String>) -> Self {
        Self::UserJoined {
            username: username.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn left(username: impl Into<String>) -> Self {
        Self::UserLeft {
            username: username.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn username(&self) -> &str {
        match self {
            Self::NewMessage { username, .. }
            | Self::UserJoined { username, .. }
            | Self::UserLeft { username, .. } => username,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::NewMessage { timestamp, .. }
            | Self::UserJoined { timestamp, .. }
            | Self::UserLeft { timestamp, .. } => *timestamp,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::NewMessage { .. } => "new_message",
            Self::UserJoined { .. } => "user_joined",
            Self::UserLeft { .. } => "user_left",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_event_wire_shape() {
        let evt = RoomEvent::message("alice", "hi");
        let json = serde_json::to_value(&evt).unwrap();
        assert_eq!(json["type"], "new_message");
        assert_eq!(json["username"], "alice");
        assert_eq!(json["content"], "hi");
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn membership_event_wire_shape() {
        let joined = serde_json::to_value(RoomEvent::joined("bob")).unwrap();
        assert_eq!(joined["type"], "user_joined");
        assert_eq!(joined["username"], "bob");
        assert!(joined.get("content").is_none());

        let left = serde_json::to_value(RoomEvent::left("bob")).unwrap();
        assert_eq!(left["type"], "user_left");
    }

    #[test]
    fn timestamp_is_rfc3339_sortable() {
        let evt = RoomEvent::joined("alice");
        let json = serde_json::to_value(&evt).unwrap();
        let raw = json["timestamp"].as_str().unwrap();
        let parsed: DateTime<Utc> = raw.parse().unwrap();
        assert_eq!(parsed, evt.timestamp());
    }

    #[test]
    fn event_type_matches_serialized_tag() {
        for evt in [
            RoomEvent::message("a", "x"),
            RoomEvent::joined("a"),
            RoomEvent::left("a"),
        ] {
            let json = serde_json::to_value(&evt).unwrap();
            assert_eq!(json["type"], evt.event_type());
        }
    }

    #[test]
    fn serde_roundtrip() {
        let evt = RoomEvent::message("alice", "hello there");
        let json = serde_json::to_string(&evt).unwrap();
        let parsed: RoomEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, evt);
    }
}
