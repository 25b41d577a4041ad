use chrono::{DateTime, Utc};
use palaver_core::{RelayError, RoomEvent, RoomId};
use serde::{Deserialize, Serialize};

/// Inbound frame: one JSON object per WebSocket text message.
///
/// Frames with an unrecognized `type` fail to parse and are ignored by the
/// session without closing the connection.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    CreateRoom,
    JoinRoom {
        #[serde(rename = "roomId")]
        room_id: String,
        username: String,
    },
    SendMessage {
        content: String,
    },
}

/// Outbound frame. Live room events serialize with the same `type` tags as
/// their history form, so a replayed event and a live one are byte-identical
/// in shape.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    RoomCreated {
        #[serde(rename = "roomId")]
        room_id: RoomId,
    },
    ChatHistory {
        history: Vec<RoomEvent>,
    },
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
    Error {
        message: String,
    },
}

impl ServerFrame {
    pub fn error(err: &RelayError) -> Self {
        Self::Error {
            message: err.to_string(),
        }
    }
}

impl From<RoomEvent> for ServerFrame {
    fn from(event: RoomEvent) -> Self {
        match event {
            RoomEvent::NewMessage {
                username,
                content,
                timestamp,
            } => Self::NewMessage {
                username,
                content,
                timestamp,
            },
            RoomEvent::UserJoined {
                username,
                timestamp,
            } => Self::UserJoined {
                username,
                timestamp,
            },
            RoomEvent::UserLeft {
                username,
                timestamp,
            } => Self::UserLeft {
                username,
                timestamp,
            },
        }
    }
}
