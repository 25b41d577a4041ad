use std::sync::Arc;

use palaver_core::{ConnectionId, RelayError, RoomId};
use palaver_telemetry::{names, MetricsRecorder};

use crate::broadcast::Broadcaster;
use crate::rooms::RoomRegistry;
use crate::wire::{ClientFrame, ServerFrame};

/// Where a connection is in its protocol lifecycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Connected, not in any room.
    Unjoined,
    /// Member of exactly one room, under the name given at join time.
    Joined { room_id: RoomId, username: String },
    /// Terminal. No transition leaves this state.
    Closed,
}

/// Per-connection protocol state machine.
///
/// Translates inbound frames into room operations and outbound frames. One
/// session is owned by one connection task, so its methods take `&mut self`
/// without any locking of their own; cross-connection state lives in the
/// room registry.
pub struct Session {
    conn_id: ConnectionId,
    state: SessionState,
    rooms: Arc<RoomRegistry>,
    broadcaster: Broadcaster,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl Session {
    pub fn new(
        conn_id: ConnectionId,
        rooms: Arc<RoomRegistry>,
        broadcaster: Broadcaster,
        metrics: Option<Arc<MetricsRecorder>>,
    ) -> Self {
        Self {
            conn_id,
            state: SessionState::Unjoined,
            rooms,
            broadcaster,
            metrics,
        }
    }

    pub fn connection_id(&self) -> &ConnectionId {
        &self.conn_id
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Handle one raw inbound text frame. Unknown frame types and malformed
    /// JSON are ignored; the connection stays open.
    pub fn handle_text(&mut self, raw: &str) {
        match serde_json::from_str::<ClientFrame>(raw) {
            Ok(frame) => self.handle_frame(frame),
            Err(err) => {
                tracing::debug!(connection_id = %self.conn_id, %err, "ignoring unparseable frame");
            }
        }
    }

    pub fn handle_frame(&mut self, frame: ClientFrame) {
        if self.state == SessionState::Closed {
            return;
        }

        let result = match frame {
            ClientFrame::CreateRoom => self.create_room(),
            ClientFrame::JoinRoom { room_id, username } => self.join_room(room_id, username),
            ClientFrame::SendMessage { content } => self.send_message(content),
        };

        if let Err(err) = result {
            if err.is_silent() {
                return;
            }
            tracing::debug!(
                connection_id = %self.conn_id,
                error = err.kind(),
                "request rejected"
            );
            self.broadcaster
                .send_to(&self.conn_id, &ServerFrame::error(&err));
        }
    }

    /// Mint a room and tell the requester its id. No join side effect; the
    /// client is expected to follow up with a join.
    fn create_room(&self) -> Result<(), RelayError> {
        let room_id = self.rooms.create_room();
        tracing::info!(room_id = %room_id, connection_id = %self.conn_id, "room created");
        if let Some(metrics) = &self.metrics {
            metrics.counter_inc(names::ROOMS_CREATED, 1);
            metrics.gauge_set(names::ROOMS_LIVE, self.rooms.len() as i64);
        }
        self.broadcaster
            .send_to(&self.conn_id, &ServerFrame::RoomCreated { room_id });
        Ok(())
    }

    fn join_room(&mut self, room_id: String, username: String) -> Result<(), RelayError> {
        if matches!(self.state, SessionState::Joined { .. }) {
            return Err(RelayError::AlreadyInRoom);
        }
        let username = username.trim().to_owned();
        if username.is_empty() {
            return Err(RelayError::InvalidName);
        }

        let room_id = RoomId::from_raw(room_id);
        let conn_id = self.conn_id.clone();
        let broadcaster = &self.broadcaster;

        // Snapshot, membership insert and both deliveries happen under the
        // room's entry lock: the newcomer's replay and its spot in the live
        // fan-out set are one atomic step, so no event is missed or doubled.
        self.rooms.with_room(&room_id, |room| {
            let history = room.snapshot_history();
            let event = room.join(&conn_id, &username)?;
            broadcaster.send_to(&conn_id, &ServerFrame::ChatHistory { history });
            broadcaster.fan_out(room.member_ids(), Some(&conn_id), &ServerFrame::from(event));
            Ok(())
        })?;

        tracing::info!(room_id = %room_id, connection_id = %self.conn_id, username = %username, "joined room");
        self.state = SessionState::Joined { room_id, username };
        Ok(())
    }

    fn send_message(&self, content: String) -> Result<(), RelayError> {
        let SessionState::Joined { room_id, .. } = &self.state else {
            return Err(RelayError::Unauthorized);
        };
        if content.trim().is_empty() {
            return Err(RelayError::EmptyContent);
        }

        let conn_id = self.conn_id.clone();
        let broadcaster = &self.broadcaster;

        // The sender is not excluded: its UI renders the authoritative copy.
        self.rooms.with_room(room_id, |room| {
            let event = room.post_message(&conn_id, &content)?;
            broadcaster.fan_out(room.member_ids(), None, &ServerFrame::from(event));
            Ok(())
        })?;

        if let Some(metrics) = &self.metrics {
            metrics.counter_inc(names::MESSAGES_RELAYED, 1);
        }
        Ok(())
    }

    /// The disconnect transition. Idempotent; runs the implicit leave when
    /// the session was joined, then seals the session.
    pub fn disconnect(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        let prev = std::mem::replace(&mut self.state, SessionState::Closed);

        let SessionState::Joined { room_id, .. } = prev else {
            return;
        };

        let conn_id = self.conn_id.clone();
        let broadcaster = &self.broadcaster;

        let result = self.rooms.with_room(&room_id, |room| {
            let event = room.leave(&conn_id)?;
            broadcaster.fan_out(room.member_ids(), None, &ServerFrame::from(event));
            Ok(())
        });
        match result {
            Ok(()) => {}
            // The room may already be gone, or the member already removed;
            // both mean someone else finished the cleanup first.
            Err(RelayError::NotMember) | Err(RelayError::RoomNotFound) => {}
            Err(err) => {
                tracing::warn!(room_id = %room_id, connection_id = %conn_id, error = err.kind(), "leave failed");
            }
        }

        if self.rooms.remove_if_empty(&room_id) {
            tracing::info!(room_id = %room_id, "removed empty room");
            if let Some(metrics) = &self.metrics {
                metrics.counter_inc(names::ROOMS_REMOVED, 1);
                metrics.gauge_set(names::ROOMS_LIVE, self.rooms.len() as i64);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ConnectionRegistry;
    use serde_json::{json, Value};
    use tokio::sync::mpsc;

    struct Fixture {
        connections: Arc<ConnectionRegistry>,
        rooms: Arc<RoomRegistry>,
        broadcaster: Broadcaster,
    }

    impl Fixture {
        fn new() -> Self {
            let connections = Arc::new(ConnectionRegistry::new(64));
            let rooms = Arc::new(RoomRegistry::default());
            let broadcaster = Broadcaster::new(Arc::clone(&connections));
            Self {
                connections,
                rooms,
                broadcaster,
            }
        }

        fn session(&self) -> (Session, mpsc::Receiver<String>) {
            let (conn_id, rx) = self.connections.register();
            let session = Session::new(
                conn_id,
                Arc::clone(&self.rooms),
                self.broadcaster.clone(),
                None,
            );
            (session, rx)
        }
    }

    fn next(rx: &mut mpsc::Receiver<String>) -> Value {
        let raw = rx.try_recv().expect("expected an outbound frame");
        serde_json::from_str(&raw).unwrap()
    }

    fn create_and_join(session: &mut Session, rx: &mut mpsc::Receiver<String>, name: &str) -> String {
        session.handle_text(r#"{"type":"create_room"}"#);
        let created = next(rx);
        let room_id = created["roomId"].as_str().unwrap().to_owned();
        join(session, &room_id, name);
        let history = next(rx);
        assert_eq!(history["type"], "chat_history");
        room_id
    }

    fn join(session: &mut Session, room_id: &str, name: &str) {
        let frame = json!({"type": "join_room", "roomId": room_id, "username": name});
        session.handle_text(&frame.to_string());
    }

    #[test]
    fn create_room_replies_to_requester_only() {
        let fx = Fixture::new();
        let (mut a, mut a_rx) = fx.session();
        let (_b, mut b_rx) = fx.session();

        a.handle_text(r#"{"type":"create_room"}"#);

        let frame = next(&mut a_rx);
        assert_eq!(frame["type"], "room_created");
        assert_eq!(frame["roomId"].as_str().unwrap().len(), 8);
        assert!(b_rx.try_recv().is_err());

        // Creation does not join.
        assert_eq!(*a.state(), SessionState::Unjoined);
        assert_eq!(fx.rooms.len(), 1);
    }

    #[test]
    fn join_unknown_room_is_a_surfaced_error() {
        let fx = Fixture::new();
        let (mut a, mut a_rx) = fx.session();

        join(&mut a, "deadbeef", "alice");

        let frame = next(&mut a_rx);
        assert_eq!(frame["type"], "error");
        assert_eq!(frame["message"], "room does not exist");
        assert_eq!(*a.state(), SessionState::Unjoined);
    }

    #[test]
    fn join_with_blank_username_is_rejected() {
        let fx = Fixture::new();
        let (mut a, mut a_rx) = fx.session();
        a.handle_text(r#"{"type":"create_room"}"#);
        let room_id = next(&mut a_rx)["roomId"].as_str().unwrap().to_owned();

        join(&mut a, &room_id, "   ");

        let frame = next(&mut a_rx);
        assert_eq!(frame["type"], "error");
        assert_eq!(frame["message"], "username must not be empty");
        assert_eq!(*a.state(), SessionState::Unjoined);
    }

    #[test]
    fn second_join_is_rejected() {
        let fx = Fixture::new();
        let (mut a, mut a_rx) = fx.session();
        let room_id = create_and_join(&mut a, &mut a_rx, "alice");

        join(&mut a, &room_id, "alice2");

        let frame = next(&mut a_rx);
        assert_eq!(frame["type"], "error");
        assert_eq!(frame["message"], "already in a room");
        assert!(matches!(a.state(), SessionState::Joined { username, .. } if username == "alice"));
    }

    #[test]
    fn newcomer_gets_replay_and_rest_get_live_join() {
        let fx = Fixture::new();
        let (mut a, mut a_rx) = fx.session();
        let (mut b, mut b_rx) = fx.session();
        let room_id = create_and_join(&mut a, &mut a_rx, "alice");

        join(&mut b, &room_id, "bob");

        // B's replay covers everything appended before B joined.
        let history = next(&mut b_rx);
        assert_eq!(history["type"], "chat_history");
        let events = history["history"].as_array().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["type"], "user_joined");
        assert_eq!(events[0]["username"], "alice");

        // A sees bob arrive live; B does not see its own join.
        let live = next(&mut a_rx);
        assert_eq!(live["type"], "user_joined");
        assert_eq!(live["username"], "bob");
        assert!(b_rx.try_recv().is_err());
    }

    #[test]
    fn message_fans_out_to_entire_room_including_sender() {
        let fx = Fixture::new();
        let (mut a, mut a_rx) = fx.session();
        let (mut b, mut b_rx) = fx.session();
        let room_id = create_and_join(&mut a, &mut a_rx, "alice");
        join(&mut b, &room_id, "bob");
        next(&mut b_rx); // chat_history
        next(&mut a_rx); // bob's join

        a.handle_text(r#"{"type":"send_message","content":"hi"}"#);

        for rx in [&mut a_rx, &mut b_rx] {
            let frame = next(rx);
            assert_eq!(frame["type"], "new_message");
            assert_eq!(frame["username"], "alice");
            assert_eq!(frame["content"], "hi");
            assert!(frame["timestamp"].is_string());
        }
    }

    #[test]
    fn blank_message_is_rejected_and_history_untouched() {
        let fx = Fixture::new();
        let (mut a, mut a_rx) = fx.session();
        let room_id = create_and_join(&mut a, &mut a_rx, "alice");

        a.handle_text(r#"{"type":"send_message","content":"  \n "}"#);

        let frame = next(&mut a_rx);
        assert_eq!(frame["type"], "error");
        assert_eq!(frame["message"], "message must not be empty");

        let history = fx
            .rooms
            .with_room(&RoomId::from_raw(room_id), |room| Ok(room.snapshot_history()))
            .unwrap();
        assert_eq!(history.len(), 1); // just alice's join
    }

    #[test]
    fn message_while_unjoined_is_rejected() {
        let fx = Fixture::new();
        let (mut a, mut a_rx) = fx.session();

        a.handle_text(r#"{"type":"send_message","content":"hi"}"#);

        let frame = next(&mut a_rx);
        assert_eq!(frame["type"], "error");
        assert_eq!(frame["message"], "not a member of this room");
    }

    #[test]
    fn unknown_frame_types_are_ignored() {
        let fx = Fixture::new();
        let (mut a, mut a_rx) = fx.session();

        a.handle_text(r#"{"type":"self_destruct"}"#);
        a.handle_text("garbage{{{");

        assert!(a_rx.try_recv().is_err());
        assert_eq!(*a.state(), SessionState::Unjoined);
    }

    #[test]
    fn disconnect_broadcasts_leave_and_removes_empty_room() {
        let fx = Fixture::new();
        let (mut a, mut a_rx) = fx.session();
        let (mut b, mut b_rx) = fx.session();
        let room_id = create_and_join(&mut a, &mut a_rx, "alice");
        join(&mut b, &room_id, "bob");
        next(&mut b_rx);
        next(&mut a_rx);

        b.disconnect();

        let frame = next(&mut a_rx);
        assert_eq!(frame["type"], "user_left");
        assert_eq!(frame["username"], "bob");
        assert_eq!(*b.state(), SessionState::Closed);

        // One member left; the room stays.
        let rid = RoomId::from_raw(room_id.clone());
        let count = fx.rooms.with_room(&rid, |room| Ok(room.member_count())).unwrap();
        assert_eq!(count, 1);

        // Last member out removes the room; the id is no longer joinable.
        a.disconnect();
        assert!(!fx.rooms.contains(&rid));

        let (mut c, mut c_rx) = fx.session();
        join(&mut c, &room_id, "carol");
        let frame = next(&mut c_rx);
        assert_eq!(frame["type"], "error");
        assert_eq!(frame["message"], "room does not exist");
    }

    #[test]
    fn disconnect_is_idempotent_and_closed_is_terminal() {
        let fx = Fixture::new();
        let (mut a, mut a_rx) = fx.session();
        let (mut b, mut b_rx) = fx.session();
        let room_id = create_and_join(&mut a, &mut a_rx, "alice");
        join(&mut b, &room_id, "bob");
        next(&mut b_rx);
        next(&mut a_rx);

        b.disconnect();
        next(&mut a_rx); // bob's user_left
        b.disconnect(); // second transition is a no-op

        assert!(a_rx.try_recv().is_err());

        // No transition out of Closed: frames from a closed session do nothing.
        b.handle_text(r#"{"type":"create_room"}"#);
        assert!(b_rx.try_recv().is_err());
        assert_eq!(fx.rooms.len(), 1);
    }

    #[test]
    fn unjoined_disconnect_has_no_room_side_effect() {
        let fx = Fixture::new();
        let (mut a, mut a_rx) = fx.session();
        a.handle_text(r#"{"type":"create_room"}"#);
        next(&mut a_rx);

        a.disconnect();

        // The created-but-never-joined room is not touched by the disconnect.
        assert_eq!(fx.rooms.len(), 1);
        assert_eq!(*a.state(), SessionState::Closed);
    }

    #[test]
    fn member_stream_is_replay_plus_live_in_append_order() {
        let fx = Fixture::new();
        let (mut a, mut a_rx) = fx.session();
        let (mut b, mut b_rx) = fx.session();
        let room_id = create_and_join(&mut a, &mut a_rx, "alice");
        a.handle_text(r#"{"type":"send_message","content":"one"}"#);
        next(&mut a_rx);

        join(&mut b, &room_id, "bob");
        let replay = next(&mut b_rx);
        next(&mut a_rx); // bob's join, seen by a

        a.handle_text(r#"{"type":"send_message","content":"two"}"#);
        next(&mut a_rx);
        let live = next(&mut b_rx);

        // B's view: [alice joined, "one"] ++ ["two"], gap-free, no duplicate.
        let mut seen: Vec<(String, String)> = replay["history"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| {
                (
                    e["type"].as_str().unwrap().to_owned(),
                    e.get("content").and_then(Value::as_str).unwrap_or_default().to_owned(),
                )
            })
            .collect();
        seen.push((
            live["type"].as_str().unwrap().to_owned(),
            live["content"].as_str().unwrap().to_owned(),
        ));

        assert_eq!(
            seen,
            vec![
                ("user_joined".to_owned(), String::new()),
                ("new_message".to_owned(), "one".to_owned()),
                ("new_message".to_owned(), "two".to_owned()),
            ]
        );
        assert!(b_rx.try_recv().is_err());
    }
}
