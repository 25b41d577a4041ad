use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use dashmap::DashMap;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use palaver_core::ConnectionId;
use tokio::sync::mpsc;

use crate::session::Session;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(90);

/// Why a frame could not be handed to a connection's outbound queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryError {
    /// The bounded queue is full; the frame is dropped, the peer stays connected.
    QueueFull,
    /// The writer side is gone; the peer is on its way out.
    Closed,
    /// No such connection registered.
    Unknown,
}

/// A connected WebSocket peer's registry entry.
pub struct Connection {
    pub id: ConnectionId,
    tx: mpsc::Sender<String>,
    connected: AtomicBool,
    last_pong: AtomicU64,
}

impl Connection {
    fn new(id: ConnectionId, tx: mpsc::Sender<String>) -> Self {
        Self {
            id,
            tx,
            connected: AtomicBool::new(true),
            last_pong: AtomicU64::new(now_secs()),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::Relaxed);
    }

    pub fn record_pong(&self) {
        self.last_pong.store(now_secs(), Ordering::Relaxed);
    }

    pub fn is_alive(&self) -> bool {
        let last = self.last_pong.load(Ordering::Relaxed);
        now_secs().saturating_sub(last) < CLIENT_TIMEOUT.as_secs()
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Registry of all connected WebSocket peers and their outbound queues.
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<Connection>>,
    max_send_queue: usize,
}

impl ConnectionRegistry {
    pub fn new(max_send_queue: usize) -> Self {
        Self {
            connections: DashMap::new(),
            max_send_queue,
        }
    }

    /// Register a new connection and return its id plus the queue's read end.
    pub fn register(&self) -> (ConnectionId, mpsc::Receiver<String>) {
        let id = ConnectionId::new();
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        let connection = Arc::new(Connection::new(id.clone(), tx));
        self.connections.insert(id.clone(), connection);
        (id, rx)
    }

    /// Remove a connection by id. Dropping its sender wakes the writer task.
    pub fn unregister(&self, id: &ConnectionId) {
        if let Some((_, connection)) = self.connections.remove(id) {
            connection.mark_disconnected();
        }
    }

    /// Non-blocking enqueue of an outbound frame. Never stalls the caller.
    pub fn try_send(&self, id: &ConnectionId, frame: String) -> Result<(), DeliveryError> {
        let Some(connection) = self.connections.get(id) else {
            return Err(DeliveryError::Unknown);
        };
        match connection.tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(DeliveryError::QueueFull),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(DeliveryError::Closed),
        }
    }

    pub fn record_pong(&self, id: &ConnectionId) {
        if let Some(connection) = self.connections.get(id) {
            connection.record_pong();
        }
    }

    /// Number of registered connections.
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Remove connections that haven't answered a ping within the timeout.
    pub fn cleanup_dead(&self) -> usize {
        let dead: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|entry| !entry.value().is_alive())
            .map(|entry| entry.value().id.clone())
            .collect();

        let removed = dead.len();
        for id in dead {
            self.unregister(&id);
            tracing::info!(connection_id = %id, "cleaned up dead connection");
        }
        removed
    }
}

/// Drive one WebSocket connection to completion.
///
/// The writer task drains the outbound queue and pings on an interval; the
/// reader loop feeds inbound text frames to the session. Whichever side ends
/// first tears the whole connection down, and the disconnect transition runs
/// exactly once, here, at the end.
pub async fn handle_connection(
    socket: WebSocket,
    mut session: Session,
    rx: mpsc::Receiver<String>,
    registry: Arc<ConnectionRegistry>,
) {
    let conn_id = session.connection_id().clone();
    let (ws_tx, mut ws_rx) = socket.split();

    let mut writer = tokio::spawn(writer_loop(ws_tx, rx));

    loop {
        tokio::select! {
            frame = ws_rx.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => session.handle_text(&text),
                Some(Ok(WsMessage::Pong(_))) => registry.record_pong(&conn_id),
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    tracing::debug!(connection_id = %conn_id, %err, "socket read error");
                    break;
                }
            },
            _ = &mut writer => break,
        }
    }

    session.disconnect();
    registry.unregister(&conn_id);
    writer.abort();
}

async fn writer_loop(
    mut ws_tx: SplitSink<WebSocket, WsMessage>,
    mut rx: mpsc::Receiver<String>,
) {
    let mut ping_interval = tokio::time::interval(HEARTBEAT_INTERVAL);
    ping_interval.tick().await; // consume first immediate tick

    loop {
        tokio::select! {
            frame = rx.recv() => {
                match frame {
                    Some(text) => {
                        if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = ping_interval.tick() => {
                if ws_tx.send(WsMessage::Ping(vec![].into())).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Start a background task that periodically sweeps dead connections.
pub fn start_cleanup_task(
    registry: Arc<ConnectionRegistry>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let removed = registry.cleanup_dead();
            if removed > 0 {
                tracing::info!(removed, "dead connection sweep");
            }
        }
    })
}
