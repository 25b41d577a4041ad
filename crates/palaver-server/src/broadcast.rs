use std::sync::Arc;

use palaver_core::ConnectionId;
use palaver_telemetry::{names, MetricsRecorder};

use crate::client::{ConnectionRegistry, DeliveryError};
use crate::wire::ServerFrame;

/// Best-effort delivery of serialized frames to connection outbound queues.
///
/// Every send is a non-blocking `try_send`: a slow or dead peer loses frames
/// (logged and counted), it never stalls the sender or its room. That makes
/// the broadcaster safe to call while holding a room's entry lock, which is
/// exactly where the fan-out of a room event belongs.
#[derive(Clone)]
pub struct Broadcaster {
    connections: Arc<ConnectionRegistry>,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl Broadcaster {
    pub fn new(connections: Arc<ConnectionRegistry>) -> Self {
        Self {
            connections,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Option<Arc<MetricsRecorder>>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Deliver a frame to a single connection.
    pub fn send_to(&self, target: &ConnectionId, frame: &ServerFrame) {
        if let Ok(json) = serde_json::to_string(frame) {
            self.deliver(target, json);
        }
    }

    /// Deliver a frame to every listed member except `exclude`, skipping
    /// members whose queue is full or already closed.
    pub fn fan_out<'a>(
        &self,
        members: impl IntoIterator<Item = &'a ConnectionId>,
        exclude: Option<&ConnectionId>,
        frame: &ServerFrame,
    ) {
        let Ok(json) = serde_json::to_string(frame) else {
            return;
        };
        for member in members {
            if Some(member) == exclude {
                continue;
            }
            self.deliver(member, json.clone());
        }
    }

    fn deliver(&self, target: &ConnectionId, json: String) {
        match self.connections.try_send(target, json) {
            Ok(()) => {}
            Err(DeliveryError::QueueFull) => {
                tracing::warn!(connection_id = %target, "send queue full, dropping frame");
                self.count_drop();
            }
            Err(DeliveryError::Closed) | Err(DeliveryError::Unknown) => {
                // Peer is gone or going; its own disconnect path cleans up.
                tracing::debug!(connection_id = %target, "skipping closed connection");
                self.count_drop();
            }
        }
    }

    fn count_drop(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.counter_inc(names::FRAMES_DROPPED, 1);
        }
    }
}
