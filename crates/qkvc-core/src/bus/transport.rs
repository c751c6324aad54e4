//! Cluster transport abstraction: the event bus talks to peers through this
//! trait; the spec defines only the event contract (§6.1), not the wire
//! transport itself, so the concrete backend (NATS, Redis, a gossip mesh) is
//! left to the embedder.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

/// Framing on the wire: `{type: topicName, body: <payload>, senderId}`
/// (§6.1). `senderId` lets every receiver discard its own echoes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireFrame {
    #[serde(rename = "type")]
    pub topic: String,
    pub body: serde_json::Value,
    #[serde(rename = "senderId")]
    pub sender_id: String,
}

/// What [`crate::bus::EventBus`] needs from a cluster pub/sub channel.
#[async_trait]
pub trait ClusterTransport: Send + Sync {
    /// Broadcast a frame to every other process subscribed to the channel.
    async fn publish(&self, frame: WireFrame) -> crate::Result<()>;

    /// Open a stream of frames published by any process (including, for
    /// simple transports, this one's own publishes — callers must discard
    /// frames whose `sender_id` matches their own process id).
    async fn subscribe(&self) -> crate::Result<BoxStream<'static, WireFrame>>;
}

/// A transport backed by a single in-process broadcast channel. Useful for
/// single-process deployments and for tests that simulate a cluster by
/// wiring several [`crate::bus::EventBus`] instances to clones of the same
/// transport.
pub struct InMemoryClusterTransport {
    sender: tokio::sync::broadcast::Sender<WireFrame>,
}

impl InMemoryClusterTransport {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }
}

impl Default for InMemoryClusterTransport {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl ClusterTransport for InMemoryClusterTransport {
    async fn publish(&self, frame: WireFrame) -> crate::Result<()> {
        // No subscribers is not an error: a single-process deployment with
        // no peers still needs local dispatch to work.
        let _ = self.sender.send(frame);
        Ok(())
    }

    async fn subscribe(&self) -> crate::Result<BoxStream<'static, WireFrame>> {
        let receiver = self.sender.subscribe();
        let stream = futures::stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(frame) => return Some((frame, receiver)),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(Box::pin(stream))
    }
}
