//! Event Bus (component A): an in-process dispatcher multiplexed onto a
//! cluster-wide pub/sub channel, with `ignoreLocal`/`ignoreRemote` dispatch
//! filters (§4.1).

pub mod transport;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub use transport::{ClusterTransport, WireFrame};

/// Opaque token returned by [`EventBus::on`], used to later call
/// [`EventBus::off`]. Mirrors taking a bound function reference at
/// registration time (§9 "dynamic dispatch").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Filters controlling which of a handler's two delivery paths fire.
#[derive(Debug, Clone, Copy, Default)]
pub struct HandlerOptions {
    /// Skip delivery when the event originated in this process.
    pub ignore_local: bool,
    /// Skip delivery when the event arrived from a peer over the transport.
    pub ignore_remote: bool,
}

impl HandlerOptions {
    #[must_use]
    pub fn ignore_local() -> Self {
        Self { ignore_local: true, ignore_remote: false }
    }

    #[must_use]
    pub fn ignore_remote() -> Self {
        Self { ignore_local: false, ignore_remote: true }
    }

    fn admits(&self, is_local: bool) -> bool {
        if is_local { !self.ignore_local } else { !self.ignore_remote }
    }
}

type Handler = Arc<dyn Fn(serde_json::Value, bool) -> BoxFuture<'static, crate::Result<()>> + Send + Sync>;

struct Registration {
    id: HandlerId,
    handler: Handler,
    opts: HandlerOptions,
}

/// The dispatcher. Local `emit` is synchronous (handlers awaited serially,
/// in registration order); remote frames preserve per-sender order but not
/// cross-sender order, since each sender's frames are delivered by whichever
/// task is consuming that connection.
pub struct EventBus {
    handlers: DashMap<String, Vec<Registration>>,
    transport: Arc<dyn ClusterTransport>,
    process_id: String,
    next_id: AtomicU64,
}

impl EventBus {
    #[must_use]
    pub fn new(transport: Arc<dyn ClusterTransport>, process_id: impl Into<String>) -> Self {
        Self {
            handlers: DashMap::new(),
            transport,
            process_id: process_id.into(),
            next_id: AtomicU64::new(0),
        }
    }

    /// Register an async handler for `topic`. Returns a token for `off`.
    pub fn on<F, Fut>(&self, topic: impl Into<String>, opts: HandlerOptions, handler: F) -> HandlerId
    where
        F: Fn(serde_json::Value, bool) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = crate::Result<()>> + Send + 'static,
    {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let handler: Handler = Arc::new(move |payload, is_local| Box::pin(handler(payload, is_local)));
        self.handlers.entry(topic.into()).or_default().push(Registration { id, handler, opts });
        id
    }

    /// Unregister a handler; a no-op if it's already gone.
    pub fn off(&self, topic: &str, id: HandlerId) {
        if let Some(mut regs) = self.handlers.get_mut(topic) {
            regs.retain(|r| r.id != id);
        }
    }

    /// Deliver `payload` to every handler on `topic` admitting `is_local`,
    /// awaiting each in turn; then, if `is_local`, publish the frame for
    /// peers. A handler's error is logged and does not stop dispatch to the
    /// remaining handlers (§7 Propagation).
    pub async fn emit(&self, topic: impl Into<String>, payload: serde_json::Value, is_local: bool) {
        let topic = topic.into();
        let targets: Vec<Handler> = self
            .handlers
            .get(&topic)
            .map(|regs| {
                regs.iter().filter(|r| r.opts.admits(is_local)).map(|r| r.handler.clone()).collect()
            })
            .unwrap_or_default();

        for handler in targets {
            if let Err(err) = handler(payload.clone(), is_local).await {
                warn!(topic = %topic, is_local, error = %err, "event handler failed");
            }
        }

        if is_local {
            let frame =
                WireFrame { topic: topic.clone(), body: payload, sender_id: self.process_id.clone() };
            if let Err(err) = self.transport.publish(frame).await {
                warn!(topic = %topic, error = %err, "failed to publish event to cluster transport");
            }
        }
    }

    /// Spawn a task that forwards frames from the cluster transport into
    /// local dispatch as `is_local = false`, discarding this process's own
    /// echoes (§6.1: "the transport echo is discarded").
    pub fn spawn_receiver(self: Arc<Self>) -> crate::Result<JoinHandle<()>> {
        let process_id = self.process_id.clone();
        let bus = self;
        Ok(tokio::spawn(async move {
            let mut stream = match bus.transport.subscribe().await {
                Ok(s) => s,
                Err(err) => {
                    warn!(error = %err, "failed to subscribe to cluster transport");
                    return;
                }
            };
            use futures::StreamExt;
            while let Some(frame) = stream.next().await {
                if frame.sender_id == process_id {
                    continue;
                }
                debug!(topic = %frame.topic, sender = %frame.sender_id, "received remote event");
                bus.emit(frame.topic.clone(), frame.body, false).await;
            }
        }))
    }
}
