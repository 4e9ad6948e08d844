// orchestra/src/bus/mod.rs - Topic based publish/subscribe primitive

mod memory;
mod nats;

pub use memory::InMemoryBus;
pub use nats::NatsBus;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use orchestra_core::Envelope;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::Instrument;

use crate::error::BusError;
use crate::observability::SpanBuilder;

/// Callback invoked once per delivered envelope
pub type Handler = Arc<dyn Fn(Envelope) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async closure into a [`Handler`]
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |envelope| f(envelope).boxed())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        SubscriptionId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Shared publish/subscribe connection.
///
/// Delivery is at-most-once to every subscription registered on the topic at
/// publish time. Envelopes from one publisher on one topic reach each
/// subscriber in publish order.
#[async_trait]
pub trait Bus: Send + Sync {
    async fn publish(&self, envelope: Envelope) -> Result<(), BusError>;

    async fn subscribe(&self, topic: &str, handler: Handler) -> Result<SubscriptionId, BusError>;

    async fn unsubscribe(&self, topic: &str, id: SubscriptionId) -> Result<(), BusError>;

    /// Release the connection. Later publishes fail with [`BusError::Closed`].
    async fn close(&self) -> Result<(), BusError>;
}

// ============ DELIVERY LANES ============

/// Per-subscription delivery queue drained by its own task
pub(crate) struct Lane {
    pub id: SubscriptionId,
    sender: mpsc::UnboundedSender<Envelope>,
}

impl Lane {
    pub fn spawn(topic: &str, handler: Handler) -> Lane {
        let id = SubscriptionId::next();
        let (sender, mut receiver) = mpsc::unbounded_channel::<Envelope>();
        let topic = topic.to_string();

        tokio::spawn(async move {
            while let Some(envelope) = receiver.recv().await {
                let span = SpanBuilder::bus_delivery(&topic, &envelope.correlation_id, id);
                let correlation_id = envelope.correlation_id.clone();
                let handler = handler.clone();

                let outcome = AssertUnwindSafe(async move { handler(envelope).await })
                    .catch_unwind()
                    .instrument(span)
                    .await;

                if let Err(panic) = outcome {
                    tracing::error!(
                        bus.topic = %topic,
                        bus.subscription = %id,
                        correlation_id = %correlation_id,
                        panic = %panic_message(panic.as_ref()),
                        "Subscription handler panicked"
                    );
                }
            }
            tracing::trace!(bus.topic = %topic, bus.subscription = %id, "Delivery lane closed");
        });

        Lane { id, sender }
    }

    pub fn deliver(&self, envelope: Envelope) -> bool {
        self.sender.send(envelope).is_ok()
    }

    pub fn clone_sender(&self) -> mpsc::UnboundedSender<Envelope> {
        self.sender.clone()
    }

    /// Stop accepting envelopes; already queued ones are still delivered
    pub fn close(self) {
        drop(self.sender);
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
