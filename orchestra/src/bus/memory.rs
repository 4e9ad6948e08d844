// orchestra/src/bus/memory.rs - Process-local broker

use async_trait::async_trait;
use orchestra_core::Envelope;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

use super::{Bus, Handler, Lane, SubscriptionId};
use crate::error::BusError;

/// In-memory broker shared by every node of a process.
///
/// Each subscription owns a delivery lane, so a slow handler only delays
/// its own queue. Mostly used to run whole workflows in tests.
#[derive(Default)]
pub struct InMemoryBus {
    topics: RwLock<HashMap<String, Vec<Lane>>>,
    closed: AtomicBool,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscriptions on `topic`
    pub async fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.read().await.get(topic).map_or(0, Vec::len)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Bus for InMemoryBus {
    async fn publish(&self, envelope: Envelope) -> Result<(), BusError> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }

        let topics = self.topics.read().await;
        let Some(lanes) = topics.get(&envelope.topic) else {
            tracing::trace!(
                bus.topic = %envelope.topic,
                correlation_id = %envelope.correlation_id,
                "No subscribers, envelope dropped"
            );
            return Ok(());
        };

        for lane in lanes {
            if !lane.deliver(envelope.clone()) {
                tracing::debug!(bus.topic = %envelope.topic, bus.subscription = %lane.id, "Lane already closed");
            }
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str, handler: Handler) -> Result<SubscriptionId, BusError> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }

        let lane = Lane::spawn(topic, handler);
        let id = lane.id;
        self.topics
            .write()
            .await
            .entry(topic.to_string())
            .or_default()
            .push(lane);

        tracing::debug!(bus.topic = %topic, bus.subscription = %id, "Subscribed");
        Ok(id)
    }

    async fn unsubscribe(&self, topic: &str, id: SubscriptionId) -> Result<(), BusError> {
        let removed = {
            let mut topics = self.topics.write().await;
            let Some(lanes) = topics.get_mut(topic) else {
                return Ok(());
            };
            let position = lanes.iter().position(|lane| lane.id == id);
            let removed = position.map(|index| lanes.remove(index));
            if lanes.is_empty() {
                topics.remove(topic);
            }
            removed
        };

        if let Some(lane) = removed {
            lane.close();
            tracing::debug!(bus.topic = %topic, bus.subscription = %id, "Unsubscribed");
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), BusError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let lanes: Vec<Lane> = self.topics.write().await.drain().flat_map(|(_, lanes)| lanes).collect();
        tracing::debug!(bus.lanes = lanes.len(), "In-memory bus closed");
        for lane in lanes {
            lane.close();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::handler;
    use orchestra_core::Payload;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    fn text(topic: &str, body: &str) -> Envelope {
        Envelope::new(topic, Payload::json(&body).unwrap())
    }

    fn collector() -> (Handler, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let h = handler(move |envelope| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(envelope);
            }
        });
        (h, rx)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Envelope>) -> Envelope {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("delivery timed out")
            .expect("lane closed")
    }

    #[tokio::test]
    async fn fan_out_reaches_every_subscriber() {
        let bus = InMemoryBus::new();
        let (first, mut first_rx) = collector();
        let (second, mut second_rx) = collector();
        bus.subscribe("test.interleave", first).await.unwrap();
        bus.subscribe("test.interleave", second).await.unwrap();

        bus.publish(text("test.interleave", "my-notification1")).await.unwrap();

        let a: String = next(&mut first_rx).await.decode().unwrap();
        let b: String = next(&mut second_rx).await.decode().unwrap();
        assert_eq!(a, "my-notification1");
        assert_eq!(b, "my-notification1");
    }

    #[tokio::test]
    async fn per_publisher_order_is_preserved() {
        let bus = InMemoryBus::new();
        let (h, mut rx) = collector();
        bus.subscribe("test.order", h).await.unwrap();

        for i in 0..100u32 {
            bus.publish(Envelope::new("test.order", Payload::json(&i).unwrap())).await.unwrap();
        }

        for expected in 0..100u32 {
            let got: u32 = next(&mut rx).await.decode().unwrap();
            assert_eq!(got, expected);
        }
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = InMemoryBus::new();
        let (h, mut rx) = collector();
        let id = bus.subscribe("test.unsub", h).await.unwrap();

        bus.unsubscribe("test.unsub", id).await.unwrap();
        bus.publish(text("test.unsub", "gone")).await.unwrap();

        assert_eq!(bus.subscriber_count("test.unsub").await, 0);
        assert!(timeout(Duration::from_millis(100), rx.recv()).await.map_or(true, |m| m.is_none()));
    }

    #[tokio::test]
    async fn panicking_handler_does_not_stop_the_lane() {
        let bus = InMemoryBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let h = handler(move |envelope: Envelope| {
            let tx = tx.clone();
            async move {
                let body: String = envelope.decode().unwrap();
                if body == "boom" {
                    panic!("handler blew up");
                }
                let _ = tx.send(body);
            }
        });
        bus.subscribe("test.panic", h).await.unwrap();

        bus.publish(text("test.panic", "boom")).await.unwrap();
        bus.publish(text("test.panic", "after")).await.unwrap();

        let got = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(got, "after");
    }

    #[tokio::test]
    async fn slow_handler_does_not_delay_siblings_or_other_topics() {
        let bus = InMemoryBus::new();
        let slow = handler(|_envelope: Envelope| async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
        });
        let (sibling, mut sibling_rx) = collector();
        let (elsewhere, mut elsewhere_rx) = collector();
        bus.subscribe("test.slow", slow).await.unwrap();
        bus.subscribe("test.slow", sibling).await.unwrap();
        bus.subscribe("test.fast", elsewhere).await.unwrap();

        bus.publish(text("test.slow", "first")).await.unwrap();
        bus.publish(text("test.slow", "second")).await.unwrap();
        bus.publish(text("test.fast", "other")).await.unwrap();

        let within = Duration::from_millis(200);
        let a: String = timeout(within, sibling_rx.recv()).await.unwrap().unwrap().decode().unwrap();
        let b: String = timeout(within, sibling_rx.recv()).await.unwrap().unwrap().decode().unwrap();
        let c: String = timeout(within, elsewhere_rx.recv()).await.unwrap().unwrap().decode().unwrap();
        assert_eq!((a.as_str(), b.as_str(), c.as_str()), ("first", "second", "other"));
    }

    #[tokio::test]
    async fn publish_after_close_fails() {
        let bus = InMemoryBus::new();
        bus.close().await.unwrap();

        let result = bus.publish(text("test.closed", "late")).await;
        assert!(matches!(result, Err(BusError::Closed)));
        assert!(bus.is_closed());
    }
}
