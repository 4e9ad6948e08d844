// orchestra/src/bus/nats.rs - NATS backed bus

use async_nats::HeaderMap;
use async_trait::async_trait;
use futures::StreamExt;
use orchestra_core::{new_correlation_id, ContentType, Envelope, Payload};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use super::{Bus, Handler, Lane, SubscriptionId};
use crate::error::BusError;

pub const HEADER_CORRELATION_ID: &str = "Correlation-Id";
pub const HEADER_APP_ID: &str = "App-Id";
pub const HEADER_CONTENT_TYPE: &str = "Content-Type";

const RESERVED_HEADERS: [&str; 3] = [HEADER_CORRELATION_ID, HEADER_APP_ID, HEADER_CONTENT_TYPE];

struct NatsSubscription {
    lane: Lane,
    reader: JoinHandle<()>,
}

/// Bus over a shared NATS connection.
///
/// Envelope properties travel as NATS headers, `reply_to` as the native
/// reply subject.
pub struct NatsBus {
    client: async_nats::Client,
    subscriptions: RwLock<HashMap<String, Vec<NatsSubscription>>>,
    closed: AtomicBool,
}

impl NatsBus {
    pub fn new(client: async_nats::Client) -> Self {
        Self {
            client,
            subscriptions: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn client(&self) -> &async_nats::Client {
        &self.client
    }
}

fn to_headers(envelope: &Envelope) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (key, value) in &envelope.headers {
        if !RESERVED_HEADERS.contains(&key.as_str()) {
            headers.insert(key.as_str(), value.as_str());
        }
    }
    headers.insert(HEADER_CORRELATION_ID, envelope.correlation_id.as_str());
    headers.insert(HEADER_APP_ID, envelope.app_id.as_str());
    headers.insert(HEADER_CONTENT_TYPE, envelope.content_type().as_str());
    headers
}

fn to_envelope(message: async_nats::Message) -> Envelope {
    let mut correlation_id = None;
    let mut app_id = String::new();
    let mut content_type = ContentType::Json;
    let mut headers = HashMap::new();

    if let Some(map) = &message.headers {
        for (name, values) in map.iter() {
            let Some(value) = values.first() else { continue };
            let name = name.to_string();
            let value = value.as_str().to_string();
            match name.as_str() {
                HEADER_CORRELATION_ID => correlation_id = Some(value),
                HEADER_APP_ID => app_id = value,
                HEADER_CONTENT_TYPE => match value.parse() {
                    Ok(parsed) => content_type = parsed,
                    Err(e) => tracing::warn!(
                        nats.subject = %message.subject,
                        error = %e,
                        "Unknown content type, assuming JSON"
                    ),
                },
                _ => {
                    headers.insert(name, value);
                }
            }
        }
    }

    Envelope {
        topic: message.subject.to_string(),
        payload: Payload::new(content_type, message.payload.to_vec()),
        correlation_id: correlation_id.unwrap_or_else(new_correlation_id),
        reply_to: message.reply.map(|subject| subject.to_string()),
        app_id,
        headers,
    }
}

#[async_trait]
impl Bus for NatsBus {
    async fn publish(&self, envelope: Envelope) -> Result<(), BusError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed);
        }

        let headers = to_headers(&envelope);
        let body = envelope.payload.body.into();
        let result = match envelope.reply_to {
            Some(reply_to) => {
                self.client
                    .publish_with_reply_and_headers(envelope.topic.clone(), reply_to, headers, body)
                    .await
            }
            None => {
                self.client
                    .publish_with_headers(envelope.topic.clone(), headers, body)
                    .await
            }
        };

        result.map_err(|e| BusError::Transport(format!("publish to {} failed: {}", envelope.topic, e)))
    }

    async fn subscribe(&self, topic: &str, handler: Handler) -> Result<SubscriptionId, BusError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed);
        }

        let mut subscriber = self
            .client
            .subscribe(topic.to_string())
            .await
            .map_err(|e| BusError::Transport(format!("subscribe to {} failed: {}", topic, e)))?;

        let lane = Lane::spawn(topic, handler);
        let id = lane.id;
        let sender = lane.clone_sender();
        let subject = topic.to_string();

        let reader = tokio::spawn(async move {
            while let Some(message) = subscriber.next().await {
                if sender.send(to_envelope(message)).is_err() {
                    break;
                }
            }
            tracing::debug!(nats.subject = %subject, "NATS subscription stream ended");
        });

        self.subscriptions
            .write()
            .await
            .entry(topic.to_string())
            .or_default()
            .push(NatsSubscription { lane, reader });

        tracing::debug!(nats.subject = %topic, bus.subscription = %id, "Subscribed");
        Ok(id)
    }

    async fn unsubscribe(&self, topic: &str, id: SubscriptionId) -> Result<(), BusError> {
        let removed = {
            let mut subscriptions = self.subscriptions.write().await;
            let Some(entries) = subscriptions.get_mut(topic) else {
                return Ok(());
            };
            let removed = entries
                .iter()
                .position(|entry| entry.lane.id == id)
                .map(|index| entries.remove(index));
            if entries.is_empty() {
                subscriptions.remove(topic);
            }
            removed
        };

        if let Some(entry) = removed {
            // Dropping the subscriber inside the reader unsubscribes server side
            entry.reader.abort();
            entry.lane.close();
            tracing::debug!(nats.subject = %topic, bus.subscription = %id, "Unsubscribed");
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), BusError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let entries: Vec<NatsSubscription> = self
            .subscriptions
            .write()
            .await
            .drain()
            .flat_map(|(_, entries)| entries)
            .collect();
        for entry in entries {
            entry.reader.abort();
            entry.lane.close();
        }

        self.client
            .flush()
            .await
            .map_err(|e| BusError::Transport(format!("flush on close failed: {}", e)))?;

        tracing::info!("🔌 NATS bus closed");
        Ok(())
    }
}
