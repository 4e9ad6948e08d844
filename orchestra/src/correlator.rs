// orchestra/src/correlator.rs - Correlated request/response on top of the bus

use orchestra_core::{new_correlation_id, Envelope, Payload};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::Instrument;

use crate::bus::{handler, Bus, Handler, SubscriptionId};
use crate::config::CorrelatorConfig;
use crate::error::{CallError, CorrelatorError};
use crate::observability::SpanBuilder;

/// Callback receiving the outcome of a correlated call, invoked exactly once
pub type ReplyCallback = Box<dyn FnOnce(Result<Envelope, CallError>) + Send + 'static>;

struct PendingCall {
    topic: String,
    callback: ReplyCallback,
    created_at: Instant,
    deadline: Instant,
}

type PendingTable = Arc<Mutex<HashMap<String, PendingCall>>>;

// ============ REQUEST ============

/// Outbound correlated request
#[derive(Debug, Clone)]
pub struct Request {
    pub topic: String,
    pub payload: Payload,
    pub headers: HashMap<String, String>,
    pub correlation_id: Option<String>,
    pub timeout: Option<Duration>,
}

impl Request {
    pub fn new(topic: impl Into<String>, payload: Payload) -> Self {
        Self {
            topic: topic.into(),
            payload,
            headers: HashMap::new(),
            correlation_id: None,
            timeout: None,
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

// ============ CORRELATOR ============

/// Messaging context of one node.
///
/// Owns the bus handle, the pending call table and the timeout sweep.
/// Replies are received on a private response topic
/// `<prefix>.<app_id>.<uuid>` and matched strictly by correlation id.
pub struct Correlator {
    bus: Arc<dyn Bus>,
    app_id: String,
    response_topic: String,
    response_subscription: SubscriptionId,
    default_timeout: Duration,
    pending: PendingTable,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Correlator {
    /// Subscribe to the private response topic and start the timeout sweep
    pub async fn start(bus: Arc<dyn Bus>, config: CorrelatorConfig) -> Result<Arc<Self>, CorrelatorError> {
        let response_topic = format!(
            "{}.{}.{}",
            config.response_prefix,
            config.app_id,
            uuid::Uuid::new_v4().simple()
        );
        let pending: PendingTable = Arc::new(Mutex::new(HashMap::new()));

        let table = pending.clone();
        let response_subscription = bus
            .subscribe(
                &response_topic,
                handler(move |envelope| {
                    let table = table.clone();
                    async move { resolve(&table, envelope) }
                }),
            )
            .await?;

        let sweeper = spawn_sweeper(pending.clone(), config.sweep_interval);

        tracing::info!(
            app_id = %config.app_id,
            response_topic = %response_topic,
            "Correlator started"
        );

        Ok(Arc::new(Self {
            bus,
            app_id: config.app_id,
            response_topic,
            response_subscription,
            default_timeout: config.default_timeout,
            pending,
            sweeper: Mutex::new(Some(sweeper)),
        }))
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn response_topic(&self) -> &str {
        &self.response_topic
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Number of calls still waiting for a reply
    pub fn pending_calls(&self) -> usize {
        self.pending.lock().len()
    }

    /// Issue a call and return its correlation id immediately.
    ///
    /// `on_reply` runs exactly once with the reply or a [`CallError`]. When the
    /// publish itself fails the call is forgotten, `on_reply` never runs and
    /// the error is returned here.
    pub async fn call_async<F>(&self, request: Request, on_reply: F) -> Result<String, CorrelatorError>
    where
        F: FnOnce(Result<Envelope, CallError>) + Send + 'static,
    {
        let correlation_id = request.correlation_id.unwrap_or_else(new_correlation_id);
        let timeout = request.timeout.unwrap_or(self.default_timeout);
        let now = Instant::now();

        {
            let mut pending = self.pending.lock();
            if pending.contains_key(&correlation_id) {
                return Err(CorrelatorError::DuplicateCorrelationId(correlation_id));
            }
            pending.insert(
                correlation_id.clone(),
                PendingCall {
                    topic: request.topic.clone(),
                    callback: Box::new(on_reply),
                    created_at: now,
                    deadline: now + timeout,
                },
            );
        }

        let envelope = Envelope {
            topic: request.topic,
            payload: request.payload,
            correlation_id: correlation_id.clone(),
            reply_to: Some(self.response_topic.clone()),
            app_id: self.app_id.clone(),
            headers: request.headers,
        };
        let span = SpanBuilder::correlated_call(&envelope.topic, &correlation_id);

        if let Err(e) = self.bus.publish(envelope).instrument(span).await {
            self.pending.lock().remove(&correlation_id);
            return Err(e.into());
        }

        tracing::debug!(correlation_id = %correlation_id, timeout_ms = timeout.as_millis() as u64, "Call issued");
        Ok(correlation_id)
    }

    /// Issue a call and wait for its outcome
    pub async fn call_sync(&self, request: Request) -> Result<Envelope, CorrelatorError> {
        let topic = request.topic.clone();
        let (tx, rx) = oneshot::channel();

        self.call_async(request, move |outcome| {
            let _ = tx.send(outcome);
        })
        .await?;

        match rx.await {
            Ok(outcome) => Ok(outcome?),
            Err(_) => Err(CallError::Cancelled { topic }.into()),
        }
    }

    /// Publish a one-way envelope with an explicit correlation id and no `reply_to`
    pub async fn notify(&self, topic: &str, payload: Payload, correlation_id: &str) -> Result<(), CorrelatorError> {
        let envelope = Envelope::new(topic, payload)
            .with_correlation_id(correlation_id)
            .with_app_id(self.app_id.as_str());
        self.bus.publish(envelope).await?;
        Ok(())
    }

    /// Publish `envelope` as is, stamping this node's `app_id` if it has none
    pub async fn publish(&self, mut envelope: Envelope) -> Result<(), CorrelatorError> {
        if envelope.app_id.is_empty() {
            envelope.app_id = self.app_id.clone();
        }
        self.bus.publish(envelope).await?;
        Ok(())
    }

    /// Serve requests on `topic`. A `Some` result from `endpoint` is sent back
    /// to the request's `reply_to` with the same correlation id.
    pub async fn register_async_endpoint<F, Fut>(
        &self,
        topic: &str,
        endpoint: F,
    ) -> Result<SubscriptionId, CorrelatorError>
    where
        F: Fn(Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<Payload>> + Send + 'static,
    {
        let bus = self.bus.clone();
        let app_id = self.app_id.clone();
        let endpoint = Arc::new(endpoint);

        let id = self
            .bus
            .subscribe(
                topic,
                handler(move |request: Envelope| {
                    let bus = bus.clone();
                    let app_id = app_id.clone();
                    let endpoint = endpoint.clone();
                    async move {
                        let correlation_id = request.correlation_id.clone();
                        let reply_to = request.reply_to.clone();
                        let Some(payload) = endpoint(request.clone()).await else {
                            return;
                        };
                        let Some(reply) = reply_envelope(&request, payload, &app_id) else {
                            tracing::warn!(
                                correlation_id = %correlation_id,
                                bus.topic = %request.topic,
                                "Request has no reply_to, reply dropped"
                            );
                            return;
                        };
                        if let Err(e) = bus.publish(reply).await {
                            tracing::error!(
                                correlation_id = %correlation_id,
                                reply_to = ?reply_to,
                                error = %e,
                                "Failed to publish reply"
                            );
                        }
                    }
                }),
            )
            .await?;

        tracing::debug!(bus.topic = %topic, "Async endpoint registered");
        Ok(id)
    }

    /// Serve one-way messages on `topic`
    pub async fn register_notification_endpoint<F, Fut>(
        &self,
        topic: &str,
        endpoint: F,
    ) -> Result<SubscriptionId, CorrelatorError>
    where
        F: Fn(Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = self.bus.subscribe(topic, handler(endpoint)).await?;
        tracing::debug!(bus.topic = %topic, "Notification endpoint registered");
        Ok(id)
    }

    pub async fn subscribe(&self, topic: &str, handler: Handler) -> Result<SubscriptionId, CorrelatorError> {
        Ok(self.bus.subscribe(topic, handler).await?)
    }

    pub async fn unsubscribe(&self, topic: &str, id: SubscriptionId) -> Result<(), CorrelatorError> {
        Ok(self.bus.unsubscribe(topic, id).await?)
    }

    /// Stop the sweep, cancel every pending call and release the bus
    pub async fn shutdown(&self) -> Result<(), CorrelatorError> {
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.abort();
        }

        self.bus
            .unsubscribe(&self.response_topic, self.response_subscription)
            .await?;

        let cancelled: Vec<PendingCall> = self.pending.lock().drain().map(|(_, call)| call).collect();
        if !cancelled.is_empty() {
            tracing::warn!(calls = cancelled.len(), "Cancelling pending calls on shutdown");
        }
        for call in cancelled {
            let topic = call.topic.clone();
            invoke(call.callback, Err(CallError::Cancelled { topic }));
        }

        self.bus.close().await?;
        tracing::info!(app_id = %self.app_id, "Correlator shut down");
        Ok(())
    }
}

impl Drop for Correlator {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.get_mut().take() {
            sweeper.abort();
        }
    }
}

// ============ MATCHING & EXPIRY ============

fn reply_envelope(request: &Envelope, payload: Payload, app_id: &str) -> Option<Envelope> {
    let reply_to = request.reply_to.as_ref()?;
    Some(
        Envelope::new(reply_to.as_str(), payload)
            .with_correlation_id(request.correlation_id.as_str())
            .with_app_id(app_id),
    )
}

/// Match a reply to its pending call. Unknown ids are dropped.
fn resolve(pending: &Mutex<HashMap<String, PendingCall>>, envelope: Envelope) {
    let call = pending.lock().remove(&envelope.correlation_id);
    match call {
        Some(call) => {
            tracing::debug!(
                correlation_id = %envelope.correlation_id,
                call.topic = %call.topic,
                latency_ms = call.created_at.elapsed().as_millis() as u64,
                "Reply matched"
            );
            invoke(call.callback, Ok(envelope));
        }
        None => {
            tracing::debug!(
                correlation_id = %envelope.correlation_id,
                app_id = %envelope.app_id,
                "Discarding reply without pending call"
            );
        }
    }
}

/// Resolve every call whose deadline passed. Returns how many expired.
fn expire(pending: &Mutex<HashMap<String, PendingCall>>, now: Instant) -> usize {
    let expired: Vec<(String, PendingCall)> = {
        let mut table = pending.lock();
        let ids: Vec<String> = table
            .iter()
            .filter(|(_, call)| call.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        ids.into_iter()
            .filter_map(|id| table.remove(&id).map(|call| (id, call)))
            .collect()
    };

    let count = expired.len();
    for (correlation_id, call) in expired {
        let timeout = call.deadline - call.created_at;
        tracing::warn!(
            correlation_id = %correlation_id,
            call.topic = %call.topic,
            timeout_ms = timeout.as_millis() as u64,
            "Call timed out"
        );
        invoke(call.callback, Err(CallError::Timeout { topic: call.topic, timeout }));
    }
    count
}

fn spawn_sweeper(pending: PendingTable, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            expire(&pending, Instant::now());
        }
    })
}

/// Run a callback outside any lock, containing panics
fn invoke(callback: ReplyCallback, outcome: Result<Envelope, CallError>) {
    if std::panic::catch_unwind(AssertUnwindSafe(move || callback(outcome))).is_err() {
        tracing::error!("Reply callback panicked");
    }
}
