// orchestra/src/observability.rs - Observability infrastructure for Orchestra

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info_span, Span};

use crate::bus::SubscriptionId;

// ============ CORRELATION CONTEXT ============

/// Context of one service instantiation, carried through every log line it produces
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationContext {
    /// Correlation id of the requester's create request
    pub correlation_id: String,
    /// Component that sent the request
    pub requester: String,
    /// Topic the request arrived on
    pub source_topic: String,
    /// Instance uuid, once assigned
    pub instance_uuid: Option<String>,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

impl CorrelationContext {
    pub fn new(
        correlation_id: impl Into<String>,
        requester: impl Into<String>,
        source_topic: impl Into<String>,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            requester: requester.into(),
            source_topic: source_topic.into(),
            instance_uuid: None,
            started_at: Utc::now(),
        }
    }

    pub fn with_instance_uuid(mut self, instance_uuid: impl Into<String>) -> Self {
        self.instance_uuid = Some(instance_uuid.into());
        self
    }

    pub fn elapsed_ms(&self) -> i64 {
        (Utc::now() - self.started_at).num_milliseconds()
    }
}

// ============ SPAN BUILDER ============

/// Builder for creating consistent tracing spans across layers
pub struct SpanBuilder;

impl SpanBuilder {
    /// Span around one handler invocation of a subscription
    pub fn bus_delivery(topic: &str, correlation_id: &str, subscription: SubscriptionId) -> Span {
        info_span!(
            "bus.delivery",
            correlation_id = %correlation_id,
            bus.topic = %topic,
            bus.subscription = %subscription,
            layer = "infrastructure"
        )
    }

    /// Span around issuing a correlated call
    pub fn correlated_call(topic: &str, correlation_id: &str) -> Span {
        info_span!(
            "correlator.call",
            correlation_id = %correlation_id,
            call.topic = %topic,
            layer = "messaging"
        )
    }

    /// Span around one workflow step
    pub fn workflow_step(ctx: &CorrelationContext, state: &str) -> Span {
        info_span!(
            "workflow.step",
            correlation_id = %ctx.correlation_id,
            instance.uuid = ?ctx.instance_uuid,
            workflow.state = %state,
            layer = "workflow"
        )
    }
}

// ============ OPERATION LOGGER ============

/// Structured logger for workflow and messaging flow
pub struct OperationLogger;

impl OperationLogger {
    pub fn workflow_started(ctx: &CorrelationContext) {
        tracing::info!(
            correlation_id = %ctx.correlation_id,
            requester = %ctx.requester,
            source.topic = %ctx.source_topic,
            "Service instantiation started"
        );
    }

    pub fn state_transition(ctx: &CorrelationContext, from: &str, to: &str) {
        tracing::info!(
            correlation_id = %ctx.correlation_id,
            instance.uuid = ?ctx.instance_uuid,
            workflow.state.from = %from,
            workflow.state.to = %to,
            "Workflow transition"
        );
    }

    pub fn workflow_completed(ctx: &CorrelationContext) {
        tracing::info!(
            correlation_id = %ctx.correlation_id,
            instance.uuid = ?ctx.instance_uuid,
            duration_ms = %ctx.elapsed_ms(),
            "✅ Service instantiation completed"
        );
    }

    pub fn workflow_failed(ctx: &CorrelationContext, error: &str) {
        tracing::error!(
            correlation_id = %ctx.correlation_id,
            instance.uuid = ?ctx.instance_uuid,
            error = %error,
            duration_ms = %ctx.elapsed_ms(),
            "❌ Service instantiation failed"
        );
    }

    /// Log a bus interaction made on behalf of a workflow
    pub fn bus_interaction(ctx: &CorrelationContext, operation: &str, topic: &str, correlation_id: &str) {
        tracing::debug!(
            correlation_id = %ctx.correlation_id,
            bus.operation = %operation,
            bus.topic = %topic,
            bus.correlation_id = %correlation_id,
            "Bus interaction"
        );
    }
}

// ============ TRACING SETUP ============

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_FILTER: &str = "orchestra=debug,service_lifecycle=debug,warn";

/// Initialize tracing with structured JSON output
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_target(true)
        .with_level(true)
        .json();

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

/// Human readable output for interactive use
pub fn init_tracing_pretty() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_tracks_instance_uuid() {
        let ctx = CorrelationContext::new("abc", "gatekeeper", "service.instances.create").with_instance_uuid("1234");
        assert_eq!(ctx.instance_uuid.as_deref(), Some("1234"));
        assert!(ctx.elapsed_ms() >= 0);
    }
}
