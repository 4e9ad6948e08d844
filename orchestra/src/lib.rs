// orchestra/src/lib.rs - Correlated messaging and service instantiation runtime

// ============ MODULES ============
pub mod bus;
pub mod config;
pub mod correlator;
pub mod error;
pub mod observability;
pub mod orchestrator;
pub mod records;
pub mod workflow;

// ============ RE-EXPORTS ============

pub use orchestra_core::{
    topics, ContentType, DeployRequest, DeployResult, DeploymentRecords, Envelope, FirstAvailable, Heartbeat,
    MonitoringBuilder, Payload, PluginState, RecordBuilder, Registration, ResourceRecord, ResourceSelector,
    ServiceRequest, ServiceStatus, StatusReport,
};

// Re-export the entire orchestra_core crate for downstream use
pub use orchestra_core;

pub use bus::{Bus, InMemoryBus, NatsBus, SubscriptionId};
pub use config::{BaseConfiguration, CorrelatorConfig, OrchestraConfig, OrchestratorConfig, Topics};
pub use correlator::{Correlator, Request};
pub use error::{BusError, CallError, CorrelatorError, OrchestratorError, WorkflowError};
pub use orchestrator::{Orchestrator, OrchestratorHandle};
pub use records::{AdaptorRecords, ServiceMonitoring};
pub use workflow::{Collaborators, Effect, ServiceInstance, Workflow, WorkflowState};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// ============ PROVIDER ============

/// One lifecycle manager node: the NATS connection plus its messaging context
#[derive(Clone)]
pub struct OrchestraProvider {
    nc: async_nats::Client,
    correlator: Arc<Correlator>,
    config: OrchestraConfig,
}

impl OrchestraProvider {
    /// Create with automatic NATS discovery and setup
    /// This is the main constructor users should use
    pub async fn new() -> Result<OrchestraProvider> {
        tracing::info!("🚀 Initializing Orchestra service lifecycle runtime");
        Self::try_new(OrchestraConfig::from_env()).await
    }

    /// Create with explicit NATS URL (for simple cases)
    pub async fn with_nats_url(nats_url: impl Into<String>) -> Result<OrchestraProvider> {
        let config = OrchestraConfig {
            base: BaseConfiguration::with_nats_url(nats_url),
            ..OrchestraConfig::default()
        };
        Self::try_new(config).await
    }

    pub async fn try_new(config: OrchestraConfig) -> Result<OrchestraProvider> {
        let nc = config.base.get_nats_connection().await?;
        let bus: Arc<dyn Bus> = Arc::new(NatsBus::new(nc.clone()));

        let correlator = Correlator::start(bus, config.correlator.clone())
            .await
            .map_err(|e| anyhow::anyhow!("Failed to start correlator: {}", e))?;

        tracing::info!(
            app_id = %correlator.app_id(),
            response_topic = %correlator.response_topic(),
            "✅ Orchestra provider initialized successfully!"
        );
        Ok(OrchestraProvider { nc, correlator, config })
    }

    /// Start the service instantiation orchestrator with the given collaborators
    pub async fn start_orchestrator(&self, collaborators: Collaborators) -> Result<OrchestratorHandle> {
        Orchestrator::start(self.correlator.clone(), self.config.orchestrator.clone(), collaborators)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to start orchestrator: {}", e))
    }

    /// Health check for the node
    pub fn health_check(&self, orchestrator: Option<&OrchestratorHandle>) -> HealthStatus {
        let mut status = HealthStatus::new();

        status.nats = match self.nc.connection_state() {
            async_nats::connection::State::Connected => ServiceHealth::Healthy,
            state => ServiceHealth::Unhealthy(format!("NATS connection {:?}", state)),
        };

        status.pending_calls = self.correlator.pending_calls();
        if let Some(handle) = orchestrator {
            status.plugin_state = handle.state();
            status.orchestrator = match handle.state() {
                PluginState::Failed => ServiceHealth::Unhealthy("orchestrator failed".to_string()),
                _ if handle.is_finished() => ServiceHealth::Unhealthy("orchestrator stopped".to_string()),
                _ => ServiceHealth::Healthy,
            };
        }

        status.overall = if status.is_healthy() {
            ServiceHealth::Healthy
        } else {
            ServiceHealth::Unhealthy("One or more services unhealthy".to_string())
        };
        status
    }

    pub fn correlator(&self) -> &Arc<Correlator> {
        &self.correlator
    }

    pub fn config(&self) -> &OrchestraConfig {
        &self.config
    }

    /// Get access to the underlying NATS client
    pub fn nats_client(&self) -> &async_nats::Client {
        &self.nc
    }

    /// Cancel pending calls and release the connection
    pub async fn shutdown(&self) -> Result<()> {
        self.correlator
            .shutdown()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to shut down cleanly: {}", e))
    }
}

// ============ HEALTH CHECK TYPES ============

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub overall: ServiceHealth,
    pub nats: ServiceHealth,
    pub orchestrator: ServiceHealth,
    pub plugin_state: PluginState,
    pub pending_calls: usize,
}

impl HealthStatus {
    fn new() -> Self {
        Self {
            overall: ServiceHealth::Unknown,
            nats: ServiceHealth::Unknown,
            orchestrator: ServiceHealth::Unknown,
            plugin_state: PluginState::Ready,
            pending_calls: 0,
        }
    }

    fn is_healthy(&self) -> bool {
        matches!(self.nats, ServiceHealth::Healthy)
            && !matches!(self.orchestrator, ServiceHealth::Unhealthy(_))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServiceHealth {
    Healthy,
    Unhealthy(String),
    Unknown,
}
