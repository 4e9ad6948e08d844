// orchestra/src/config.rs - Environment driven configuration

use anyhow::Result;
use orchestra_core::{topics, ContentType};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_NATS_URL: &str = "nats://127.0.0.1:4222";
pub const DEFAULT_APP_ID: &str = "orchestra.service-lifecycle";
pub const DEFAULT_RESPONSE_PREFIX: &str = "responses";
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_millis(250);

// ============ NATS CONNECTION ============

#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct BaseConfiguration {
    pub nats_url: String,
    pub nats_token: Option<String>,
    /// Connection name shown by the NATS server
    pub connection_name: String,
}

impl Default for BaseConfiguration {
    fn default() -> Self {
        Self::with_nats_url(DEFAULT_NATS_URL)
    }
}

impl BaseConfiguration {
    /// Create configuration from environment variables with sensible defaults
    pub fn from_env() -> Self {
        let nats_url = std::env::var("NATS_URL")
            .or_else(|_| std::env::var("NATS_SERVER"))
            .unwrap_or_else(|_| DEFAULT_NATS_URL.to_string());
        let nats_token = std::env::var("NATS_TOKEN").ok();

        tracing::info!("📡 NATS Configuration:");
        tracing::info!("   URL: {}", nats_url);
        tracing::info!("   Token: {}", if nats_token.is_some() { "***provided***" } else { "not set" });

        Self {
            nats_url,
            nats_token,
            connection_name: "Orchestra Service Lifecycle".to_string(),
        }
    }

    /// Create configuration with explicit NATS URL
    pub fn with_nats_url(nats_url: impl Into<String>) -> Self {
        Self {
            nats_url: nats_url.into(),
            nats_token: None,
            connection_name: "Orchestra Service Lifecycle".to_string(),
        }
    }

    /// Get NATS connection using the configuration
    pub async fn get_nats_connection(&self) -> Result<async_nats::Client> {
        tracing::info!("🔌 Connecting to NATS at: {}", self.nats_url);

        let mut opts = async_nats::ConnectOptions::default()
            .name(self.connection_name.as_str())
            .max_reconnects(Some(60))
            .reconnect_delay_callback(|attempts| {
                Duration::from_millis(std::cmp::min((attempts as u64) * 100, 5000))
            });
        if let Some(token) = &self.nats_token {
            opts = opts.token(token.clone());
        }

        let client = opts
            .connect(&self.nats_url)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to connect to NATS at {}: {}", self.nats_url, e))?;

        tracing::info!("✅ Successfully connected to NATS!");
        Ok(client)
    }
}

// ============ MESSAGING ============

/// Settings of a node's correlated messaging layer
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct CorrelatorConfig {
    /// Identity stamped on every envelope this node publishes
    pub app_id: String,
    /// First segment of the private response topic
    pub response_prefix: String,
    pub default_timeout: Duration,
    /// How often expired calls are looked for
    pub sweep_interval: Duration,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self::new(DEFAULT_APP_ID)
    }
}

impl CorrelatorConfig {
    pub fn new(app_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            response_prefix: DEFAULT_RESPONSE_PREFIX.to_string(),
            default_timeout: DEFAULT_CALL_TIMEOUT,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn from_env() -> Self {
        let config = Self {
            app_id: std::env::var("ORCHESTRA_APP_ID").unwrap_or_else(|_| DEFAULT_APP_ID.to_string()),
            response_prefix: std::env::var("ORCHESTRA_RESPONSE_PREFIX")
                .unwrap_or_else(|_| DEFAULT_RESPONSE_PREFIX.to_string()),
            default_timeout: env_millis("ORCHESTRA_CALL_TIMEOUT_MS", DEFAULT_CALL_TIMEOUT),
            sweep_interval: env_millis("ORCHESTRA_SWEEP_INTERVAL_MS", DEFAULT_SWEEP_INTERVAL),
        };

        tracing::info!(
            app_id = %config.app_id,
            response_prefix = %config.response_prefix,
            call_timeout_ms = config.default_timeout.as_millis() as u64,
            sweep_interval_ms = config.sweep_interval.as_millis() as u64,
            "Messaging configuration"
        );
        config
    }
}

// ============ ORCHESTRATOR ============

/// Topics the orchestrator talks on
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct Topics {
    pub service_create: String,
    pub compute_list: String,
    pub service_deploy: String,
    pub monitoring: String,
}

impl Default for Topics {
    fn default() -> Self {
        Self {
            service_create: topics::SERVICE_CREATE.to_string(),
            compute_list: topics::COMPUTE_LIST.to_string(),
            service_deploy: topics::SERVICE_DEPLOY.to_string(),
            monitoring: topics::MONITORING_CONFIGURE.to_string(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct OrchestratorConfig {
    pub topics: Topics,
    /// Deadline for each call to the infrastructure adaptor
    pub call_timeout: Duration,
    /// Encoding of outbound calls and monitoring messages
    pub wire_format: ContentType,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            topics: Topics::default(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            wire_format: ContentType::Json,
        }
    }
}

impl OrchestratorConfig {
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_wire_format(mut self, wire_format: ContentType) -> Self {
        self.wire_format = wire_format;
        self
    }

    pub fn from_env() -> Self {
        let mut config = Self {
            call_timeout: env_millis("ORCHESTRA_CALL_TIMEOUT_MS", DEFAULT_CALL_TIMEOUT),
            ..Self::default()
        };

        if let Ok(raw) = std::env::var("ORCHESTRA_WIRE_FORMAT") {
            match raw.parse() {
                Ok(format) => config.wire_format = format,
                Err(e) => tracing::warn!(env.var = "ORCHESTRA_WIRE_FORMAT", error = %e, "Ignoring invalid value"),
            }
        }
        if let Ok(topic) = std::env::var("ORCHESTRA_MONITORING_TOPIC") {
            config.topics.monitoring = topic;
        }

        tracing::info!(
            wire_format = %config.wire_format,
            monitoring_topic = %config.topics.monitoring,
            "Orchestrator configuration"
        );
        config
    }
}

/// Everything a lifecycle manager node needs to start
#[derive(Clone, Serialize, Deserialize, Debug, Default)]
pub struct OrchestraConfig {
    pub base: BaseConfiguration,
    pub correlator: CorrelatorConfig,
    pub orchestrator: OrchestratorConfig,
}

impl OrchestraConfig {
    pub fn from_env() -> Self {
        Self {
            base: BaseConfiguration::from_env(),
            correlator: CorrelatorConfig::from_env(),
            orchestrator: OrchestratorConfig::from_env(),
        }
    }
}

fn env_millis(name: &str, default: Duration) -> Duration {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().parse::<u64>() {
            Ok(ms) if ms > 0 => Duration::from_millis(ms),
            _ => {
                tracing::warn!(env.var = %name, value = %raw, "Ignoring invalid duration, using default");
                default
            }
        },
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_point_at_platform_topics() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.topics.service_create, "service.instances.create");
        assert_eq!(config.topics.compute_list, "infrastructure.management.compute.list");
        assert_eq!(config.topics.service_deploy, "infrastructure.service.deploy");
        assert_eq!(config.wire_format, ContentType::Json);
    }

    #[test]
    fn invalid_durations_fall_back() {
        std::env::set_var("ORCHESTRA_TEST_DURATION_BAD", "soon");
        std::env::set_var("ORCHESTRA_TEST_DURATION_OK", "1500");
        assert_eq!(env_millis("ORCHESTRA_TEST_DURATION_BAD", DEFAULT_CALL_TIMEOUT), DEFAULT_CALL_TIMEOUT);
        assert_eq!(
            env_millis("ORCHESTRA_TEST_DURATION_OK", DEFAULT_CALL_TIMEOUT),
            Duration::from_millis(1500)
        );
        assert_eq!(env_millis("ORCHESTRA_TEST_DURATION_UNSET", DEFAULT_SWEEP_INTERVAL), DEFAULT_SWEEP_INTERVAL);
    }

    #[test]
    fn correlator_builder() {
        let config = CorrelatorConfig::new("node-a")
            .with_timeout(Duration::from_millis(100))
            .with_sweep_interval(Duration::from_millis(10));
        assert_eq!(config.app_id, "node-a");
        assert_eq!(config.response_prefix, "responses");
        assert_eq!(config.default_timeout, Duration::from_millis(100));
    }
}
