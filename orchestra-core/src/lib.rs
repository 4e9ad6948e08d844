// Core types and traits for the Orchestra service orchestration framework

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// ============ TOPICS ============

/// Well-known topics of the orchestration platform
pub mod topics {
    /// Inbound service creation requests, outbound status notifications
    pub const SERVICE_CREATE: &str = "service.instances.create";
    /// Resource availability listing served by the infrastructure adaptor
    pub const COMPUTE_LIST: &str = "infrastructure.management.compute.list";
    /// Service deployment served by the infrastructure adaptor
    pub const SERVICE_DEPLOY: &str = "infrastructure.service.deploy";
    /// Plugin registration with the plugin manager
    pub const PLUGIN_REGISTER: &str = "platform.management.plugin.register";
    /// Default destination for monitoring configuration messages
    pub const MONITORING_CONFIGURE: &str = "platform.monitoring.service.configure";

    /// Heartbeat topic of a registered plugin
    pub fn heartbeat(plugin_uuid: &str) -> String {
        format!("platform.management.plugin.{plugin_uuid}.heartbeat")
    }
}

// ============ ERRORS ============

/// Failures while encoding or decoding a payload
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unsupported content type: {0}")]
    UnsupportedContentType(String),
    #[error("json codec failure: {0}")]
    Json(#[from] serde_json::Error),
    #[error("yaml codec failure: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Reasons a service creation request is rejected before any work starts
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Request could not be decoded: {0}")]
    Undecodable(String),
    #[error("Request is not a mapping of descriptors.")]
    NotAMapping,
    #[error("No service descriptor in request.")]
    MissingServiceDescriptor,
    #[error("Service descriptor is not a mapping.")]
    InvalidServiceDescriptor,
    #[error("Component descriptor '{0}' is not a mapping.")]
    InvalidComponentDescriptor(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistrationError {
    #[error("registration field '{0}' must not be empty")]
    EmptyField(&'static str),
}

// ============ CONTENT TYPES ============

/// Wire encoding of a payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ContentType {
    #[default]
    #[serde(rename = "application/json")]
    Json,
    #[serde(rename = "application/yaml")]
    Yaml,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Json => "application/json",
            ContentType::Yaml => "application/yaml",
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentType {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let essence = s.split(';').next().unwrap_or_default().trim().to_ascii_lowercase();
        match essence.as_str() {
            "application/json" | "json" => Ok(ContentType::Json),
            "application/yaml" | "application/x-yaml" | "text/yaml" | "yaml" => Ok(ContentType::Yaml),
            _ => Err(CodecError::UnsupportedContentType(s.to_string())),
        }
    }
}

// ============ PAYLOAD ============

/// Raw message body together with its wire encoding
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Payload {
    pub content_type: ContentType,
    pub body: Vec<u8>,
}

impl Payload {
    pub fn new(content_type: ContentType, body: impl Into<Vec<u8>>) -> Self {
        Self {
            content_type,
            body: body.into(),
        }
    }

    /// Serialize `value` using the given encoding
    pub fn encode<T: Serialize + ?Sized>(content_type: ContentType, value: &T) -> Result<Self, CodecError> {
        let body = match content_type {
            ContentType::Json => serde_json::to_vec(value)?,
            ContentType::Yaml => serde_yaml::to_string(value)?.into_bytes(),
        };
        Ok(Self::new(content_type, body))
    }

    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self, CodecError> {
        Self::encode(ContentType::Json, value)
    }

    pub fn yaml<T: Serialize + ?Sized>(value: &T) -> Result<Self, CodecError> {
        Self::encode(ContentType::Yaml, value)
    }

    /// An empty mapping (`{}`) in the given encoding
    pub fn empty_mapping(content_type: ContentType) -> Self {
        let body: &[u8] = match content_type {
            ContentType::Json => b"{}",
            ContentType::Yaml => b"{}\n",
        };
        Self::new(content_type, body)
    }

    /// Deserialize the body. An empty body decodes as `null`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        if self.body.iter().all(u8::is_ascii_whitespace) {
            return Ok(T::deserialize(Value::Null)?);
        }
        match self.content_type {
            ContentType::Json => Ok(serde_json::from_slice(&self.body)?),
            ContentType::Yaml => Ok(serde_yaml::from_slice(&self.body)?),
        }
    }

    /// Decode into a generic document
    pub fn document(&self) -> Result<Value, CodecError> {
        self.decode()
    }

    pub fn len(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }
}

// ============ ENVELOPE ============

/// Generate a fresh correlation id
pub fn new_correlation_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// A payload plus the delivery properties that travel with it on the bus
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub topic: String,
    pub payload: Payload,
    pub correlation_id: String,
    pub reply_to: Option<String>,
    pub app_id: String,
    pub headers: HashMap<String, String>,
}

impl Envelope {
    /// Create an envelope with a fresh correlation id
    pub fn new(topic: impl Into<String>, payload: Payload) -> Self {
        Self {
            topic: topic.into(),
            payload,
            correlation_id: new_correlation_id(),
            reply_to: None,
            app_id: String::new(),
            headers: HashMap::new(),
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_app_id(mut self, app_id: impl Into<String>) -> Self {
        self.app_id = app_id.into();
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn content_type(&self) -> ContentType {
        self.payload.content_type
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        self.payload.decode()
    }

    /// True when the envelope was published by the component named `app_id`
    pub fn is_from(&self, app_id: &str) -> bool {
        self.app_id == app_id
    }
}

// ============ STATUS MESSAGES ============

/// Lifecycle status reported to the requester of a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceStatus {
    Instantiating,
    Ready,
    Error,
}

/// Seconds since the Unix epoch, microsecond precision
pub fn timestamp_now() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// `{status, error, timestamp}` message sent back to a requester.
/// `error` is always present on the wire and `null` unless the status is `ERROR`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub status: ServiceStatus,
    pub error: Option<String>,
    pub timestamp: f64,
}

impl StatusReport {
    pub fn instantiating() -> Self {
        Self {
            status: ServiceStatus::Instantiating,
            error: None,
            timestamp: timestamp_now(),
        }
    }

    pub fn ready() -> Self {
        Self {
            status: ServiceStatus::Ready,
            error: None,
            timestamp: timestamp_now(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ServiceStatus::Error,
            error: Some(message.into()),
            timestamp: timestamp_now(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.status == ServiceStatus::Error
    }
}

// ============ PLUGIN LIFECYCLE ============

/// Operational state advertised in plugin heartbeats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PluginState {
    #[default]
    Ready,
    Running,
    Paused,
    Failed,
}

impl PluginState {
    pub const ALL: [PluginState; 4] = [
        PluginState::Ready,
        PluginState::Running,
        PluginState::Paused,
        PluginState::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PluginState::Ready => "READY",
            PluginState::Running => "RUNNING",
            PluginState::Paused => "PAUSED",
            PluginState::Failed => "FAILED",
        }
    }
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub uuid: String,
    pub state: PluginState,
}

impl Heartbeat {
    pub fn new(uuid: impl Into<String>, state: PluginState) -> Self {
        Self { uuid: uuid.into(), state }
    }

    pub fn topic(&self) -> String {
        topics::heartbeat(&self.uuid)
    }
}

/// Announcement sent to the plugin manager on startup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub name: String,
    pub version: String,
    pub description: String,
}

impl Registration {
    pub fn new(name: impl Into<String>, version: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: description.into(),
        }
    }

    /// Where the announcement is sent
    pub fn topic(&self) -> &'static str {
        topics::PLUGIN_REGISTER
    }

    pub fn validate(&self) -> Result<(), RegistrationError> {
        for (field, value) in [
            ("name", &self.name),
            ("version", &self.version),
            ("description", &self.description),
        ] {
            if value.trim().is_empty() {
                return Err(RegistrationError::EmptyField(field));
            }
        }
        Ok(())
    }
}

// ============ SERVICE REQUEST ============

pub const SERVICE_DESCRIPTOR_KEY: &str = "service_descriptor";
pub const COMPONENT_DESCRIPTOR_PREFIX: &str = "component_descriptor_";
pub const INSTANCE_UUID_KEY: &str = "instance_uuid";

/// A validated service creation request
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceRequest {
    pub service_descriptor: Map<String, Value>,
    /// Ordered by the numeric suffix of their `component_descriptor_<n>` key
    pub component_descriptors: Vec<Map<String, Value>>,
}

impl ServiceRequest {
    pub fn from_payload(payload: &Payload) -> Result<Self, ValidationError> {
        let document = payload
            .document()
            .map_err(|e| ValidationError::Undecodable(e.to_string()))?;
        Self::from_document(&document)
    }

    pub fn from_document(document: &Value) -> Result<Self, ValidationError> {
        let fields = document.as_object().ok_or(ValidationError::NotAMapping)?;

        let service_descriptor = match fields.get(SERVICE_DESCRIPTOR_KEY) {
            None | Some(Value::Null) => return Err(ValidationError::MissingServiceDescriptor),
            Some(Value::Object(descriptor)) => descriptor.clone(),
            Some(_) => return Err(ValidationError::InvalidServiceDescriptor),
        };

        let mut components: Vec<(u64, &String, &Value)> = fields
            .iter()
            .filter_map(|(key, value)| {
                let suffix = key.strip_prefix(COMPONENT_DESCRIPTOR_PREFIX)?;
                Some((suffix.parse::<u64>().unwrap_or(u64::MAX), key, value))
            })
            .collect();
        components.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(b.1)));

        let component_descriptors = components
            .into_iter()
            .map(|(_, key, value)| match value {
                Value::Object(descriptor) => Ok(descriptor.clone()),
                _ => Err(ValidationError::InvalidComponentDescriptor(key.clone())),
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            service_descriptor,
            component_descriptors,
        })
    }

    /// Tag the service descriptor and every component descriptor with the instance uuid
    pub fn stamp_instance_uuid(&mut self, instance_uuid: &str) {
        let stamp = Value::String(instance_uuid.to_string());
        self.service_descriptor.insert(INSTANCE_UUID_KEY.to_string(), stamp.clone());
        for descriptor in &mut self.component_descriptors {
            descriptor.insert(INSTANCE_UUID_KEY.to_string(), stamp.clone());
        }
    }
}

/// Reference of a descriptor for records: its `uuid`, falling back to its `name`
pub fn descriptor_reference(descriptor: &Map<String, Value>) -> Value {
    descriptor
        .get("uuid")
        .or_else(|| descriptor.get("name"))
        .cloned()
        .unwrap_or(Value::Null)
}

// ============ INFRASTRUCTURE MESSAGES ============

/// One entry of the resource availability list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub resource_id: String,
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl ResourceRecord {
    pub fn new(resource_id: impl Into<String>) -> Self {
        Self {
            resource_id: resource_id.into(),
            attributes: Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployRequest {
    pub resource_id: String,
    pub service_descriptor: Map<String, Value>,
    pub component_descriptors: Vec<Map<String, Value>>,
}

/// Deployment outcome reported by the infrastructure adaptor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployResult {
    pub request_status: String,
    #[serde(flatten)]
    pub details: Map<String, Value>,
}

impl DeployResult {
    pub const FAILED: &'static str = "failed";

    pub fn is_failure(&self) -> bool {
        self.request_status == Self::FAILED
    }
}

/// Records describing a deployed service and its components
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DeploymentRecords {
    pub service_record: Value,
    pub component_records: Vec<Value>,
}

// ============ COLLABORATOR TRAITS ============

/// Policy picking one resource out of the availability list
pub trait ResourceSelector: Send + Sync {
    fn select<'a>(&self, resources: &'a [ResourceRecord]) -> Option<&'a ResourceRecord>;
}

/// Picks the first listed resource
#[derive(Debug, Clone, Copy, Default)]
pub struct FirstAvailable;

impl ResourceSelector for FirstAvailable {
    fn select<'a>(&self, resources: &'a [ResourceRecord]) -> Option<&'a ResourceRecord> {
        resources.first()
    }
}

/// Builds service and component records once a deployment succeeded
pub trait RecordBuilder: Send + Sync {
    fn build(
        &self,
        request: &ServiceRequest,
        instance_uuid: &str,
        resource_id: &str,
        deployment: &DeployResult,
    ) -> anyhow::Result<DeploymentRecords>;
}

/// Builds the monitoring configuration for a deployed service.
/// `None` means nothing needs to be monitored.
pub trait MonitoringBuilder: Send + Sync {
    fn build(&self, request: &ServiceRequest, records: &DeploymentRecords) -> Option<Value>;
}
