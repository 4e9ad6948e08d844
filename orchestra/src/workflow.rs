// orchestra/src/workflow.rs - Service instantiation state machine
//
// A workflow never touches the bus. Each step consumes one input and returns
// the effects the orchestrator must carry out, in order.

use chrono::{DateTime, Utc};
use orchestra_core::{
    new_correlation_id, ContentType, DeployRequest, DeployResult, DeploymentRecords, Envelope, FirstAvailable,
    MonitoringBuilder, Payload, RecordBuilder, ResourceRecord, ResourceSelector, ServiceRequest, StatusReport,
};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

use crate::config::{OrchestratorConfig, Topics};
use crate::error::{CallError, WorkflowError};
use crate::observability::{CorrelationContext, OperationLogger, SpanBuilder};
use crate::records::{AdaptorRecords, ServiceMonitoring};

// ============ STATES ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowState {
    Received,
    SelectingVim,
    Deploying,
    Complete,
    Error,
}

impl WorkflowState {
    fn rank(self) -> u8 {
        match self {
            WorkflowState::Received => 0,
            WorkflowState::SelectingVim => 1,
            WorkflowState::Deploying => 2,
            WorkflowState::Complete | WorkflowState::Error => 3,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, WorkflowState::Complete | WorkflowState::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowState::Received => "RECEIVED",
            WorkflowState::SelectingVim => "SELECTING_VIM",
            WorkflowState::Deploying => "DEPLOYING",
            WorkflowState::Complete => "COMPLETE",
            WorkflowState::Error => "ERROR",
        }
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============ EFFECTS ============

/// Side effect requested by a workflow step
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Direct answer to the create request
    Reply {
        topic: String,
        correlation_id: String,
        content_type: ContentType,
        report: StatusReport,
    },
    /// Status event on the requester's create topic
    Notify {
        topic: String,
        correlation_id: String,
        content_type: ContentType,
        report: StatusReport,
    },
    /// Correlated call whose resolution resumes the workflow
    Call {
        topic: String,
        correlation_id: String,
        payload: Payload,
    },
    /// Fire-and-forget message
    Publish { topic: String, payload: Payload },
}

// ============ COLLABORATORS ============

/// Pluggable policies consulted while a workflow runs
#[derive(Clone)]
pub struct Collaborators {
    pub selector: Arc<dyn ResourceSelector>,
    pub records: Arc<dyn RecordBuilder>,
    pub monitoring: Arc<dyn MonitoringBuilder>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            selector: Arc::new(FirstAvailable),
            records: Arc::new(AdaptorRecords),
            monitoring: Arc::new(ServiceMonitoring),
        }
    }
}

impl Collaborators {
    pub fn with_selector(mut self, selector: impl ResourceSelector + 'static) -> Self {
        self.selector = Arc::new(selector);
        self
    }

    pub fn with_records(mut self, records: impl RecordBuilder + 'static) -> Self {
        self.records = Arc::new(records);
        self
    }

    pub fn with_monitoring(mut self, monitoring: impl MonitoringBuilder + 'static) -> Self {
        self.monitoring = Arc::new(monitoring);
        self
    }
}

// ============ SERVICE INSTANCE ============

/// Observable state of one instantiation
#[derive(Debug, Clone)]
pub struct ServiceInstance {
    pub instance_uuid: Option<String>,
    /// `None` until the request validated
    pub request: Option<ServiceRequest>,
    pub state: WorkflowState,
    pub requester_correlation_id: String,
    pub outbound_correlation_id: Option<String>,
    pub selected_resource_id: Option<String>,
    pub error: Option<String>,
    pub records: Option<DeploymentRecords>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Where status for the requester is sent
#[derive(Debug, Clone)]
struct Requester {
    topic: String,
    reply_to: Option<String>,
    content_type: ContentType,
}

// ============ WORKFLOW ============

pub struct Workflow {
    instance: ServiceInstance,
    requester: Requester,
    topics: Topics,
    wire_format: ContentType,
    ctx: CorrelationContext,
}

impl Workflow {
    /// Start a workflow for a create request and run its RECEIVED step
    pub fn receive(request: &Envelope, config: &OrchestratorConfig) -> (Workflow, Vec<Effect>) {
        let ctx = CorrelationContext::new(
            request.correlation_id.as_str(),
            request.app_id.as_str(),
            request.topic.as_str(),
        );
        OperationLogger::workflow_started(&ctx);

        let mut workflow = Workflow {
            instance: ServiceInstance {
                instance_uuid: None,
                request: None,
                state: WorkflowState::Received,
                requester_correlation_id: request.correlation_id.clone(),
                outbound_correlation_id: None,
                selected_resource_id: None,
                error: None,
                records: None,
                created_at: Utc::now(),
                completed_at: None,
            },
            requester: Requester {
                topic: request.topic.clone(),
                reply_to: request.reply_to.clone(),
                content_type: request.content_type(),
            },
            topics: config.topics.clone(),
            wire_format: config.wire_format,
            ctx,
        };

        let effects = workflow.on_received(request);
        (workflow, effects)
    }

    pub fn instance(&self) -> &ServiceInstance {
        &self.instance
    }

    pub fn state(&self) -> WorkflowState {
        self.instance.state
    }

    pub fn requester_correlation_id(&self) -> &str {
        &self.instance.requester_correlation_id
    }

    /// Correlation id of the call the workflow is waiting on
    pub fn outbound_correlation_id(&self) -> Option<&str> {
        self.instance.outbound_correlation_id.as_deref()
    }

    /// Feed the outcome of the pending call
    pub fn resume(
        &mut self,
        correlation_id: &str,
        outcome: Result<Envelope, CallError>,
        collaborators: &Collaborators,
    ) -> Vec<Effect> {
        if self.state().is_terminal() || self.outbound_correlation_id() != Some(correlation_id) {
            tracing::warn!(
                correlation_id = %self.ctx.correlation_id,
                reply.correlation_id = %correlation_id,
                workflow.state = %self.state(),
                "Ignoring reply the workflow is not waiting for"
            );
            return Vec::new();
        }
        self.instance.outbound_correlation_id = None;

        let _guard = SpanBuilder::workflow_step(&self.ctx, self.state().as_str()).entered();
        let reply = match outcome {
            Ok(reply) => reply,
            Err(call_error) => return self.fail(WorkflowError::Timeout(call_error)),
        };

        match self.state() {
            WorkflowState::SelectingVim => self.on_resources(&reply, collaborators),
            WorkflowState::Deploying => self.on_deployment(&reply, collaborators),
            state => {
                tracing::warn!(workflow.state = %state, "No reply expected in this state");
                Vec::new()
            }
        }
    }

    /// Fail the workflow because one of its own messages could not be sent
    pub fn abort(&mut self, reason: impl Into<String>) -> Vec<Effect> {
        if self.state().is_terminal() {
            return Vec::new();
        }
        self.fail(WorkflowError::Dispatch(reason.into()))
    }

    // ============ STEPS ============

    fn on_received(&mut self, envelope: &Envelope) -> Vec<Effect> {
        let _guard = SpanBuilder::workflow_step(&self.ctx, self.state().as_str()).entered();

        let request = match ServiceRequest::from_payload(&envelope.payload) {
            Ok(request) => request,
            Err(e) => return self.fail(WorkflowError::Validation(e)),
        };
        tracing::debug!(
            correlation_id = %self.ctx.correlation_id,
            components = request.component_descriptors.len(),
            "Service request accepted"
        );
        self.instance.request = Some(request);

        let acknowledgement = Effect::Reply {
            topic: self.reply_topic(),
            correlation_id: self.instance.requester_correlation_id.clone(),
            content_type: self.requester.content_type,
            report: StatusReport::instantiating(),
        };
        let call = self.call(
            self.topics.compute_list.clone(),
            Payload::empty_mapping(self.wire_format),
        );
        self.transition(WorkflowState::SelectingVim);

        vec![acknowledgement, call]
    }

    fn on_resources(&mut self, reply: &Envelope, collaborators: &Collaborators) -> Vec<Effect> {
        let resources: Vec<ResourceRecord> = match reply.decode::<Option<Vec<ResourceRecord>>>() {
            Ok(resources) => resources.unwrap_or_default(),
            Err(e) => return self.fail(WorkflowError::MalformedReply(format!("resource list: {e}"))),
        };
        tracing::debug!(
            correlation_id = %self.ctx.correlation_id,
            resources = resources.len(),
            "Resource availability received"
        );

        let Some(resource) = collaborators.selector.select(&resources) else {
            return self.fail(WorkflowError::NoResource);
        };
        let resource_id = resource.resource_id.clone();

        let Some(mut request) = self.instance.request.take() else {
            return self.fail(WorkflowError::MalformedReply("no validated request to deploy".into()));
        };
        let instance_uuid = uuid::Uuid::new_v4().to_string();
        request.stamp_instance_uuid(&instance_uuid);

        let deploy = DeployRequest {
            resource_id: resource_id.clone(),
            service_descriptor: request.service_descriptor.clone(),
            component_descriptors: request.component_descriptors.clone(),
        };
        self.instance.request = Some(request);
        self.instance.instance_uuid = Some(instance_uuid.clone());
        self.instance.selected_resource_id = Some(resource_id);
        self.ctx = self.ctx.clone().with_instance_uuid(instance_uuid);

        let payload = match Payload::encode(self.wire_format, &deploy) {
            Ok(payload) => payload,
            Err(e) => return self.fail(WorkflowError::MalformedReply(format!("deploy request: {e}"))),
        };
        let call = self.call(self.topics.service_deploy.clone(), payload);
        self.transition(WorkflowState::Deploying);
        vec![call]
    }

    fn on_deployment(&mut self, reply: &Envelope, collaborators: &Collaborators) -> Vec<Effect> {
        let result: DeployResult = match reply.decode() {
            Ok(result) => result,
            Err(e) => return self.fail(WorkflowError::MalformedReply(format!("deployment result: {e}"))),
        };
        if result.is_failure() {
            return self.fail(WorkflowError::Deployment(result.request_status));
        }

        let (Some(request), Some(instance_uuid), Some(resource_id)) = (
            self.instance.request.as_ref(),
            self.instance.instance_uuid.as_deref(),
            self.instance.selected_resource_id.as_deref(),
        ) else {
            return self.fail(WorkflowError::Records("deployment finished without a selected resource".into()));
        };

        let records = match collaborators.records.build(request, instance_uuid, resource_id, &result) {
            Ok(records) => records,
            Err(e) => return self.fail(WorkflowError::Records(e.to_string())),
        };

        let mut effects = Vec::with_capacity(2);
        if let Some(message) = collaborators.monitoring.build(request, &records) {
            match Payload::encode(self.wire_format, &message) {
                Ok(payload) => effects.push(Effect::Publish {
                    topic: self.topics.monitoring.clone(),
                    payload,
                }),
                Err(e) => tracing::warn!(
                    correlation_id = %self.ctx.correlation_id,
                    error = %e,
                    "Monitoring configuration could not be encoded, skipped"
                ),
            }
        }
        self.instance.records = Some(records);

        effects.push(self.notify(StatusReport::ready()));
        self.transition(WorkflowState::Complete);
        OperationLogger::workflow_completed(&self.ctx);
        effects
    }

    // ============ HELPERS ============

    fn fail(&mut self, error: WorkflowError) -> Vec<Effect> {
        let message = error.to_string();
        let report = StatusReport::error(message.as_str());
        let effect = if self.state() == WorkflowState::Received {
            Effect::Reply {
                topic: self.reply_topic(),
                correlation_id: self.instance.requester_correlation_id.clone(),
                content_type: self.requester.content_type,
                report,
            }
        } else {
            self.notify(report)
        };

        self.instance.error = Some(message.clone());
        self.instance.outbound_correlation_id = None;
        self.transition(WorkflowState::Error);
        OperationLogger::workflow_failed(&self.ctx, &message);
        vec![effect]
    }

    /// Issue a call under a fresh correlation id
    fn call(&mut self, topic: String, payload: Payload) -> Effect {
        let correlation_id = new_correlation_id();
        OperationLogger::bus_interaction(&self.ctx, "call", &topic, &correlation_id);
        self.instance.outbound_correlation_id = Some(correlation_id.clone());
        Effect::Call {
            topic,
            correlation_id,
            payload,
        }
    }

    fn notify(&self, report: StatusReport) -> Effect {
        Effect::Notify {
            topic: self.requester.topic.clone(),
            correlation_id: self.instance.requester_correlation_id.clone(),
            content_type: self.requester.content_type,
            report,
        }
    }

    fn reply_topic(&self) -> String {
        self.requester
            .reply_to
            .clone()
            .unwrap_or_else(|| self.requester.topic.clone())
    }

    fn transition(&mut self, next: WorkflowState) {
        let current = self.instance.state;
        if current.is_terminal() || next.rank() <= current.rank() {
            tracing::error!(
                correlation_id = %self.ctx.correlation_id,
                workflow.state.from = %current,
                workflow.state.to = %next,
                "Refusing backward transition"
            );
            return;
        }
        OperationLogger::state_transition(&self.ctx, current.as_str(), next.as_str());
        self.instance.state = next;
        if next.is_terminal() {
            self.instance.completed_at = Some(Utc::now());
        }
    }
}
