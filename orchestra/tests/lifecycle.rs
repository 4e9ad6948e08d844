// orchestra/tests/lifecycle.rs - Service instantiation across gatekeeper, lifecycle manager and adaptor

use orchestra::bus::handler;
use orchestra::{
    topics, Bus, CallError, Collaborators, Correlator, CorrelatorConfig, DeployRequest, Envelope, InMemoryBus,
    Orchestrator, OrchestratorConfig, OrchestratorHandle, Payload, PluginState, Request, ServiceStatus, StatusReport,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::time::timeout;
use tokio_test::{assert_err, assert_ok};

const SLM: &str = "slm";
const WAIT: Duration = Duration::from_secs(2);

struct Platform {
    bus: Arc<InMemoryBus>,
    gatekeeper: Arc<Correlator>,
    adaptor: Arc<Correlator>,
    slm: OrchestratorHandle,
}

async fn node(bus: &Arc<InMemoryBus>, app_id: &str) -> Arc<Correlator> {
    let config = CorrelatorConfig::new(app_id)
        .with_timeout(WAIT)
        .with_sweep_interval(Duration::from_millis(10));
    Correlator::start(bus.clone(), config).await.unwrap()
}

async fn platform_with_timeout(call_timeout: Duration) -> Platform {
    let bus = Arc::new(InMemoryBus::new());
    let slm_node = node(&bus, SLM).await;
    let slm = Orchestrator::start(
        slm_node,
        OrchestratorConfig::default().with_call_timeout(call_timeout),
        Collaborators::default(),
    )
    .await
    .unwrap();

    Platform {
        gatekeeper: node(&bus, "gatekeeper").await,
        adaptor: node(&bus, "adaptor").await,
        bus,
        slm,
    }
}

async fn platform() -> Platform {
    platform_with_timeout(WAIT).await
}

/// Collect every envelope published on `topic`
async fn tap(bus: &Arc<InMemoryBus>, topic: &str) -> UnboundedReceiver<Envelope> {
    let (tx, rx) = mpsc::unbounded_channel();
    bus.subscribe(
        topic,
        handler(move |envelope| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(envelope);
            }
        }),
    )
    .await
    .unwrap();
    rx
}

async fn next<T>(rx: &mut UnboundedReceiver<T>) -> T {
    timeout(WAIT, rx.recv()).await.expect("nothing arrived in time").expect("channel closed")
}

fn descriptors() -> Value {
    json!({
        "service_descriptor": {"name": "sonata-demo", "uuid": "svc-1"},
        "component_descriptor_1": {"name": "firewall"},
        "component_descriptor_2": {"name": "iperf"},
        "component_descriptor_3": {"name": "tcpdump"},
    })
}

/// Send a create request the way the gatekeeper does; the receiver yields the direct reply
async fn create(
    gatekeeper: &Correlator,
    body: Value,
    correlation_id: &str,
) -> UnboundedReceiver<Result<Envelope, CallError>> {
    let (tx, rx) = mpsc::unbounded_channel();
    gatekeeper
        .call_async(
            Request::new(topics::SERVICE_CREATE, Payload::yaml(&body).unwrap()).with_correlation_id(correlation_id),
            move |outcome| {
                let _ = tx.send(outcome);
            },
        )
        .await
        .unwrap();
    rx
}

/// Next status the lifecycle manager published on the create topic
async fn next_status(notifications: &mut UnboundedReceiver<Envelope>) -> (String, StatusReport) {
    loop {
        let envelope = next(notifications).await;
        if envelope.app_id == SLM {
            return (envelope.correlation_id.clone(), envelope.decode().unwrap());
        }
    }
}

async fn serve_resources(adaptor: &Correlator, resources: Value) {
    adaptor
        .register_async_endpoint(topics::COMPUTE_LIST, move |_request: Envelope| {
            let resources = resources.clone();
            async move { Some(Payload::yaml(&resources).unwrap()) }
        })
        .await
        .unwrap();
}

async fn serve_deployments(adaptor: &Correlator, result: Value) {
    adaptor
        .register_async_endpoint(topics::SERVICE_DEPLOY, move |_request: Envelope| {
            let result = result.clone();
            async move { Some(Payload::yaml(&result).unwrap()) }
        })
        .await
        .unwrap();
}

async fn wait_for_state(handle: &OrchestratorHandle, expected: PluginState) {
    let mut state = handle.watch_state();
    timeout(WAIT, state.wait_for(|current| *current == expected))
        .await
        .expect("state never reached")
        .unwrap();
}

#[tokio::test]
async fn well_formed_request_is_acknowledged_and_resources_listed() {
    let p = platform().await;
    let mut listings = tap(&p.bus, topics::COMPUTE_LIST).await;

    let mut reply = create(&p.gatekeeper, descriptors(), "gk-1").await;

    let acknowledgement = next(&mut reply).await.unwrap();
    assert_eq!(acknowledgement.correlation_id, "gk-1");
    assert_eq!(acknowledgement.app_id, SLM);
    let wire: Value = acknowledgement.decode().unwrap();
    assert_eq!(wire["status"], "INSTANTIATING");
    assert!(wire["error"].is_null());
    assert!(wire["timestamp"].is_f64());

    let listing = next(&mut listings).await;
    assert_eq!(listing.payload.document().unwrap(), json!({}));
    assert_ne!(listing.correlation_id, "gk-1");
    assert_eq!(listing.app_id, SLM);
    assert!(listing.reply_to.is_some());
}

#[tokio::test]
async fn request_without_service_descriptor_is_rejected() {
    let p = platform().await;
    let mut listings = tap(&p.bus, topics::COMPUTE_LIST).await;

    let mut reply = create(&p.gatekeeper, json!({"component_descriptor_1": {"name": "firewall"}}), "gk-bad").await;

    let rejection = next(&mut reply).await.unwrap();
    assert_eq!(rejection.correlation_id, "gk-bad");
    let wire: Value = rejection.decode().unwrap();
    assert_eq!(wire["status"], "ERROR");
    assert!(!wire["error"].as_str().unwrap().is_empty());
    assert!(wire["timestamp"].is_f64());

    assert_err!(timeout(Duration::from_millis(200), listings.recv()).await);
    wait_for_state(&p.slm, PluginState::Ready).await;
}

#[tokio::test]
async fn deployment_request_uses_listed_resource_and_one_instance_uuid() {
    let p = platform().await;
    serve_resources(
        &p.adaptor,
        json!([{"resource_id": "vim-a", "core_total": 8}, {"resource_id": "vim-b"}]),
    )
    .await;
    let mut listings = tap(&p.bus, topics::COMPUTE_LIST).await;
    let mut deployments = tap(&p.bus, topics::SERVICE_DEPLOY).await;

    let _reply = create(&p.gatekeeper, descriptors(), "gk-2").await;

    let listing = next(&mut listings).await;
    let deployment = next(&mut deployments).await;
    assert_ne!(deployment.correlation_id, "gk-2");
    assert_ne!(deployment.correlation_id, listing.correlation_id);
    let request: DeployRequest = deployment.decode().unwrap();
    assert!(["vim-a", "vim-b"].contains(&request.resource_id.as_str()));

    let uuid = request.service_descriptor["instance_uuid"].as_str().unwrap().to_string();
    assert!(!uuid.is_empty());
    assert_eq!(request.component_descriptors.len(), 3);
    for descriptor in &request.component_descriptors {
        assert_eq!(descriptor["instance_uuid"].as_str(), Some(uuid.as_str()));
    }
}

#[tokio::test]
async fn empty_resource_list_reports_no_vim() {
    let p = platform().await;
    serve_resources(&p.adaptor, json!([])).await;
    let mut notifications = tap(&p.bus, topics::SERVICE_CREATE).await;

    let _reply = create(&p.gatekeeper, descriptors(), "gk-3").await;

    let (correlation_id, report) = next_status(&mut notifications).await;
    assert_eq!(correlation_id, "gk-3");
    assert_eq!(report.status, ServiceStatus::Error);
    assert_eq!(report.error.as_deref(), Some("No VIM."));
    wait_for_state(&p.slm, PluginState::Ready).await;
}

#[tokio::test]
async fn failed_deployment_is_reported_to_requester() {
    let p = platform().await;
    serve_resources(&p.adaptor, json!([{"resource_id": "vim-a"}])).await;
    serve_deployments(&p.adaptor, json!({"request_status": "failed"})).await;
    let mut notifications = tap(&p.bus, topics::SERVICE_CREATE).await;

    let _reply = create(&p.gatekeeper, descriptors(), "gk-4").await;

    let (correlation_id, report) = next_status(&mut notifications).await;
    assert_eq!(correlation_id, "gk-4");
    assert_eq!(report.status, ServiceStatus::Error);
    assert_eq!(report.error.as_deref(), Some("Deployment result: failed"));
}

#[tokio::test]
async fn successful_deployment_reports_ready_and_configures_monitoring() {
    let p = platform().await;
    serve_resources(&p.adaptor, json!([{"resource_id": "vim-a"}])).await;
    serve_deployments(&p.adaptor, json!({"request_status": "normal operation"})).await;
    let mut notifications = tap(&p.bus, topics::SERVICE_CREATE).await;
    let mut monitoring = tap(&p.bus, topics::MONITORING_CONFIGURE).await;

    let _reply = create(&p.gatekeeper, descriptors(), "gk-5").await;

    let (correlation_id, report) = next_status(&mut notifications).await;
    assert_eq!(correlation_id, "gk-5");
    assert_eq!(report.status, ServiceStatus::Ready);
    assert_eq!(report.error, None);

    let configuration = next(&mut monitoring).await.payload.document().unwrap();
    assert_eq!(configuration["resource_id"], "vim-a");
    assert_eq!(configuration["components"].as_array().unwrap().len(), 3);

    wait_for_state(&p.slm, PluginState::Ready).await;
    let heartbeat = p.slm.heartbeat("plugin-1");
    assert_eq!(heartbeat.uuid, "plugin-1");
    assert_eq!(heartbeat.state, PluginState::Ready);
}

#[tokio::test]
async fn concurrent_workflows_do_not_cross_talk() {
    let p = platform().await;
    let mut listings = tap(&p.bus, topics::COMPUTE_LIST).await;
    let mut deployments = tap(&p.bus, topics::SERVICE_DEPLOY).await;
    let mut notifications = tap(&p.bus, topics::SERVICE_CREATE).await;

    let _first = create(&p.gatekeeper, descriptors(), "gk-first").await;
    let _second = create(&p.gatekeeper, descriptors(), "gk-second").await;

    // Create requests are served in arrival order, so the first listing belongs to gk-first
    let first_listing = next(&mut listings).await;
    let second_listing = next(&mut listings).await;

    // Answer in reverse order with distinct resources
    for (listing, resource) in [(&second_listing, "vim-second"), (&first_listing, "vim-first")] {
        p.adaptor
            .notify(
                listing.reply_to.as_deref().unwrap(),
                Payload::yaml(&json!([{"resource_id": resource}])).unwrap(),
                &listing.correlation_id,
            )
            .await
            .unwrap();
    }

    let mut pending = vec![next(&mut deployments).await, next(&mut deployments).await];
    pending.reverse();
    for deployment in &pending {
        let request: DeployRequest = deployment.decode().unwrap();
        let status = if request.resource_id == "vim-first" { "failed" } else { "normal operation" };
        p.adaptor
            .notify(
                deployment.reply_to.as_deref().unwrap(),
                Payload::yaml(&json!({"request_status": status})).unwrap(),
                &deployment.correlation_id,
            )
            .await
            .unwrap();
    }

    let mut outcomes = vec![next_status(&mut notifications).await, next_status(&mut notifications).await];
    outcomes.sort_by(|a, b| a.0.cmp(&b.0));

    assert_eq!(outcomes[0].0, "gk-first");
    assert_eq!(outcomes[0].1.status, ServiceStatus::Error);
    assert_eq!(outcomes[0].1.error.as_deref(), Some("Deployment result: failed"));
    assert_eq!(outcomes[1].0, "gk-second");
    assert_eq!(outcomes[1].1.status, ServiceStatus::Ready);
}

#[tokio::test]
async fn unanswered_call_times_out_into_error() {
    let p = platform_with_timeout(Duration::from_millis(100)).await;
    let mut notifications = tap(&p.bus, topics::SERVICE_CREATE).await;

    let _reply = create(&p.gatekeeper, descriptors(), "gk-6").await;
    wait_for_state(&p.slm, PluginState::Running).await;

    let (correlation_id, report) = next_status(&mut notifications).await;
    assert_eq!(correlation_id, "gk-6");
    assert_eq!(report.status, ServiceStatus::Error);
    assert!(report.error.as_deref().unwrap().starts_with("Timeout"));

    wait_for_state(&p.slm, PluginState::Ready).await;
}

#[tokio::test]
async fn duplicate_create_request_is_discarded() {
    let p = platform().await;
    let mut listings = tap(&p.bus, topics::COMPUTE_LIST).await;

    let request = Envelope::new(topics::SERVICE_CREATE, Payload::yaml(&descriptors()).unwrap())
        .with_correlation_id("gk-dup")
        .with_app_id("gatekeeper");
    assert_ok!(p.bus.publish(request.clone()).await);
    assert_ok!(p.bus.publish(request).await);

    next(&mut listings).await;
    assert_err!(timeout(Duration::from_millis(200), listings.recv()).await);
}

#[tokio::test]
async fn shutdown_stops_accepting_requests() {
    let p = platform().await;
    let mut listings = tap(&p.bus, topics::COMPUTE_LIST).await;

    assert_ok!(p.slm.shutdown().await);
    let _reply = create(&p.gatekeeper, descriptors(), "gk-late").await;

    assert_err!(timeout(Duration::from_millis(200), listings.recv()).await);
    assert_eq!(p.bus.subscriber_count(topics::SERVICE_CREATE).await, 0);
}
