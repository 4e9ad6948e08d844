// orchestra/src/orchestrator.rs - Entry point spawning and routing instantiation workflows

use orchestra_core::{new_correlation_id, Envelope, Heartbeat, Payload, PluginState};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::bus::SubscriptionId;
use crate::config::OrchestratorConfig;
use crate::correlator::{Correlator, Request};
use crate::error::{CallError, CorrelatorError, OrchestratorError};
use crate::workflow::{Collaborators, Effect, Workflow};

// ============ ROUTES ============

/// Inbound message kinds the orchestrator serves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    CreateService,
}

/// Topic to route table, built once at startup
fn route_table(config: &OrchestratorConfig) -> Vec<(String, Route)> {
    vec![(config.topics.service_create.clone(), Route::CreateService)]
}

/// Work items of the event loop
enum Inbound {
    Routed(Route, Envelope),
    Resolved {
        correlation_id: String,
        outcome: Result<Envelope, CallError>,
    },
}

// ============ HANDLE ============

/// Control surface of a running orchestrator
pub struct OrchestratorHandle {
    state: watch::Receiver<PluginState>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<(), OrchestratorError>>,
    routes: Vec<(String, SubscriptionId)>,
    correlator: Arc<Correlator>,
}

impl OrchestratorHandle {
    /// Aggregate health: READY when idle, RUNNING while workflows are active
    pub fn state(&self) -> PluginState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<PluginState> {
        self.state.clone()
    }

    /// Heartbeat payload for the plugin manager
    pub fn heartbeat(&self, plugin_uuid: &str) -> Heartbeat {
        Heartbeat::new(plugin_uuid, self.state())
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the event loop to end on its own
    pub async fn join(mut self) -> Result<(), OrchestratorError> {
        let outcome = (&mut self.task).await;
        self.release_routes().await;
        outcome.map_err(|_| OrchestratorError::Stopped)?
    }

    /// Stop the event loop and remove its subscriptions
    pub async fn shutdown(mut self) -> Result<(), OrchestratorError> {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        let outcome = (&mut self.task).await;
        self.release_routes().await;
        tracing::info!("🛑 Orchestrator stopped");
        outcome.map_err(|_| OrchestratorError::Stopped)?
    }

    async fn release_routes(&mut self) {
        for (topic, id) in self.routes.drain(..) {
            if let Err(e) = self.correlator.unsubscribe(&topic, id).await {
                tracing::warn!(bus.topic = %topic, error = %e, "Failed to remove route subscription");
            }
        }
    }
}

// ============ ORCHESTRATOR ============

/// Owns every active workflow and routes call resolutions back to them.
///
/// All state lives in one event loop task; subscription handlers and call
/// callbacks only post [`Inbound`] items into its channel.
pub struct Orchestrator {
    correlator: Arc<Correlator>,
    config: OrchestratorConfig,
    collaborators: Collaborators,
    /// Active workflows keyed by the requester's correlation id
    workflows: HashMap<String, Workflow>,
    /// Outbound call correlation id to requester correlation id
    directory: HashMap<String, String>,
    inbound: mpsc::UnboundedSender<Inbound>,
    state: watch::Sender<PluginState>,
}

impl Orchestrator {
    /// Register the routes and spawn the event loop
    pub async fn start(
        correlator: Arc<Correlator>,
        config: OrchestratorConfig,
        collaborators: Collaborators,
    ) -> Result<OrchestratorHandle, OrchestratorError> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(PluginState::Ready);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let mut routes = Vec::new();
        for (topic, route) in route_table(&config) {
            let tx = inbound_tx.clone();
            let own_app_id = correlator.app_id().to_string();
            let id = correlator
                .register_notification_endpoint(&topic, move |envelope: Envelope| {
                    let tx = tx.clone();
                    let own = envelope.is_from(&own_app_id);
                    async move {
                        // Our own status notifications travel on the same topic
                        if own {
                            return;
                        }
                        let _ = tx.send(Inbound::Routed(route, envelope));
                    }
                })
                .await?;
            tracing::info!(bus.topic = %topic, route = ?route, "Route registered");
            routes.push((topic, id));
        }

        let orchestrator = Orchestrator {
            correlator: correlator.clone(),
            config,
            collaborators,
            workflows: HashMap::new(),
            directory: HashMap::new(),
            inbound: inbound_tx,
            state: state_tx,
        };
        let task = tokio::spawn(orchestrator.run(inbound_rx, shutdown_rx));

        tracing::info!(app_id = %correlator.app_id(), "🚀 Orchestrator started");
        Ok(OrchestratorHandle {
            state: state_rx,
            shutdown: Some(shutdown_tx),
            task,
            routes,
            correlator,
        })
    }

    async fn run(
        mut self,
        mut inbound: mpsc::UnboundedReceiver<Inbound>,
        mut shutdown: oneshot::Receiver<()>,
    ) -> Result<(), OrchestratorError> {
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!(active_workflows = self.workflows.len(), "Orchestrator shutting down");
                    return Ok(());
                }
                item = inbound.recv() => {
                    let Some(item) = item else { return Ok(()) };
                    if let Err(e) = self.handle(item).await {
                        self.state.send_replace(PluginState::Failed);
                        tracing::error!(error = %e, "❌ Transport failure, orchestrator stopping");
                        return Err(e);
                    }
                    self.refresh_state();
                }
            }
        }
    }

    async fn handle(&mut self, item: Inbound) -> Result<(), OrchestratorError> {
        match item {
            Inbound::Routed(Route::CreateService, envelope) => self.create_service(envelope).await,
            Inbound::Resolved { correlation_id, outcome } => self.resolved(correlation_id, outcome).await,
        }
    }

    /// Spawn a workflow for a create request
    async fn create_service(&mut self, envelope: Envelope) -> Result<(), OrchestratorError> {
        let key = envelope.correlation_id.clone();
        if self.workflows.contains_key(&key) {
            tracing::warn!(
                correlation_id = %key,
                requester = %envelope.app_id,
                "Duplicate create request for an active workflow, discarded"
            );
            return Ok(());
        }

        let (workflow, effects) = Workflow::receive(&envelope, &self.config);
        self.settle(key, workflow, effects).await
    }

    /// Route a call outcome back to the workflow that issued the call
    async fn resolved(
        &mut self,
        correlation_id: String,
        outcome: Result<Envelope, CallError>,
    ) -> Result<(), OrchestratorError> {
        let Some(key) = self.directory.remove(&correlation_id) else {
            tracing::debug!(correlation_id = %correlation_id, "No workflow waits for this call");
            return Ok(());
        };
        let Some(mut workflow) = self.workflows.remove(&key) else {
            tracing::debug!(correlation_id = %key, "Workflow already gone");
            return Ok(());
        };

        let effects = workflow.resume(&correlation_id, outcome, &self.collaborators);
        self.settle(key, workflow, effects).await
    }

    /// Record where the workflow now waits, then carry out its effects in order
    async fn settle(&mut self, key: String, workflow: Workflow, effects: Vec<Effect>) -> Result<(), OrchestratorError> {
        let terminal = workflow.state().is_terminal();
        if !terminal {
            if let Some(outbound) = workflow.outbound_correlation_id() {
                self.directory.insert(outbound.to_string(), key.clone());
            }
        }

        let state = workflow.state();
        if terminal {
            tracing::debug!(correlation_id = %key, workflow.state = %state, "Workflow finished, removed");
        } else {
            self.workflows.insert(key.clone(), workflow);
        }

        for effect in effects {
            self.execute(&key, effect).await?;
            if !terminal && !self.workflows.contains_key(&key) {
                break;
            }
        }
        Ok(())
    }

    async fn execute(&mut self, key: &str, effect: Effect) -> Result<(), OrchestratorError> {
        match effect {
            Effect::Reply {
                topic,
                correlation_id,
                content_type,
                report,
            }
            | Effect::Notify {
                topic,
                correlation_id,
                content_type,
                report,
            } => {
                let sent = match Payload::encode(content_type, &report) {
                    Ok(payload) => self.correlator.notify(&topic, payload, &correlation_id).await,
                    Err(e) => Err(e.into()),
                };
                self.send(sent, key).await
            }
            Effect::Call {
                topic,
                correlation_id,
                payload,
            } => {
                let inbound = self.inbound.clone();
                let resolved_id = correlation_id.clone();
                let request = Request::new(topic, payload)
                    .with_correlation_id(correlation_id.as_str())
                    .with_timeout(self.config.call_timeout);

                let issued = self
                    .correlator
                    .call_async(request, move |outcome| {
                        let _ = inbound.send(Inbound::Resolved {
                            correlation_id: resolved_id,
                            outcome,
                        });
                    })
                    .await
                    .map(|_| ());
                self.send(issued, key).await
            }
            Effect::Publish { topic, payload } => {
                let sent = self.correlator.notify(&topic, payload, &new_correlation_id()).await;
                self.send(sent, key).await
            }
        }
    }

    /// Transport failures are fatal; anything else only costs this workflow its message
    async fn send(&mut self, result: Result<(), CorrelatorError>, key: &str) -> Result<(), OrchestratorError> {
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_transport() => Err(e.into()),
            Err(e) => {
                tracing::error!(correlation_id = %key, error = %e, "Effect could not be carried out");
                self.abandon(key, &e).await;
                Ok(())
            }
        }
    }

    /// Forget a workflow whose next message could not be sent, telling the
    /// requester once on a best-effort basis
    async fn abandon(&mut self, key: &str, cause: &CorrelatorError) {
        let Some(mut workflow) = self.workflows.remove(key) else {
            return;
        };
        if let Some(outbound) = workflow.outbound_correlation_id() {
            self.directory.remove(outbound);
        }
        tracing::warn!(correlation_id = %key, workflow.state = %workflow.state(), "Workflow abandoned");

        for effect in workflow.abort(cause.to_string()) {
            let (Effect::Reply { topic, correlation_id, content_type, report }
            | Effect::Notify { topic, correlation_id, content_type, report }) = effect
            else {
                continue;
            };
            let sent = match Payload::encode(content_type, &report) {
                Ok(payload) => self.correlator.notify(&topic, payload, &correlation_id).await,
                Err(e) => Err(e.into()),
            };
            if let Err(e) = sent {
                tracing::warn!(
                    correlation_id = %key,
                    error = %e,
                    "Requester could not be told about the abandoned workflow"
                );
            }
        }
    }

    fn refresh_state(&self) {
        let next = if self.workflows.is_empty() {
            PluginState::Ready
        } else {
            PluginState::Running
        };
        self.state.send_if_modified(|current| {
            if *current == PluginState::Failed || *current == next {
                return false;
            }
            *current = next;
            true
        });
    }
}
