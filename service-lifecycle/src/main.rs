// service-lifecycle/src/main.rs - Service lifecycle manager node

use anyhow::Result;
use orchestra::{Collaborators, OrchestraProvider, PluginState};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured logging with JSON output
    orchestra::observability::init_tracing();

    tracing::info!(
        service.name = "service-lifecycle",
        service.version = env!("CARGO_PKG_VERSION"),
        "Starting service lifecycle manager"
    );

    let app = match OrchestraProvider::new().await {
        Ok(provider) => provider,
        Err(e) => {
            tracing::error!(error = %e, "Failed to initialize Orchestra provider");
            return Err(e);
        }
    };

    let config = app.config();
    tracing::info!(
        nats.url = %config.base.nats_url,
        nats.token = if config.base.nats_token.is_some() { "****" } else { "none" },
        app_id = %config.correlator.app_id,
        call_timeout_ms = config.orchestrator.call_timeout.as_millis() as u64,
        wire_format = %config.orchestrator.wire_format,
        topics.create = %config.orchestrator.topics.service_create,
        topics.list = %config.orchestrator.topics.compute_list,
        topics.deploy = %config.orchestrator.topics.service_deploy,
        topics.monitoring = %config.orchestrator.topics.monitoring,
        "Configuration loaded"
    );

    let orchestrator = app.start_orchestrator(Collaborators::default()).await?;

    let health = app.health_check(Some(&orchestrator));
    tracing::info!(
        health.overall = ?health.overall,
        health.nats = ?health.nats,
        health.orchestrator = ?health.orchestrator,
        "System health check completed"
    );

    let mut state = orchestrator.watch_state();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let failed = loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("Received shutdown signal");
                break false;
            }
            changed = state.changed() => {
                if changed.is_err() {
                    break true;
                }
                let current = *state.borrow_and_update();
                tracing::debug!(
                    plugin.state = %current,
                    pending_calls = app.correlator().pending_calls(),
                    "Plugin state changed"
                );
                if current == PluginState::Failed {
                    break true;
                }
            }
        }
    };

    if failed {
        let outcome = orchestrator.join().await;
        app.shutdown().await?;
        tracing::error!("Orchestrator stopped unexpectedly");
        return outcome.map_err(Into::into);
    }

    orchestrator.shutdown().await?;
    app.shutdown().await?;
    tracing::info!("Service lifecycle manager shut down gracefully");
    Ok(())
}
