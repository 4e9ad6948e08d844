// service-lifecycle/src/bin/probe.rs - Sends create requests to a running lifecycle manager

use anyhow::{Context, Result};
use clap::Parser;
use orchestra::{topics, ContentType, Envelope, OrchestraConfig, OrchestraProvider, Payload, Request, StatusReport};
use serde_json::Value;
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;

/// Play the gatekeeper: submit a service descriptor bundle and report what comes back
#[derive(Parser, Debug)]
#[command(name = "slm-probe", version)]
struct Args {
    /// YAML or JSON document holding `service_descriptor` and `component_descriptor_N` entries
    request: PathBuf,

    /// Encoding used on the wire
    #[arg(long, default_value = "yaml")]
    format: ContentType,

    /// How long to wait for each reply, in milliseconds
    #[arg(long, default_value_t = 10_000)]
    timeout_ms: u64,

    /// Number of identical requests sent concurrently
    #[arg(long, default_value_t = 1)]
    count: usize,

    /// Keep listening for the final READY/ERROR status of every request
    #[arg(long)]
    follow: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    orchestra::observability::init_tracing_pretty();
    let args = Args::parse();
    let timeout = Duration::from_millis(args.timeout_ms);

    let raw = std::fs::read_to_string(&args.request)
        .with_context(|| format!("Failed to read {}", args.request.display()))?;
    let document: Value = serde_yaml::from_str(&raw).context("Request file is neither YAML nor JSON")?;

    let mut config = OrchestraConfig::from_env();
    config.correlator.app_id = "orchestra.probe".to_string();
    let probe = OrchestraProvider::try_new(config).await?;
    let correlator = probe.correlator().clone();

    // Final statuses arrive as notifications on the create topic
    let (status_tx, mut status_rx) = mpsc::unbounded_channel::<Envelope>();
    if args.follow {
        let own_app_id = correlator.app_id().to_string();
        correlator
            .register_notification_endpoint(topics::SERVICE_CREATE, move |envelope: Envelope| {
                let status_tx = status_tx.clone();
                let own = envelope.is_from(&own_app_id);
                async move {
                    if !own {
                        let _ = status_tx.send(envelope);
                    }
                }
            })
            .await?;
    }

    let calls = (0..args.count).map(|_| {
        let correlator = correlator.clone();
        let payload = Payload::encode(args.format, &document);
        async move {
            let request = Request::new(topics::SERVICE_CREATE, payload?).with_timeout(timeout);
            let reply = correlator.call_sync(request).await?;
            anyhow::Ok(reply)
        }
    });

    let mut awaiting = HashSet::new();
    for outcome in futures::future::join_all(calls).await {
        match outcome {
            Ok(reply) => {
                print_status("reply", &reply);
                let terminal = reply.decode::<StatusReport>().map(|r| r.is_error()).unwrap_or(true);
                if !terminal {
                    awaiting.insert(reply.correlation_id.clone());
                }
            }
            Err(e) => eprintln!("request failed: {e:#}"),
        }
    }

    if args.follow {
        while !awaiting.is_empty() {
            let Ok(Some(envelope)) = tokio::time::timeout(timeout, status_rx.recv()).await else {
                eprintln!("gave up waiting for {} final status(es)", awaiting.len());
                break;
            };
            if awaiting.remove(&envelope.correlation_id) {
                print_status("final", &envelope);
            }
        }
    }

    probe.shutdown().await
}

fn print_status(stage: &str, envelope: &Envelope) {
    let body = envelope
        .payload
        .document()
        .map(|document| serde_json::to_string(&document).unwrap_or_default())
        .unwrap_or_else(|e| format!("<undecodable: {e}>"));
    println!("{stage} {} {}", envelope.correlation_id, body);
}
