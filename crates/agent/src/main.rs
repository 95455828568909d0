//! Cluster relay - streams cluster state changes to the relay backend
//!
//! One process runs one domain watcher, selected by subcommand, and keeps
//! a streaming session to the backend alive until SIGINT/SIGTERM.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cluster_relay::{api, config::AgentConfig};
use relay_lib::{
    health::HealthRegistry,
    observability::{RelayMetrics, StructuredLogger},
    progress::ProgressSink,
    sync::{AgentIdentity, ReconnectPolicy, StreamingConfig, StreamingSession, SyncClientBuilder},
    tracker::TrackerConfig,
    watch::{cluster_uid, ClusterWatch, KubeWatch},
    watchers::{
        DomainWatcher, EventWatcher, EventWatcherConfig, NodeUsageWatcher, NodeWatcher,
        NodeWatcherConfig, UsageWatcherConfig, WorkflowWatcher, WorkflowWatcherConfig,
    },
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Cluster relay agent
#[derive(Parser)]
#[command(name = "cluster-relay")]
#[command(version, about = "Relays cluster state changes to the backend", long_about = None)]
struct Cli {
    #[command(subcommand)]
    watcher: WatcherCommand,
}

#[derive(Subcommand, Clone, Copy, Debug)]
enum WatcherCommand {
    /// Workflow task pod status
    Workflow,
    /// Node resource state and inventory
    Node,
    /// Per-node pod resource requests
    NodeUsage,
    /// Pod events
    Event,
}

fn build_watcher(
    command: WatcherCommand,
    cluster: Arc<dyn ClusterWatch>,
    config: &AgentConfig,
) -> Arc<dyn DomainWatcher> {
    let tracker = TrackerConfig {
        ttl: Duration::from_secs(config.tracker_ttl_secs),
    };
    match command {
        WatcherCommand::Workflow => Arc::new(WorkflowWatcher::new(
            cluster,
            WorkflowWatcherConfig {
                namespace: config.namespace.clone(),
                tracker,
                ..Default::default()
            },
            &config.agent_id,
        )),
        WatcherCommand::Node => Arc::new(NodeWatcher::new(
            cluster,
            NodeWatcherConfig {
                label_selector: config.node_label_selector.clone(),
                resync_interval: Duration::from_secs(config.node_resync_secs),
                tracker,
                ..Default::default()
            },
            &config.agent_id,
        )),
        WatcherCommand::NodeUsage => Arc::new(NodeUsageWatcher::new(
            cluster,
            UsageWatcherConfig {
                managed_namespaces: config.managed_namespaces.clone(),
                include_pending: config.include_pending,
                flush_interval: Duration::from_secs(config.usage_flush_secs),
                ..Default::default()
            },
            &config.agent_id,
        )),
        WatcherCommand::Event => Arc::new(EventWatcher::new(
            cluster,
            EventWatcherConfig {
                namespace: config.namespace.clone(),
                tracker: TrackerConfig {
                    ttl: Duration::from_secs(config.event_ttl_secs),
                },
                ..Default::default()
            },
            &config.agent_id,
        )),
    }
}

async fn shutdown_signal() -> &'static str {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => "SIGINT received",
        _ = terminate => "SIGTERM received",
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let cli = Cli::parse();
    let config = AgentConfig::load()?;
    info!(agent_id = %config.agent_id, watcher = ?cli.watcher, "Starting cluster-relay");

    let kube = KubeWatch::try_default().await?;
    let cluster_uid = cluster_uid(kube.client()).await?;
    let cluster: Arc<dyn ClusterWatch> = Arc::new(kube);

    let watcher = build_watcher(cli.watcher, cluster, &config);
    let logger = StructuredLogger::new(&config.agent_id, watcher.name());
    logger.log_startup(AGENT_VERSION, &cluster_uid);

    let mut client = SyncClientBuilder::new().endpoint(&config.backend_endpoint);
    if let Some(path) = &config.ca_cert_path {
        client = client.ca_cert_path(path);
    }
    if let Some(path) = &config.client_cert_path {
        client = client.client_cert_path(path);
    }
    if let Some(path) = &config.client_key_path {
        client = client.client_key_path(path);
    }
    let client = Arc::new(client.build().context("Invalid backend client configuration")?);

    let progress = Arc::new(ProgressSink::new(config.progress_file.clone()));
    let health =
        HealthRegistry::new().with_progress(Arc::clone(&progress), config.progress_stale_bound());
    let identity = AgentIdentity {
        agent_id: config.agent_id.clone(),
        agent_version: AGENT_VERSION.to_string(),
        cluster_uid,
    };
    let streaming = StreamingConfig {
        send_queue_capacity: config.send_queue_capacity,
        unacked_capacity: config.unacked_capacity,
        heartbeat_interval: Duration::from_secs(config.heartbeat_secs),
        shutdown_grace: Duration::from_secs(config.shutdown_grace_secs),
        ..Default::default()
    };
    let session = StreamingSession::new(client, watcher, identity, streaming, progress)
        .with_health(health.clone());

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        let reason = shutdown_signal().await;
        info!(reason, "Shutdown signal received");
        signal_cancel.cancel();
    });

    // Start health and metrics server
    let app_state = Arc::new(api::AppState::new(health.clone(), RelayMetrics::new()));
    let api_cancel = CancellationToken::new();
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state, api_cancel.clone()));

    let reconnects = session.run_forever(&ReconnectPolicy::default(), &cancel).await;
    info!(reconnects, unacked = session.unacked().len(), "Relay stopped");

    health.stopping().await;
    api_cancel.cancel();
    match tokio::time::timeout(Duration::from_secs(5), api_handle).await {
        Ok(Ok(Err(e))) => warn!(error = %e, "API server failed"),
        Ok(Err(e)) => warn!(error = %e, "API server task failed"),
        Err(_) => warn!("API server did not stop in time"),
        Ok(Ok(Ok(()))) => {}
    }

    Ok(())
}
