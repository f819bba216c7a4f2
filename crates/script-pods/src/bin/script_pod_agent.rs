/*
 * 5D Labs Agent Platform - Script Pod Agent
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! Script Pod Agent
//!
//! Tracks every script pod in one namespace, serves health endpoints and runs
//! the orphan and pending-pod watchdogs until it receives Ctrl-C or SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use script_pods::agent::DEFAULT_SHUTDOWN_GRACE;
use script_pods::config::MAX_WATCH_TIMEOUT;
use script_pods::pods::KubePodService;
use script_pods::{health, AgentConfig, ScriptPodAgent};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "script-pod-agent")]
#[command(about = "Tracks script pods, streams their logs and cleans up after them")]
#[command(version)]
#[allow(clippy::struct_excessive_bools)]
struct Args {
    /// Namespace the script pods run in
    #[arg(long, env = "POD_AGENT_NAMESPACE", default_value = "default")]
    namespace: String,

    /// Directory holding one workspace per script
    #[arg(
        long,
        env = "POD_AGENT_WORKSPACE_ROOT",
        default_value = "/var/lib/script-pods/work"
    )]
    workspace_root: PathBuf,

    /// Seconds a single pod watch stays open before relisting
    #[arg(long, env = "POD_AGENT_WATCH_TIMEOUT_SECS", default_value_t = MAX_WATCH_TIMEOUT.as_secs())]
    watch_timeout_secs: u64,

    /// Minutes after which an uncollected completed pod is deleted
    #[arg(
        long,
        env = "POD_AGENT_PODS_CONSIDERED_ORPHANED_AFTER_MINUTES",
        default_value_t = 10
    )]
    orphaned_after_minutes: u64,

    /// Keep orphaned pods instead of deleting them
    #[arg(long, env = "POD_AGENT_DISABLE_AUTO_POD_CLEANUP")]
    disable_automatic_pod_cleanup: bool,

    /// Minutes a pod may stay Pending before its script is failed
    #[arg(long, env = "POD_AGENT_PENDING_PODS_CONSIDERED_STUCK_AFTER_MINUTES")]
    pending_stuck_after_minutes: Option<u64>,

    /// Do not copy pod events into script logs
    #[arg(long, env = "POD_AGENT_DISABLE_POD_EVENTS_IN_TASK_LOG")]
    disable_pod_events_in_task_log: bool,

    /// Whether script pods encrypt their log messages
    #[arg(
        long,
        env = "POD_AGENT_LOG_ENCRYPTION",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    log_encryption: bool,

    /// Port for /health, /ready and /pods
    #[arg(long, env = "POD_AGENT_HEALTH_PORT", default_value_t = 8080)]
    health_port: u16,

    /// Emit logs as JSON
    #[arg(long, env = "POD_AGENT_LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn agent_config(&self) -> AgentConfig {
        AgentConfig {
            namespace: self.namespace.clone(),
            workspace_root: self.workspace_root.clone(),
            watch_timeout: Duration::from_secs(self.watch_timeout_secs),
            orphaned_after: Duration::from_secs(self.orphaned_after_minutes * 60),
            disable_automatic_pod_cleanup: self.disable_automatic_pod_cleanup,
            pending_stuck_after: self
                .pending_stuck_after_minutes
                .map(|minutes| Duration::from_secs(minutes * 60)),
            disable_pod_events_in_task_log: self.disable_pod_events_in_task_log,
            log_encryption: self.log_encryption,
            health_port: self.health_port,
            ..AgentConfig::default()
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "script_pods=info,script_pod_agent=info".into());
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    info!("Starting script pod agent v{}", env!("CARGO_PKG_VERSION"));

    let config = args.agent_config();
    let client = kube::Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;
    info!(namespace = %config.namespace, "Connected to Kubernetes cluster");

    let pods = Arc::new(KubePodService::new(client, &config));
    let health_port = config.health_port;
    let agent = ScriptPodAgent::new(config, pods).context("Invalid agent configuration")?;
    agent.start();

    let health_cancel = CancellationToken::new();
    let health_server = tokio::spawn(health::serve(
        agent.monitor(),
        health_port,
        health_cancel.clone(),
    ));

    shutdown_signal().await;

    health_cancel.cancel();
    match health_server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Health server failed"),
        Err(e) => error!(error = %e, "Health server task panicked"),
    }

    if !agent.shutdown(DEFAULT_SHUTDOWN_GRACE).await {
        warn!("Some background loops did not stop in time");
    }
    info!("Script pod agent stopped");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, shutting down gracefully");
        },
        () = terminate => {
            info!("Received SIGTERM, shutting down gracefully");
        },
    }
}
