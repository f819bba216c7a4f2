//! Script pod agent runtime
//!
//! Builds every component from one [`AgentConfig`] and runs the background
//! loops (pod status tracking and both watchdogs) under a [`Supervisor`].

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::clock::{Clock, SystemClock};
use crate::config::AgentConfig;
use crate::error::Result;
use crate::logs::{EncryptionKeyProvider, PodLogService, ScriptLogProvider};
use crate::pods::{PodMonitor, PodService};
use crate::scripts::ScriptPodService;
use crate::supervisor::Supervisor;
use crate::watchdog::{OrphanedPodCleaner, PendingPodWatchdog};
use crate::watermark::SinceTimeStore;
use crate::workspace::ScriptWorkspaceFactory;

/// How long shutdown waits for background loops to unwind.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

pub struct ScriptPodAgent {
    config: Arc<AgentConfig>,
    monitor: Arc<PodMonitor>,
    cleaner: Arc<OrphanedPodCleaner>,
    pending_watchdog: Arc<PendingPodWatchdog>,
    scripts: Arc<ScriptPodService>,
    supervisor: Supervisor,
}

impl ScriptPodAgent {
    /// Agent on the system clock.
    pub fn new(config: AgentConfig, pods: Arc<dyn PodService>) -> Result<Self> {
        Self::with_clock(config, pods, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: AgentConfig,
        pods: Arc<dyn PodService>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let workspaces = Arc::new(ScriptWorkspaceFactory::new(config.workspace_root.clone()));
        let script_logs = Arc::new(ScriptLogProvider::new(clock.clone()));
        let watermarks = Arc::new(SinceTimeStore::new(workspaces.clone()));
        let keys = Arc::new(EncryptionKeyProvider::new(workspaces.clone()));
        let monitor = Arc::new(PodMonitor::new(
            pods.clone(),
            script_logs.clone(),
            clock.clone(),
        ));

        let log_service = Arc::new(PodLogService::new(
            config.clone(),
            pods.clone(),
            monitor.clone(),
            script_logs.clone(),
            watermarks.clone(),
            keys.clone(),
            clock.clone(),
        ));
        let cleaner = Arc::new(OrphanedPodCleaner::new(
            config.clone(),
            monitor.clone(),
            pods.clone(),
            script_logs.clone(),
            watermarks.clone(),
            keys.clone(),
            workspaces.clone(),
            clock.clone(),
        ));
        let pending_watchdog = Arc::new(PendingPodWatchdog::new(
            config.pending_stuck_after,
            monitor.clone(),
            script_logs.clone(),
            clock.clone(),
        ));
        let scripts = Arc::new(ScriptPodService::new(
            config.clone(),
            pods,
            monitor.clone(),
            log_service,
            script_logs,
            watermarks,
            keys,
            workspaces,
            clock,
        ));

        Ok(Self {
            config,
            monitor,
            cleaner,
            pending_watchdog,
            scripts,
            supervisor: Supervisor::new(),
        })
    }

    /// Spawn the background loops. They run until [`Self::shutdown`].
    pub fn start(&self) {
        info!(
            namespace = %self.config.namespace,
            workspace_root = %self.config.workspace_root.display(),
            "Starting script pod agent"
        );

        let monitor = self.monitor.clone();
        self.supervisor.spawn_loop("pod-monitor", move |cancel| {
            let monitor = monitor.clone();
            async move { monitor.run(cancel).await }
        });

        let cleaner = self.cleaner.clone();
        self.supervisor.spawn_loop("orphaned-pod-cleaner", move |cancel| {
            let cleaner = cleaner.clone();
            async move { cleaner.run(cancel).await }
        });

        let pending_watchdog = self.pending_watchdog.clone();
        self.supervisor.spawn_loop("pending-pod-watchdog", move |cancel| {
            let pending_watchdog = pending_watchdog.clone();
            async move { pending_watchdog.run(cancel).await }
        });
    }

    #[must_use]
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    #[must_use]
    pub fn monitor(&self) -> Arc<PodMonitor> {
        self.monitor.clone()
    }

    #[must_use]
    pub fn scripts(&self) -> Arc<ScriptPodService> {
        self.scripts.clone()
    }

    /// Stop the background loops, waiting at most `grace`.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        info!("Shutting down script pod agent");
        self.supervisor.shutdown(grace).await
    }
}
