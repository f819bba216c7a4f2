//! Agent configuration
//!
//! Built once at start-up (the binary binds every field to an environment
//! variable through clap) and shared as `Arc<AgentConfig>`.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// Upper bound the API server accepts for a watch request timeout.
pub const MAX_WATCH_TIMEOUT: Duration = Duration::from_secs(290);

/// Script pod agent configuration
#[derive(Debug, Clone)]
#[allow(clippy::struct_excessive_bools)]
pub struct AgentConfig {
    /// Namespace every script pod lives in.
    pub namespace: String,

    /// Root directory holding one workspace directory per script.
    pub workspace_root: PathBuf,

    /// How long a single watch request stays open before the tracker relists.
    pub watch_timeout: Duration,

    /// Completed pods not collected within this period are deleted.
    pub orphaned_after: Duration,

    /// Keep orphaned pods around (their in-memory state is still dropped).
    pub disable_automatic_pod_cleanup: bool,

    /// Pods pending for longer than this are failed. `None` disables the watchdog.
    pub pending_stuck_after: Option<Duration>,

    /// Skip translating pod events into script log lines.
    pub disable_pod_events_in_task_log: bool,

    /// Pod log messages are AES-256-GCM sealed by the script runner.
    pub log_encryption: bool,

    /// Port of the health/readiness server.
    pub health_port: u16,

    /// How long callers wait for the first full pod list.
    pub initial_load_timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            workspace_root: PathBuf::from("/var/lib/script-pods/work"),
            watch_timeout: MAX_WATCH_TIMEOUT,
            orphaned_after: Duration::from_secs(10 * 60),
            disable_automatic_pod_cleanup: false,
            pending_stuck_after: None,
            disable_pod_events_in_task_log: false,
            log_encryption: true,
            health_port: 8080,
            initial_load_timeout: Duration::from_secs(60),
        }
    }
}

impl AgentConfig {
    /// Watch timeout clamped to what the API server will accept.
    #[must_use]
    pub fn effective_watch_timeout(&self) -> Duration {
        self.watch_timeout.clamp(Duration::from_secs(1), MAX_WATCH_TIMEOUT)
    }

    /// Validate that the configuration can drive the agent
    pub fn validate(&self) -> Result<()> {
        if self.namespace.trim().is_empty() {
            return Err(Error::Config("namespace must not be empty".to_string()));
        }

        if self.orphaned_after.is_zero() {
            return Err(Error::Config(
                "orphaned pod grace period must be greater than zero".to_string(),
            ));
        }

        if self.pending_stuck_after.is_some_and(|d| d.is_zero()) {
            return Err(Error::Config(
                "pending pod stuck threshold must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}
