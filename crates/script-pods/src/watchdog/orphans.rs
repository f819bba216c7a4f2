//! Deletes completed script pods whose result nobody collected.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::clock::Clock;
use crate::config::AgentConfig;
use crate::error::Result;
use crate::logs::{EncryptionKeyProvider, ScriptLogProvider};
use crate::pods::{PodMonitor, PodService, PodStatus};
use crate::ticket::ScriptTicket;
use crate::watchdog::sleep_or_cancel;
use crate::watermark::SinceTimeStore;
use crate::workspace::ScriptWorkspaceFactory;

/// Wait before the first check, so a freshly started agent has loaded its pods.
pub const INITIAL_DELAY: Duration = Duration::from_secs(60);

pub struct OrphanedPodCleaner {
    config: Arc<AgentConfig>,
    monitor: Arc<PodMonitor>,
    pods: Arc<dyn PodService>,
    script_logs: Arc<ScriptLogProvider>,
    watermarks: Arc<SinceTimeStore>,
    keys: Arc<EncryptionKeyProvider>,
    workspaces: Arc<ScriptWorkspaceFactory>,
    clock: Arc<dyn Clock>,
}

impl OrphanedPodCleaner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<AgentConfig>,
        monitor: Arc<PodMonitor>,
        pods: Arc<dyn PodService>,
        script_logs: Arc<ScriptLogProvider>,
        watermarks: Arc<SinceTimeStore>,
        keys: Arc<EncryptionKeyProvider>,
        workspaces: Arc<ScriptWorkspaceFactory>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            monitor,
            pods,
            script_logs,
            watermarks,
            keys,
            workspaces,
            clock,
        }
    }

    /// Check every grace period until cancelled.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        if !sleep_or_cancel(INITIAL_DELAY, &cancel).await {
            return Ok(());
        }

        loop {
            debug!("Checking for orphaned script pods");
            self.check_for_orphaned_pods().await?;

            if !sleep_or_cancel(self.config.orphaned_after, &cancel).await {
                return Ok(());
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn check_for_orphaned_pods(&self) -> Result<()> {
        let grace = chrono::Duration::from_std(self.config.orphaned_after)
            .unwrap_or(chrono::Duration::MAX);
        let cutoff = self.clock.now() - grace;

        let orphaned: Vec<PodStatus> = self
            .monitor
            .get_all()
            .into_iter()
            .filter(|status| status.state.is_terminal() && status.last_updated <= cutoff)
            .collect();

        if orphaned.is_empty() {
            debug!("No orphaned script pods found");
            return Ok(());
        }

        info!(count = orphaned.len(), "Found orphaned script pods, deleting them");
        for status in orphaned {
            let ticket = &status.ticket;
            if let Err(e) = self.release_script_state(ticket).await {
                warn!(
                    ticket = %ticket,
                    error = %e,
                    "Unable to clean up orphaned script state, will try again next check"
                );
                continue;
            }

            if self.config.disable_automatic_pod_cleanup {
                debug!(ticket = %ticket, "Automatic pod cleanup is disabled, keeping orphaned pod");
                continue;
            }

            if let Err(e) = self.pods.delete_if_exists(ticket).await {
                warn!(
                    ticket = %ticket,
                    error = %e,
                    "Unable to delete orphaned script pod, will try again next check"
                );
            }
        }

        Ok(())
    }

    /// Drop the sink, watermarks, key and workspace kept for `ticket`.
    async fn release_script_state(&self, ticket: &ScriptTicket) -> Result<()> {
        self.script_logs.delete(ticket);
        self.watermarks.delete(ticket).await?;
        self.keys.delete(ticket).await?;
        self.workspaces.delete(ticket).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::pods::{MockPodService, PodWatchEvent};
    use crate::testing::script_pod;
    use chrono::{DateTime, TimeZone, Utc};
    use mockall::predicate::eq;
    use tempfile::TempDir;

    struct Harness {
        dir: TempDir,
        clock: Arc<FixedClock>,
        monitor: Arc<PodMonitor>,
        script_logs: Arc<ScriptLogProvider>,
        watermarks: Arc<SinceTimeStore>,
        workspaces: Arc<ScriptWorkspaceFactory>,
        cleaner: OrphanedPodCleaner,
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn harness(mock: MockPodService, config: AgentConfig) -> Harness {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(FixedClock::new(t0()));
        let pods: Arc<dyn PodService> = Arc::new(mock);
        let workspaces = Arc::new(ScriptWorkspaceFactory::new(dir.path()));
        let script_logs = Arc::new(ScriptLogProvider::new(clock.clone()));
        let monitor = Arc::new(PodMonitor::new(
            pods.clone(),
            script_logs.clone(),
            clock.clone(),
        ));
        let watermarks = Arc::new(SinceTimeStore::new(workspaces.clone()));
        let cleaner = OrphanedPodCleaner::new(
            Arc::new(config),
            monitor.clone(),
            pods,
            script_logs.clone(),
            watermarks.clone(),
            Arc::new(EncryptionKeyProvider::new(workspaces.clone())),
            workspaces.clone(),
            clock.clone(),
        );
        Harness {
            dir,
            clock,
            monitor,
            script_logs,
            watermarks,
            workspaces,
            cleaner,
        }
    }

    fn ten_minute_grace() -> AgentConfig {
        AgentConfig {
            orphaned_after: Duration::from_secs(10 * 60),
            ..AgentConfig::default()
        }
    }

    #[tokio::test]
    async fn completed_pod_is_deleted_once_after_the_grace_period() {
        let ticket = ScriptTicket::new("finished");
        let mut mock = MockPodService::new();
        mock.expect_delete_if_exists()
            .with(eq(ticket.clone()))
            .times(1)
            .returning(|_| Ok(()));

        let h = harness(mock, ten_minute_grace());
        let pod = script_pod(&ticket, "Succeeded", Some((0, t0())));
        h.monitor.apply(PodWatchEvent::Added(pod.clone()));

        h.clock.wind_forward(chrono::Duration::minutes(9));
        h.cleaner.check_for_orphaned_pods().await.unwrap();

        h.watermarks
            .update_pod_logs_since_time(&ticket, t0())
            .await
            .unwrap();
        h.clock.wind_forward(chrono::Duration::minutes(2));
        h.cleaner.check_for_orphaned_pods().await.unwrap();
        assert!(!h.dir.path().join(ticket.pod_name()).exists());
        assert!(h.workspaces.is_empty());

        h.monitor.apply(PodWatchEvent::Deleted(pod));
        h.clock.wind_forward(chrono::Duration::minutes(10));
        h.cleaner.check_for_orphaned_pods().await.unwrap();
    }

    #[tokio::test]
    async fn running_pods_are_never_orphaned() {
        let mut mock = MockPodService::new();
        mock.expect_delete_if_exists().never();

        let h = harness(mock, ten_minute_grace());
        let ticket = ScriptTicket::new("busy");
        h.monitor
            .apply(PodWatchEvent::Added(script_pod(&ticket, "Running", None)));

        h.clock.wind_forward(chrono::Duration::hours(5));
        h.cleaner.check_for_orphaned_pods().await.unwrap();
    }

    #[tokio::test]
    async fn disabled_cleanup_still_drops_script_state() {
        let mut mock = MockPodService::new();
        mock.expect_delete_if_exists().never();

        let h = harness(
            mock,
            AgentConfig {
                disable_automatic_pod_cleanup: true,
                ..ten_minute_grace()
            },
        );
        let ticket = ScriptTicket::new("kept");
        h.monitor.apply(PodWatchEvent::Added(script_pod(
            &ticket,
            "Failed",
            Some((2, t0())),
        )));
        h.script_logs.get_or_create(&ticket).info("left over");

        h.clock.wind_forward(chrono::Duration::minutes(11));
        h.cleaner.check_for_orphaned_pods().await.unwrap();

        assert!(h.script_logs.is_empty());
    }

    #[tokio::test]
    async fn failed_deletion_is_retried_next_check() {
        let ticket = ScriptTicket::new("stubborn");
        let mut mock = MockPodService::new();
        let mut seq = mockall::Sequence::new();
        mock.expect_delete_if_exists()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(crate::error::Error::Watch("api unavailable".to_string())));
        mock.expect_delete_if_exists()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let h = harness(mock, ten_minute_grace());
        h.monitor.apply(PodWatchEvent::Added(script_pod(
            &ticket,
            "Succeeded",
            Some((0, t0())),
        )));

        h.clock.wind_forward(chrono::Duration::minutes(11));
        h.cleaner.check_for_orphaned_pods().await.unwrap();
        h.cleaner.check_for_orphaned_pods().await.unwrap();
    }

    #[tokio::test]
    async fn one_broken_workspace_does_not_block_other_orphans() {
        let broken = ScriptTicket::new("a-broken");
        let healthy = ScriptTicket::new("b-healthy");
        let mut mock = MockPodService::new();
        mock.expect_delete_if_exists()
            .with(eq(broken.clone()))
            .never();
        mock.expect_delete_if_exists()
            .with(eq(healthy.clone()))
            .times(1)
            .returning(|_| Ok(()));

        let h = harness(mock, ten_minute_grace());
        // A directory where the watermark file belongs cannot be removed as a file.
        std::fs::create_dir_all(
            h.dir
                .path()
                .join(broken.pod_name())
                .join("podLogsSinceTime"),
        )
        .unwrap();
        for ticket in [&broken, &healthy] {
            h.monitor.apply(PodWatchEvent::Added(script_pod(
                ticket,
                "Succeeded",
                Some((0, t0())),
            )));
        }

        h.clock.wind_forward(chrono::Duration::minutes(11));
        h.cleaner.check_for_orphaned_pods().await.unwrap();
    }
}
