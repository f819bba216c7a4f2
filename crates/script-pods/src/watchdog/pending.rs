//! Fails script pods that never leave the Pending phase.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::clock::Clock;
use crate::error::Result;
use crate::logs::ScriptLogProvider;
use crate::pods::{PodMonitor, PodPhase};
use crate::watchdog::sleep_or_cancel;

pub const RECHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Exit code recorded for scripts the agent gave up on.
pub const CANCELED_EXIT_CODE: i32 = -43;

pub struct PendingPodWatchdog {
    threshold: Option<Duration>,
    monitor: Arc<PodMonitor>,
    script_logs: Arc<ScriptLogProvider>,
    clock: Arc<dyn Clock>,
}

impl PendingPodWatchdog {
    pub fn new(
        threshold: Option<Duration>,
        monitor: Arc<PodMonitor>,
        script_logs: Arc<ScriptLogProvider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            threshold,
            monitor,
            script_logs,
            clock,
        }
    }

    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let Some(threshold) = self.threshold else {
            info!("No pending pod threshold configured, pending pod watchdog will not start");
            return Ok(());
        };

        info!(
            threshold_secs = threshold.as_secs(),
            "Starting pending pod watchdog"
        );
        loop {
            self.check_for_stuck_pods();

            if !sleep_or_cancel(RECHECK_INTERVAL, &cancel).await {
                return Ok(());
            }
        }
    }

    /// Fail every pod that has been pending longer than the threshold.
    /// Returns how many pods were failed by this check.
    #[instrument(skip(self))]
    pub fn check_for_stuck_pods(&self) -> usize {
        let Some(threshold) = self.threshold else {
            return 0;
        };
        let now = self.clock.now();
        let threshold_chrono = chrono::Duration::from_std(threshold).unwrap_or(chrono::Duration::MAX);
        let cutoff = now - threshold_chrono;

        let mut failed = 0;
        for status in self.monitor.get_all() {
            if status.phase != PodPhase::Pending || status.state.is_terminal() {
                continue;
            }
            let Some(created) = status.creation_timestamp else {
                continue;
            };
            if created >= cutoff {
                continue;
            }

            let ticket = &status.ticket;
            let message = format!(
                "The Kubernetes Pod '{}' has been in the 'Pending' phase for more than {} minutes.",
                ticket.pod_name(),
                threshold.as_secs() / 60
            );
            warn!(ticket = %ticket, "{message}");
            self.script_logs.get_or_create(ticket).error(message);

            if self.monitor.mark_as_completed(ticket, CANCELED_EXIT_CODE, now) {
                failed += 1;
            }
        }

        if failed == 0 {
            debug!("No stuck pending pods found");
        }
        failed
    }
}
