//! Lifecycle state of one tracked script pod.

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{ContainerStateTerminated, ContainerStatus, Pod};
use serde::Serialize;
use tracing::warn;

use crate::ticket::ScriptTicket;

/// Exit code reported when a failed pod exposes none
pub const DEFAULT_FAILED_EXIT_CODE: i32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PodState {
    Running,
    Succeeded,
    Failed,
}

impl PodState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// Phase the API server last reported for the pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    fn of(pod: &Pod) -> Self {
        match pod.status.as_ref().and_then(|s| s.phase.as_deref()) {
            Some("Pending") => Self::Pending,
            Some("Running") => Self::Running,
            Some("Succeeded") => Self::Succeeded,
            Some("Failed") => Self::Failed,
            _ => Self::Unknown,
        }
    }
}

/// Copy of a tracked pod's state, safe to hand out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PodStatus {
    pub ticket: ScriptTicket,
    pub state: PodState,
    pub phase: PodPhase,
    pub exit_code: Option<i32>,
    /// True when `exit_code` was substituted because the pod did not report one.
    pub exit_code_inferred: bool,
    /// Time of the last state transition.
    pub last_updated: DateTime<Utc>,
    pub creation_timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub(crate) struct TrackedScriptPod {
    status: PodStatus,
}

impl TrackedScriptPod {
    pub(crate) fn new(ticket: ScriptTicket, now: DateTime<Utc>) -> Self {
        Self {
            status: PodStatus {
                ticket,
                state: PodState::Running,
                phase: PodPhase::Pending,
                exit_code: None,
                exit_code_inferred: false,
                last_updated: now,
                creation_timestamp: None,
            },
        }
    }

    pub(crate) fn status(&self) -> PodStatus {
        self.status.clone()
    }

    /// Recompute state from the pod as last reported by the API server.
    pub(crate) fn update(&mut self, pod: &Pod, now: DateTime<Utc>) {
        self.status.phase = PodPhase::of(pod);
        self.status.creation_timestamp = pod.metadata.creation_timestamp.as_ref().map(|t| t.0);

        let terminated = self.terminated_state(pod);
        let finished_at = terminated
            .and_then(|t| t.finished_at.as_ref())
            .map_or(now, |t| t.0);

        match self.status.phase {
            PodPhase::Succeeded => {
                let exit_code = terminated.map_or(0, |t| t.exit_code);
                self.complete(PodState::Succeeded, exit_code, false, finished_at);
            }
            PodPhase::Failed => match terminated {
                Some(t) => self.complete(PodState::Failed, t.exit_code, false, finished_at),
                None => {
                    if self.status.state != PodState::Failed {
                        warn!(
                            ticket = %self.status.ticket,
                            "Failed script pod reported no terminated container, assuming exit code {}",
                            DEFAULT_FAILED_EXIT_CODE
                        );
                    }
                    self.complete(
                        PodState::Failed,
                        DEFAULT_FAILED_EXIT_CODE,
                        true,
                        finished_at,
                    );
                }
            },
            // Terminal states stick: a late non-terminal update never revives a pod.
            PodPhase::Pending | PodPhase::Running | PodPhase::Unknown => {}
        }
    }

    /// Force a terminal state, for completion learnt outside the pod watch.
    pub(crate) fn mark_as_completed(&mut self, exit_code: i32, finished_at: DateTime<Utc>) {
        let state = if exit_code == 0 {
            PodState::Succeeded
        } else {
            PodState::Failed
        };
        self.complete(state, exit_code, false, finished_at);
    }

    fn complete(
        &mut self,
        state: PodState,
        exit_code: i32,
        inferred: bool,
        finished_at: DateTime<Utc>,
    ) {
        if self.status.state != state {
            self.status.state = state;
            self.status.last_updated = finished_at;
        }
        self.status.exit_code = Some(exit_code);
        self.status.exit_code_inferred = inferred;
    }

    fn terminated_state<'a>(&self, pod: &'a Pod) -> Option<&'a ContainerStateTerminated> {
        let statuses = pod.status.as_ref()?.container_statuses.as_ref()?;
        let pod_name = self.status.ticket.pod_name();
        let terminated = |c: &'a ContainerStatus| {
            c.state.as_ref().and_then(|s| s.terminated.as_ref())
        };

        statuses
            .iter()
            .find(|c| c.name == pod_name)
            .and_then(terminated)
            .or_else(|| statuses.iter().find_map(terminated))
    }
}
