//! Script status façade
//!
//! What a deployment orchestrator talks to: poll a script for its state and
//! new output, cancel it, and acknowledge its result so every piece of
//! per-script state is released.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, instrument};

use crate::clock::Clock;
use crate::config::AgentConfig;
use crate::error::Result;
use crate::logs::{
    EncryptionKeyProvider, PodLogService, ProcessOutput, ProcessOutputSource, ScriptLogProvider,
};
use crate::pods::{PodMonitor, PodPhase, PodService, PodStatus};
use crate::supervisor::{retry_transient, TRANSIENT_ATTEMPTS};
use crate::ticket::ScriptTicket;
use crate::watermark::SinceTimeStore;
use crate::workspace::ScriptWorkspaceFactory;

/// Exit code reported for a script whose pod no longer exists.
pub const POD_NOT_FOUND_EXIT_CODE: i32 = -81;

/// Script lifecycle as the orchestrator sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProcessState {
    Pending,
    Running,
    Complete,
}

impl ProcessState {
    fn of(status: &PodStatus) -> Self {
        if status.state.is_terminal() {
            Self::Complete
        } else if status.phase == PodPhase::Pending {
            Self::Pending
        } else {
            Self::Running
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScriptStatusResponse {
    pub ticket: ScriptTicket,
    pub state: ProcessState,
    pub exit_code: i32,
    pub logs: Vec<ProcessOutput>,
    pub next_log_sequence: i64,
}

pub struct ScriptPodService {
    config: Arc<AgentConfig>,
    pods: Arc<dyn PodService>,
    monitor: Arc<PodMonitor>,
    log_service: Arc<PodLogService>,
    script_logs: Arc<ScriptLogProvider>,
    watermarks: Arc<SinceTimeStore>,
    keys: Arc<EncryptionKeyProvider>,
    workspaces: Arc<ScriptWorkspaceFactory>,
    clock: Arc<dyn Clock>,
}

impl ScriptPodService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<AgentConfig>,
        pods: Arc<dyn PodService>,
        monitor: Arc<PodMonitor>,
        log_service: Arc<PodLogService>,
        script_logs: Arc<ScriptLogProvider>,
        watermarks: Arc<SinceTimeStore>,
        keys: Arc<EncryptionKeyProvider>,
        workspaces: Arc<ScriptWorkspaceFactory>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            pods,
            monitor,
            log_service,
            script_logs,
            watermarks,
            keys,
            workspaces,
            clock,
        }
    }

    /// Current state of `ticket` plus every output line after `last_log_sequence`.
    #[instrument(skip(self), fields(ticket = %ticket))]
    pub async fn get_status(
        &self,
        ticket: &ScriptTicket,
        last_log_sequence: i64,
    ) -> Result<ScriptStatusResponse> {
        match self.find(ticket).await? {
            Some(status) => self.response(status, last_log_sequence).await,
            None => Ok(self.missing_pod_response(ticket, last_log_sequence)),
        }
    }

    /// Report the script's state, then delete its pod.
    #[instrument(skip(self), fields(ticket = %ticket))]
    pub async fn cancel_script(
        &self,
        ticket: &ScriptTicket,
        last_log_sequence: i64,
    ) -> Result<ScriptStatusResponse> {
        let Some(status) = self.find(ticket).await? else {
            return Ok(self.missing_pod_response(ticket, last_log_sequence));
        };

        let response = self.response(status, last_log_sequence).await?;
        info!("Cancelling script, deleting its pod");
        self.delete_pod(ticket).await?;
        Ok(response)
    }

    /// Release everything held for `ticket` once its result was collected.
    #[instrument(skip(self), fields(ticket = %ticket))]
    pub async fn complete_script(&self, ticket: &ScriptTicket) -> Result<()> {
        self.monitor.forget(ticket);
        self.script_logs.delete(ticket);
        self.watermarks.delete(ticket).await?;
        self.keys.delete(ticket).await?;
        // Last: the deletes above re-register the workspace lock.
        self.workspaces.delete(ticket).await?;

        if self.config.disable_automatic_pod_cleanup {
            debug!("Automatic pod cleanup is disabled, keeping completed pod");
            return Ok(());
        }
        self.delete_pod(ticket).await
    }

    async fn delete_pod(&self, ticket: &ScriptTicket) -> Result<()> {
        retry_transient("delete script pod", TRANSIENT_ATTEMPTS, || {
            self.pods.delete_if_exists(ticket)
        })
        .await
    }

    /// Look `ticket` up, waiting for the first full list before calling it missing.
    async fn find(&self, ticket: &ScriptTicket) -> Result<Option<PodStatus>> {
        if let Some(status) = self.monitor.get_status(ticket) {
            return Ok(Some(status));
        }
        if !self.monitor.is_initial_load_complete() {
            self.monitor
                .wait_for_initial_load(self.config.initial_load_timeout)
                .await?;
        }
        Ok(self.monitor.get_status(ticket))
    }

    async fn response(
        &self,
        status: PodStatus,
        last_log_sequence: i64,
    ) -> Result<ScriptStatusResponse> {
        let logs = self
            .log_service
            .get_logs(&status.ticket, last_log_sequence)
            .await?;

        // The end-of-stream line may have just completed the pod.
        let status = self
            .monitor
            .get_status(&status.ticket)
            .unwrap_or(status);

        // Status first: it is what the state below is based on.
        let mut outputs = Vec::with_capacity(logs.outputs.len() + 1);
        outputs.push(ProcessOutput::new(
            ProcessOutputSource::Debug,
            format!(
                "The Kubernetes Pod '{}' is in the '{:?}' phase",
                status.ticket.pod_name(),
                status.phase
            ),
            self.clock.now(),
        ));
        outputs.extend(logs.outputs);

        Ok(ScriptStatusResponse {
            state: ProcessState::of(&status),
            exit_code: status.exit_code.unwrap_or(0),
            ticket: status.ticket,
            logs: outputs,
            next_log_sequence: logs.next_sequence,
        })
    }

    fn missing_pod_response(
        &self,
        ticket: &ScriptTicket,
        last_log_sequence: i64,
    ) -> ScriptStatusResponse {
        let now = self.clock.now();
        let logs = [
            format!(
                "The Script Pod '{}' could not be found. This is most likely due to the Script Pod being deleted.",
                ticket.pod_name()
            ),
            "Possible causes are:".to_string(),
            "- The Script Pod was evicted or terminated by Kubernetes".to_string(),
            "- The Script Pod was deleted before its result was collected".to_string(),
        ]
        .into_iter()
        .map(|text| ProcessOutput::new(ProcessOutputSource::StdErr, text, now))
        .collect();

        ScriptStatusResponse {
            ticket: ticket.clone(),
            state: ProcessState::Complete,
            exit_code: POD_NOT_FOUND_EXIT_CODE,
            logs,
            next_log_sequence: last_log_sequence,
        }
    }
}
