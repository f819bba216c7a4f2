//! Exactly-once log retrieval for a script.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, instrument, warn};

use crate::clock::Clock;
use crate::config::AgentConfig;
use crate::error::{Error, Result};
use crate::logs::events::translate_events;
use crate::logs::keys::EncryptionKeyProvider;
use crate::logs::reader::{read_pod_logs, LogPosition, PodLogs};
use crate::logs::sink::{ScriptLog, ScriptLogProvider};
use crate::logs::ProcessOutput;
use crate::pods::{PodMonitor, PodService};
use crate::supervisor::{retry_transient, TRANSIENT_ATTEMPTS};
use crate::ticket::ScriptTicket;
use crate::watermark::SinceTimeStore;

/// One poll's worth of output for a script.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptLogs {
    /// Pod log lines, pod events and agent messages, ordered by time.
    pub outputs: Vec<ProcessOutput>,
    pub next_sequence: i64,
    /// Exit code from the end-of-stream line, when it was part of this batch.
    pub exit_code: Option<i32>,
}

pub struct PodLogService {
    config: Arc<AgentConfig>,
    pods: Arc<dyn PodService>,
    monitor: Arc<PodMonitor>,
    script_logs: Arc<ScriptLogProvider>,
    watermarks: Arc<SinceTimeStore>,
    keys: Arc<EncryptionKeyProvider>,
    clock: Arc<dyn Clock>,
}

impl PodLogService {
    pub fn new(
        config: Arc<AgentConfig>,
        pods: Arc<dyn PodService>,
        monitor: Arc<PodMonitor>,
        script_logs: Arc<ScriptLogProvider>,
        watermarks: Arc<SinceTimeStore>,
        keys: Arc<EncryptionKeyProvider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            pods,
            monitor,
            script_logs,
            watermarks,
            keys,
            clock,
        }
    }

    /// Everything new for `ticket` since `last_sequence`.
    ///
    /// Calling again with the same `last_sequence` never repeats a pod log
    /// line, including unparseable ones. Errors are only returned for
    /// Kubernetes or disk failures that outlast a few retries; protocol and key
    /// problems degrade to a warning in the script log.
    #[instrument(skip(self), fields(ticket = %ticket))]
    pub async fn get_logs(&self, ticket: &ScriptTicket, last_sequence: i64) -> Result<ScriptLogs> {
        let script_log = self.script_logs.get_or_create(ticket);
        let pod_name = ticket.pod_name();

        let (pod_logs, event_lines) = tokio::join!(
            self.new_pod_lines(ticket, &pod_name, last_sequence, &script_log),
            self.new_event_lines(ticket, &pod_name),
        );
        let pod_logs = pod_logs?;

        if let Some(latest) = pod_logs.latest_occurred {
            if let Err(e) = self.watermarks.update_pod_logs_since_time(ticket, latest).await {
                warn!(error = %e, "Failed to persist pod logs watermark");
            }
        }
        if let Some(exit_code) = pod_logs.exit_code {
            self.monitor
                .mark_as_completed(ticket, exit_code, self.clock.now());
        }

        // Popped after the pod read so nothing written meanwhile is lost.
        let mut outputs = pod_logs.outputs;
        outputs.extend(script_log.pop_logs());
        outputs.extend(event_lines);
        outputs.sort_by_key(|output| output.occurred);

        Ok(ScriptLogs {
            outputs,
            next_sequence: pod_logs.next_sequence,
            exit_code: pod_logs.exit_code,
        })
    }

    async fn new_pod_lines(
        &self,
        ticket: &ScriptTicket,
        pod_name: &str,
        last_sequence: i64,
        script_log: &ScriptLog,
    ) -> Result<PodLogs> {
        let since = self.watermarks.pod_logs_since_time(ticket).await;
        let from = LogPosition {
            sequence: last_sequence,
            invalid_after: self
                .watermarks
                .invalid_lines_delivered_after(ticket, last_sequence)
                .await,
        };

        let result = match self.read_since(ticket, pod_name, from, since).await {
            Err(e @ Error::UnexpectedLogLineNumber { .. }) => {
                let message = format!(
                    "Unexpected Pod log line numbers found with sinceTime='{}', loading all logs",
                    since.map_or_else(|| "none".to_string(), |s| s.to_rfc3339())
                );
                script_log.verbose(&message);
                warn!(error = %e, "{message}");
                self.read_since(ticket, pod_name, from, None).await
            }
            other => other,
        };

        let unchanged = PodLogs {
            next_sequence: from.sequence,
            invalid_after: from.invalid_after,
            ..PodLogs::default()
        };
        match result {
            Ok(logs) => {
                if logs.invalid_after > 0 && logs.position() != from {
                    if let Err(e) = self
                        .watermarks
                        .record_invalid_lines_delivered(ticket, logs.next_sequence, logs.invalid_after)
                        .await
                    {
                        warn!(error = %e, "Failed to persist delivered invalid log lines");
                    }
                }
                Ok(logs)
            }
            Err(e @ Error::UnexpectedLogLineNumber { .. }) => {
                let message =
                    "Pod log line numbers are out of order even in the full log. No new pod logs will be read.";
                script_log.warning(message);
                warn!(error = %e, "{message}");
                Ok(unchanged)
            }
            Err(e @ Error::EncryptionKey(_)) => {
                let message = "Failed to read pod log encryption key. No new pod logs will be read.";
                script_log.warning(message);
                warn!(error = %e, "{message}");
                Ok(unchanged)
            }
            Err(e) => Err(e),
        }
    }

    async fn read_since(
        &self,
        ticket: &ScriptTicket,
        pod_name: &str,
        from: LogPosition,
        since: Option<DateTime<Utc>>,
    ) -> Result<PodLogs> {
        let raw = retry_transient("read pod logs", TRANSIENT_ATTEMPTS, || {
            self.pods.read_logs(pod_name, since)
        })
        .await?;
        let Some(raw) = raw else {
            debug!(pod = pod_name, "Pod logs not available yet");
            return Ok(PodLogs {
                next_sequence: from.sequence,
                invalid_after: from.invalid_after,
                ..PodLogs::default()
            });
        };

        let cipher = if self.config.log_encryption {
            Some(self.keys.cipher(ticket).await?)
        } else {
            None
        };

        read_pod_logs(raw.lines(), from, cipher.as_ref(), self.clock.now())
    }

    async fn new_event_lines(&self, ticket: &ScriptTicket, pod_name: &str) -> Vec<ProcessOutput> {
        if self.config.disable_pod_events_in_task_log {
            return Vec::new();
        }

        let events = match self.pods.list_pod_events(pod_name).await {
            Ok(events) => events,
            Err(e) => {
                warn!(pod = pod_name, error = %e, "Failed to list pod events");
                return Vec::new();
            }
        };

        let since = self.watermarks.pod_events_since_time(ticket).await;
        let lines = translate_events(&events, since);
        if let Some(latest) = lines.latest {
            if let Err(e) = self.watermarks.update_pod_events_since_time(ticket, latest).await {
                warn!(pod = pod_name, error = %e, "Failed to persist pod events watermark");
            }
        }
        lines.outputs
    }
}
