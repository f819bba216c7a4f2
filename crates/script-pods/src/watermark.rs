//! Durable "read up to here" markers per script
//!
//! Two independent cursors are kept per ticket: one for pod logs and one for
//! pod events. Reads check memory first, then the script's workspace, and cache
//! what they find. Writes update memory immediately and persist to the
//! workspace under that workspace's lock.
//!
//! Unparseable log lines have no line number, so the store also remembers how
//! many of them were delivered after the last numbered line.

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::error::Result;
use crate::ticket::ScriptTicket;
use crate::workspace::ScriptWorkspaceFactory;

const POD_LOGS_SINCE_TIME_FILE: &str = "podLogsSinceTime";
const POD_EVENTS_SINCE_TIME_FILE: &str = "podEventsSinceTime";
const POD_LOGS_INVALID_LINES_FILE: &str = "podLogsInvalidLines";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cursor {
    PodLogs,
    PodEvents,
}

impl Cursor {
    fn file_name(self) -> &'static str {
        match self {
            Self::PodLogs => POD_LOGS_SINCE_TIME_FILE,
            Self::PodEvents => POD_EVENTS_SINCE_TIME_FILE,
        }
    }
}

/// Per-script since-time watermarks, cached in memory and persisted to disk.
#[derive(Debug)]
pub struct SinceTimeStore {
    workspaces: Arc<ScriptWorkspaceFactory>,
    pod_logs: DashMap<ScriptTicket, DateTime<Utc>>,
    pod_events: DashMap<ScriptTicket, DateTime<Utc>>,
    /// `(sequence, count)`: invalid lines delivered after line `sequence`.
    invalid_lines: DashMap<ScriptTicket, (i64, usize)>,
}

impl SinceTimeStore {
    #[must_use]
    pub fn new(workspaces: Arc<ScriptWorkspaceFactory>) -> Self {
        Self {
            workspaces,
            pod_logs: DashMap::new(),
            pod_events: DashMap::new(),
            invalid_lines: DashMap::new(),
        }
    }

    pub async fn pod_logs_since_time(&self, ticket: &ScriptTicket) -> Option<DateTime<Utc>> {
        self.get(Cursor::PodLogs, ticket).await
    }

    pub async fn update_pod_logs_since_time(
        &self,
        ticket: &ScriptTicket,
        since: DateTime<Utc>,
    ) -> Result<()> {
        self.update(Cursor::PodLogs, ticket, since).await
    }

    pub async fn pod_events_since_time(&self, ticket: &ScriptTicket) -> Option<DateTime<Utc>> {
        self.get(Cursor::PodEvents, ticket).await
    }

    pub async fn update_pod_events_since_time(
        &self,
        ticket: &ScriptTicket,
        since: DateTime<Utc>,
    ) -> Result<()> {
        self.update(Cursor::PodEvents, ticket, since).await
    }

    /// How many unparseable lines following line `sequence` were delivered.
    pub async fn invalid_lines_delivered_after(&self, ticket: &ScriptTicket, sequence: i64) -> usize {
        let mark = match self.invalid_lines.get(ticket) {
            Some(mark) => Some(*mark),
            None => self.load_invalid_lines(ticket).await,
        };
        match mark {
            Some((marked, count)) if marked == sequence => count,
            _ => 0,
        }
    }

    pub async fn record_invalid_lines_delivered(
        &self,
        ticket: &ScriptTicket,
        sequence: i64,
        count: usize,
    ) -> Result<()> {
        self.invalid_lines.insert(ticket.clone(), (sequence, count));
        self.workspaces
            .workspace(ticket)
            .write_file(POD_LOGS_INVALID_LINES_FILE, &format!("{sequence} {count}"))
            .await
    }

    /// Forget every cursor for `ticket`, in memory and on disk.
    pub async fn delete(&self, ticket: &ScriptTicket) -> Result<()> {
        self.pod_logs.remove(ticket);
        self.pod_events.remove(ticket);
        self.invalid_lines.remove(ticket);

        let workspace = self.workspaces.workspace(ticket);
        workspace.delete_file(POD_LOGS_SINCE_TIME_FILE).await?;
        workspace.delete_file(POD_EVENTS_SINCE_TIME_FILE).await?;
        workspace.delete_file(POD_LOGS_INVALID_LINES_FILE).await?;
        Ok(())
    }

    async fn load_invalid_lines(&self, ticket: &ScriptTicket) -> Option<(i64, usize)> {
        let workspace = self.workspaces.workspace(ticket);
        let contents = match workspace.try_read_file(POD_LOGS_INVALID_LINES_FILE).await {
            Ok(contents) => contents?,
            Err(e) => {
                warn!(ticket = %ticket, error = %e, "Failed to read invalid line marker");
                return None;
            }
        };

        let mut parts = contents.split_whitespace();
        let parsed = match (parts.next(), parts.next()) {
            (Some(sequence), Some(count)) => sequence.parse().ok().zip(count.parse().ok()),
            _ => None,
        };
        match parsed {
            Some(mark) => Some(*self.invalid_lines.entry(ticket.clone()).or_insert(mark)),
            None => {
                warn!(ticket = %ticket, "Ignoring malformed invalid line marker");
                None
            }
        }
    }

    fn cache(&self, cursor: Cursor) -> &DashMap<ScriptTicket, DateTime<Utc>> {
        match cursor {
            Cursor::PodLogs => &self.pod_logs,
            Cursor::PodEvents => &self.pod_events,
        }
    }

    async fn get(&self, cursor: Cursor, ticket: &ScriptTicket) -> Option<DateTime<Utc>> {
        if let Some(since) = self.cache(cursor).get(ticket) {
            return Some(*since);
        }

        let workspace = self.workspaces.workspace(ticket);
        let contents = match workspace.try_read_file(cursor.file_name()).await {
            Ok(contents) => contents?,
            Err(e) => {
                warn!(ticket = %ticket, error = %e, "Failed to read {} watermark", cursor.file_name());
                return None;
            }
        };

        match DateTime::parse_from_rfc3339(contents.trim()) {
            Ok(parsed) => {
                // A concurrent update may have landed while we were reading; keep the newer.
                Some(self.merge(cursor, ticket, parsed.with_timezone(&Utc)))
            }
            Err(e) => {
                warn!(
                    ticket = %ticket,
                    error = %e,
                    "Ignoring malformed {} watermark", cursor.file_name()
                );
                None
            }
        }
    }

    /// Raise the cached cursor to at least `since` and return the cached value.
    fn merge(&self, cursor: Cursor, ticket: &ScriptTicket, since: DateTime<Utc>) -> DateTime<Utc> {
        let mut entry = self.cache(cursor).entry(ticket.clone()).or_insert(since);
        if *entry < since {
            *entry = since;
        }
        *entry
    }

    async fn update(
        &self,
        cursor: Cursor,
        ticket: &ScriptTicket,
        since: DateTime<Utc>,
    ) -> Result<()> {
        // Watermarks never move backwards.
        if self.cache(cursor).get(ticket).is_some_and(|cached| *cached >= since) {
            return Ok(());
        }

        // Compare against the file and write under one lock hold, so a slower
        // writer with an older value cannot overwrite a newer one.
        let mut newer_on_disk = None;
        let written = self
            .workspaces
            .workspace(ticket)
            .update_file(cursor.file_name(), |current| {
                let on_disk = current
                    .and_then(|contents| DateTime::parse_from_rfc3339(contents.trim()).ok())
                    .map(|parsed| parsed.with_timezone(&Utc));
                match on_disk {
                    Some(on_disk) if on_disk >= since => {
                        newer_on_disk = Some(on_disk);
                        None
                    }
                    _ => Some(since.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
                }
            })
            .await?;

        if written {
            debug!(ticket = %ticket, since = %since, "Persisted {} watermark", cursor.file_name());
        }
        self.merge(cursor, ticket, newer_on_disk.unwrap_or(since));
        Ok(())
    }
}
