//! Script pod status tracker
//!
//! Keeps an in-memory map of every script pod's lifecycle state using the
//! list-then-watch protocol: a full list records a resource version, and a
//! watch from exactly that version applies changes incrementally. Whenever the
//! watch ends or fails the tracker relists, which also catches any delete the
//! watch missed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::logs::ScriptLogProvider;
use crate::pods::service::{PodService, PodWatchEvent};
use crate::pods::tracked::{PodStatus, TrackedScriptPod};
use crate::ticket::ScriptTicket;

type PodMap = HashMap<ScriptTicket, TrackedScriptPod>;
type PendingMap = HashMap<ScriptTicket, PendingPod>;

/// A pod we created, with the number of lists started before it was added.
struct PendingPod {
    lists_before: u64,
    pod: TrackedScriptPod,
}

/// Where the update loop is in the list-then-watch cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
enum WatchState {
    /// Relist every script pod before watching again.
    Resyncing,
    /// Apply changes that happened after `resource_version`.
    Watching { resource_version: String },
}

/// Authoritative view of every script pod's lifecycle state.
pub struct PodMonitor {
    pods: Arc<dyn PodService>,
    script_logs: Arc<ScriptLogProvider>,
    clock: Arc<dyn Clock>,
    /// Pods seen through list/watch.
    tracked: RwLock<PodMap>,
    /// Pods we created that list/watch may not have reported yet.
    pending: RwLock<PendingMap>,
    lists_started: AtomicU64,
    initial_load: watch::Sender<bool>,
}

impl PodMonitor {
    pub fn new(
        pods: Arc<dyn PodService>,
        script_logs: Arc<ScriptLogProvider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            pods,
            script_logs,
            clock,
            tracked: RwLock::new(HashMap::new()),
            pending: RwLock::new(HashMap::new()),
            lists_started: AtomicU64::new(0),
            initial_load: watch::Sender::new(false),
        }
    }

    /// Run the update loop until `cancel` fires.
    ///
    /// Returns an error when listing or opening a watch fails; the caller
    /// restarts the loop, which resumes from a fresh list.
    #[instrument(skip_all)]
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut state = WatchState::Resyncing;

        loop {
            state = match state {
                WatchState::Resyncing => {
                    let resource_version = tokio::select! {
                        () = cancel.cancelled() => return Ok(()),
                        listed = self.resync() => listed?,
                    };
                    WatchState::Watching { resource_version }
                }
                WatchState::Watching { resource_version } => {
                    self.watch_from(&resource_version, &cancel).await?;
                    if cancel.is_cancelled() {
                        return Ok(());
                    }
                    WatchState::Resyncing
                }
            };
        }
    }

    /// Replace the map with a fresh list, keeping existing entries' history.
    ///
    /// Pending pods registered before the list started are dropped: the list
    /// either reported them or they no longer exist.
    async fn resync(&self) -> Result<String> {
        let started = Instant::now();
        debug!("Loading script pod statuses");

        let generation = self.lists_started.fetch_add(1, Ordering::SeqCst) + 1;
        let list = self.pods.list_script_pods().await?;
        let now = self.clock.now();
        let count = list.items.len();

        {
            let mut tracked = write(&self.tracked);
            let mut previous = std::mem::take(&mut *tracked);
            for pod in &list.items {
                let Some(ticket) = ScriptTicket::from_pod(pod) else {
                    warn!(pod = %pod_name(pod), "Listed script pod has no ticket label, ignoring");
                    continue;
                };
                let mut entry = previous
                    .remove(&ticket)
                    .unwrap_or_else(|| TrackedScriptPod::new(ticket.clone(), now));
                entry.update(pod, now);
                tracked.insert(ticket, entry);
            }

            let mut pending = write(&self.pending);
            let before = pending.len();
            pending.retain(|ticket, entry| {
                !tracked.contains_key(ticket) && entry.lists_before >= generation
            });
            if pending.len() < before {
                debug!(dropped = before - pending.len(), "Dropped settled pending script pods");
            }
        }

        self.initial_load.send_replace(true);
        info!(
            count,
            resource_version = %list.resource_version,
            elapsed = ?started.elapsed(),
            "Loaded script pod statuses"
        );
        Ok(list.resource_version)
    }

    /// Apply watch events until the watch ends or `cancel` fires.
    async fn watch_from(&self, resource_version: &str, cancel: &CancellationToken) -> Result<()> {
        let mut events = self.pods.watch_script_pods(resource_version).await?;

        loop {
            let next = tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                next = events.next() => next,
            };

            match next {
                Some(Ok(event)) => self.apply(event),
                Some(Err(e)) => {
                    warn!(error = %e, resource_version, "Script pod watch failed, resyncing");
                    return Ok(());
                }
                None => {
                    debug!(resource_version, "Script pod watch closed, resyncing");
                    return Ok(());
                }
            }
        }
    }

    pub(crate) fn apply(&self, event: PodWatchEvent) {
        let now = self.clock.now();
        match event {
            PodWatchEvent::Added(pod) | PodWatchEvent::Modified(pod) => {
                let Some(ticket) = ScriptTicket::from_pod(&pod) else {
                    warn!(pod = %pod_name(&pod), "Watched script pod has no ticket label, ignoring");
                    return;
                };
                let mut tracked = write(&self.tracked);
                let entry = tracked
                    .entry(ticket.clone())
                    .or_insert_with(|| TrackedScriptPod::new(ticket, now));
                entry.update(&pod, now);
                debug!(pod = %pod_name(&pod), status = ?entry.status(), "Updated script pod status");
            }
            PodWatchEvent::Deleted(pod) => {
                let Some(ticket) = ScriptTicket::from_pod(&pod) else {
                    return;
                };
                write(&self.pending).remove(&ticket);
                if write(&self.tracked).remove(&ticket).is_some() {
                    debug!(pod = %pod_name(&pod), "Removed deleted script pod");
                } else {
                    warn!(pod = %pod_name(&pod), "Deleted script pod was not being tracked");
                }
            }
        }
    }

    #[must_use]
    pub fn get_status(&self, ticket: &ScriptTicket) -> Option<PodStatus> {
        if let Some(entry) = read(&self.tracked).get(ticket) {
            return Some(entry.status());
        }
        read(&self.pending).get(ticket).map(|entry| entry.pod.status())
    }

    /// Every tracked pod, ordered by ticket.
    #[must_use]
    pub fn get_all(&self) -> Vec<PodStatus> {
        let mut all: HashMap<ScriptTicket, PodStatus> = read(&self.pending)
            .iter()
            .map(|(ticket, entry)| (ticket.clone(), entry.pod.status()))
            .collect();
        all.extend(
            read(&self.tracked)
                .iter()
                .map(|(ticket, entry)| (ticket.clone(), entry.status())),
        );

        let mut all: Vec<PodStatus> = all.into_values().collect();
        all.sort_by(|a, b| a.ticket.cmp(&b.ticket));
        all
    }

    /// Force `ticket` into a terminal state. Returns false for unknown tickets.
    pub fn mark_as_completed(
        &self,
        ticket: &ScriptTicket,
        exit_code: i32,
        finished_at: DateTime<Utc>,
    ) -> bool {
        let marked = {
            let mut tracked = write(&self.tracked);
            if let Some(entry) = tracked.get_mut(ticket) {
                entry.mark_as_completed(exit_code, finished_at);
                true
            } else if let Some(entry) = write(&self.pending).get_mut(ticket) {
                entry.pod.mark_as_completed(exit_code, finished_at);
                true
            } else {
                false
            }
        };

        if marked {
            let message = format!("Marking '{ticket}' as completed with exit code: '{exit_code}'");
            self.script_logs.get_or_create(ticket).verbose(&message);
            debug!(ticket = %ticket, exit_code, "Marked script pod as completed");
        }
        marked
    }

    /// Track a pod we just created, before list/watch has reported it.
    pub fn add_pending_pod(&self, ticket: &ScriptTicket, pod: &Pod) {
        let now = self.clock.now();
        let mut entry = TrackedScriptPod::new(ticket.clone(), now);
        entry.update(pod, now);
        let lists_before = self.lists_started.load(Ordering::SeqCst);
        write(&self.pending)
            .entry(ticket.clone())
            .or_insert(PendingPod {
                lists_before,
                pod: entry,
            });
    }

    /// Drop the pending entry for `ticket`. Listed pods stay until deleted.
    pub fn forget(&self, ticket: &ScriptTicket) {
        if write(&self.pending).remove(ticket).is_some() {
            debug!(ticket = %ticket, "Forgot pending script pod");
        }
    }

    #[must_use]
    pub fn is_initial_load_complete(&self) -> bool {
        *self.initial_load.borrow()
    }

    /// Wait until the first full list has been applied.
    pub async fn wait_for_initial_load(&self, timeout: Duration) -> Result<()> {
        let mut loaded = self.initial_load.subscribe();
        let waited = tokio::time::timeout(timeout, loaded.wait_for(|done| *done)).await;
        match waited {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) | Err(_) => Err(Error::InitialLoadTimeout),
        }
    }
}

fn pod_name(pod: &Pod) -> &str {
    pod.metadata.name.as_deref().unwrap_or("<unnamed>")
}

fn read<T>(map: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    map.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(map: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    map.write().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::pods::tracked::PodState;
    use crate::testing::{script_pod, FakePodService};
    use chrono::TimeZone;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn monitor(fake: &Arc<FakePodService>) -> Arc<PodMonitor> {
        let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(start()));
        Arc::new(PodMonitor::new(
            fake.clone(),
            Arc::new(ScriptLogProvider::new(clock.clone())),
            clock,
        ))
    }

    #[tokio::test]
    async fn resync_loads_listed_pods() {
        let fake = Arc::new(FakePodService::default());
        let a = ScriptTicket::new("a");
        let b = ScriptTicket::new("b");
        fake.set_pods(vec![
            script_pod(&a, "Running", None),
            script_pod(&b, "Succeeded", Some((0, start()))),
        ]);

        let monitor = monitor(&fake);
        assert!(!monitor.is_initial_load_complete());
        monitor.resync().await.unwrap();

        assert!(monitor.is_initial_load_complete());
        assert_eq!(monitor.get_status(&a).unwrap().state, PodState::Running);
        assert_eq!(monitor.get_status(&b).unwrap().state, PodState::Succeeded);
        assert_eq!(monitor.get_all().len(), 2);
    }

    #[tokio::test]
    async fn resync_keeps_history_and_drops_vanished_pods() {
        let fake = Arc::new(FakePodService::default());
        let a = ScriptTicket::new("a");
        let b = ScriptTicket::new("b");
        let finished = start() - chrono::Duration::minutes(5);
        fake.set_pods(vec![
            script_pod(&a, "Succeeded", Some((0, finished))),
            script_pod(&b, "Running", None),
        ]);

        let monitor = monitor(&fake);
        monitor.resync().await.unwrap();

        fake.set_pods(vec![script_pod(&a, "Succeeded", Some((0, finished)))]);
        monitor.resync().await.unwrap();

        assert_eq!(monitor.get_status(&a).unwrap().last_updated, finished);
        assert!(monitor.get_status(&b).is_none());
    }

    #[tokio::test]
    async fn watch_converges_to_a_fresh_list() {
        let fake = Arc::new(FakePodService::default());
        let tickets: Vec<_> = ["a", "b", "c", "d"].into_iter().map(ScriptTicket::new).collect();
        fake.set_pods(vec![script_pod(&tickets[0], "Running", None)]);

        let watched = monitor(&fake);
        watched.resync().await.unwrap();

        let events = [
            PodWatchEvent::Added(script_pod(&tickets[1], "Pending", None)),
            PodWatchEvent::Modified(script_pod(&tickets[0], "Succeeded", Some((0, start())))),
            PodWatchEvent::Added(script_pod(&tickets[2], "Running", None)),
            PodWatchEvent::Modified(script_pod(&tickets[1], "Failed", Some((3, start())))),
            PodWatchEvent::Deleted(script_pod(&tickets[2], "Running", None)),
            PodWatchEvent::Added(script_pod(&tickets[3], "Running", None)),
        ];
        for event in events {
            fake.apply(&event);
            watched.apply(event);
        }

        let relisted = monitor(&fake);
        relisted.resync().await.unwrap();

        assert_eq!(watched.get_all(), relisted.get_all());
    }

    #[tokio::test]
    async fn run_applies_watch_events_and_relists_when_the_watch_ends() {
        let fake = Arc::new(FakePodService::default());
        let a = ScriptTicket::new("a");
        fake.set_pods(vec![script_pod(&a, "Running", None)]);
        fake.push_watch(vec![Ok(PodWatchEvent::Modified(script_pod(
            &a,
            "Succeeded",
            Some((0, start())),
        )))]);

        let monitor = monitor(&fake);
        let cancel = CancellationToken::new();
        let runner = {
            let monitor = monitor.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { monitor.run(cancel).await })
        };

        monitor
            .wait_for_initial_load(Duration::from_secs(5))
            .await
            .unwrap();
        for _ in 0..100 {
            if fake.list_calls() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(fake.list_calls() >= 2, "watch end should trigger a relist");
        assert_eq!(monitor.get_status(&a).unwrap().state, PodState::Succeeded);

        cancel.cancel();
        runner.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn pending_pods_are_visible_until_deleted() {
        let fake = Arc::new(FakePodService::default());
        let monitor = monitor(&fake);
        let ticket = ScriptTicket::new("new");
        let pod = script_pod(&ticket, "Pending", None);

        monitor.add_pending_pod(&ticket, &pod);
        assert_eq!(monitor.get_status(&ticket).unwrap().state, PodState::Running);
        assert_eq!(monitor.get_all().len(), 1);

        monitor.apply(PodWatchEvent::Deleted(pod));
        assert!(monitor.get_status(&ticket).is_none());
    }

    #[tokio::test]
    async fn relist_drops_pending_pods_that_no_longer_exist() {
        let fake = Arc::new(FakePodService::default());
        let monitor = monitor(&fake);
        let created = ScriptTicket::new("created");
        let vanished = ScriptTicket::new("vanished");
        monitor.add_pending_pod(&created, &script_pod(&created, "Pending", None));
        monitor.add_pending_pod(&vanished, &script_pod(&vanished, "Pending", None));

        fake.set_pods(vec![script_pod(&created, "Running", None)]);
        monitor.resync().await.unwrap();

        assert_eq!(monitor.get_status(&created).unwrap().state, PodState::Running);
        assert!(monitor.get_status(&vanished).is_none());
        assert_eq!(monitor.get_all().len(), 1);

        // Registered after the last list started, so kept until the next one.
        let late = ScriptTicket::new("late");
        monitor.add_pending_pod(&late, &script_pod(&late, "Pending", None));
        assert!(monitor.get_status(&late).is_some());
        monitor.resync().await.unwrap();
        assert!(monitor.get_status(&late).is_none());
    }

    #[tokio::test]
    async fn forget_drops_a_pending_pod() {
        let fake = Arc::new(FakePodService::default());
        let monitor = monitor(&fake);
        let ticket = ScriptTicket::new("acknowledged");
        monitor.add_pending_pod(&ticket, &script_pod(&ticket, "Pending", None));

        monitor.forget(&ticket);
        assert!(monitor.get_status(&ticket).is_none());
    }

    #[tokio::test]
    async fn mark_as_completed_writes_to_the_script_log() {
        let fake = Arc::new(FakePodService::default());
        let monitor = monitor(&fake);
        let ticket = ScriptTicket::new("a");

        assert!(!monitor.mark_as_completed(&ticket, 0, start()));

        monitor.apply(PodWatchEvent::Added(script_pod(&ticket, "Running", None)));
        assert!(monitor.mark_as_completed(&ticket, 137, start()));

        let status = monitor.get_status(&ticket).unwrap();
        assert_eq!(status.state, PodState::Failed);
        assert_eq!(status.exit_code, Some(137));

        let logged = monitor.script_logs.get_or_create(&ticket).pop_logs();
        assert!(logged[0].text.contains("exit code: '137'"));
    }

    #[tokio::test(start_paused = true)]
    async fn initial_load_wait_times_out() {
        let fake = Arc::new(FakePodService::default());
        let monitor = monitor(&fake);
        assert!(matches!(
            monitor.wait_for_initial_load(Duration::from_secs(1)).await,
            Err(Error::InitialLoadTimeout)
        ));
    }
}
