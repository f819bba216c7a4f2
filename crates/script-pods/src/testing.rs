//! In-memory stand-ins for the Kubernetes API used across unit tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures::stream::{self, StreamExt};
use k8s_openapi::api::core::v1::{
    ContainerState, ContainerStateTerminated, ContainerStatus, Event, Pod, PodStatus as K8sPodStatus,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};

use crate::error::{Error, Result};
use crate::pods::service::{PodList, PodService, PodWatchEvent, PodWatchStream};
use crate::ticket::{ScriptTicket, LABEL_MANAGED_BY, LABEL_SCRIPT_TICKET, MANAGED_BY_VALUE};

/// Creation time of every pod built by [`script_pod`].
pub(crate) fn pod_created_at() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 11, 0, 0).unwrap()
}

/// A script pod in `phase`, optionally with a terminated script container.
pub(crate) fn script_pod(
    ticket: &ScriptTicket,
    phase: &str,
    terminated: Option<(i32, DateTime<Utc>)>,
) -> Pod {
    let pod_name = ticket.pod_name();
    let container_statuses = terminated.map(|(exit_code, finished_at)| {
        vec![ContainerStatus {
            name: pod_name.clone(),
            state: Some(ContainerState {
                terminated: Some(ContainerStateTerminated {
                    exit_code,
                    finished_at: Some(Time(finished_at)),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }]
    });

    Pod {
        metadata: ObjectMeta {
            name: Some(pod_name),
            creation_timestamp: Some(Time(pod_created_at())),
            labels: Some(BTreeMap::from([
                (LABEL_MANAGED_BY.to_string(), MANAGED_BY_VALUE.to_string()),
                (LABEL_SCRIPT_TICKET.to_string(), ticket.to_string()),
            ])),
            ..Default::default()
        },
        status: Some(K8sPodStatus {
            phase: Some(phase.to_string()),
            container_statuses,
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[derive(Default)]
struct FakeState {
    pods: Vec<Pod>,
    resource_version: u64,
    watches: VecDeque<Vec<Result<PodWatchEvent>>>,
    logs: HashMap<String, String>,
    logs_since_override: HashMap<String, String>,
    log_requests: Vec<Option<DateTime<Utc>>>,
    failing_log_reads: usize,
    events: HashMap<String, Vec<Event>>,
    deleted: Vec<ScriptTicket>,
}

/// Scriptable [`PodService`]: tests set the pods, logs and events it serves.
///
/// Queued watches are served in order; once they run out a watch never yields.
#[derive(Default)]
pub(crate) struct FakePodService {
    state: Mutex<FakeState>,
    list_calls: AtomicUsize,
}

impl FakePodService {
    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub(crate) fn set_pods(&self, pods: Vec<Pod>) {
        let mut state = self.state();
        state.pods = pods;
        state.resource_version += 1;
    }

    /// Mirror a watch event in the listed pods.
    pub(crate) fn apply(&self, event: &PodWatchEvent) {
        let mut state = self.state();
        state.resource_version += 1;
        match event {
            PodWatchEvent::Added(pod) | PodWatchEvent::Modified(pod) => {
                let name = pod.metadata.name.clone();
                state.pods.retain(|p| p.metadata.name != name);
                state.pods.push(pod.clone());
            }
            PodWatchEvent::Deleted(pod) => {
                state.pods.retain(|p| p.metadata.name != pod.metadata.name);
            }
        }
    }

    pub(crate) fn push_watch(&self, events: Vec<Result<PodWatchEvent>>) {
        self.state().watches.push_back(events);
    }

    /// Serve `content` as the whole log of `pod_name`. Fetches with a since
    /// time only return lines stamped at or after it.
    pub(crate) fn set_logs(&self, pod_name: &str, content: &str) {
        self.state()
            .logs
            .insert(pod_name.to_string(), content.to_string());
    }

    /// Serve `content` for every fetch of `pod_name` that has a since time.
    pub(crate) fn set_logs_since_override(&self, pod_name: &str, content: &str) {
        self.state()
            .logs_since_override
            .insert(pod_name.to_string(), content.to_string());
    }

    /// Fail the next `count` log reads with a transient error.
    pub(crate) fn fail_next_log_reads(&self, count: usize) {
        self.state().failing_log_reads = count;
    }

    pub(crate) fn log_requests(&self) -> Vec<Option<DateTime<Utc>>> {
        self.state().log_requests.clone()
    }

    pub(crate) fn set_events(&self, pod_name: &str, events: Vec<Event>) {
        self.state().events.insert(pod_name.to_string(), events);
    }

    pub(crate) fn deleted(&self) -> Vec<ScriptTicket> {
        self.state().deleted.clone()
    }

    pub(crate) fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PodService for FakePodService {
    async fn list_script_pods(&self) -> Result<PodList> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state();
        Ok(PodList {
            items: state.pods.clone(),
            resource_version: state.resource_version.to_string(),
        })
    }

    async fn watch_script_pods(&self, _resource_version: &str) -> Result<PodWatchStream> {
        match self.state().watches.pop_front() {
            Some(events) => Ok(stream::iter(events).boxed()),
            None => Ok(stream::pending().boxed()),
        }
    }

    async fn read_logs(
        &self,
        pod_name: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Option<String>> {
        let mut state = self.state();
        state.log_requests.push(since);
        if state.failing_log_reads > 0 {
            state.failing_log_reads -= 1;
            return Err(Error::Watch("connection reset by peer".to_string()));
        }

        let Some(since) = since else {
            return Ok(state.logs.get(pod_name).cloned());
        };
        if let Some(content) = state.logs_since_override.get(pod_name) {
            return Ok(Some(content.clone()));
        }

        Ok(state.logs.get(pod_name).map(|content| {
            content
                .lines()
                .filter(|line| {
                    line.split('|')
                        .nth(1)
                        .and_then(|ts| DateTime::parse_from_rfc3339(ts.trim()).ok())
                        .map_or(true, |ts| ts >= since)
                })
                .collect::<Vec<_>>()
                .join("\n")
        }))
    }

    async fn list_pod_events(&self, pod_name: &str) -> Result<Vec<Event>> {
        Ok(self
            .state()
            .events
            .get(pod_name)
            .cloned()
            .unwrap_or_default())
    }

    async fn delete_if_exists(&self, ticket: &ScriptTicket) -> Result<()> {
        let mut state = self.state();
        let pod_name = ticket.pod_name();
        state
            .pods
            .retain(|p| p.metadata.name.as_deref() != Some(pod_name.as_str()));
        state.deleted.push(ticket.clone());
        Ok(())
    }
}
