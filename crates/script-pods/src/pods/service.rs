//! Kubernetes access for script pods.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt};
use k8s_openapi::api::core::v1::{Event, Pod};
use kube::api::{Api, DeleteParams, ListParams, LogParams, WatchEvent, WatchParams};
use kube::Client;
use tracing::{debug, info, instrument};

use crate::config::AgentConfig;
use crate::error::{Error, Result};
use crate::ticket::{script_pod_selector, ScriptTicket};

/// Snapshot of every script pod plus the resource version it was taken at.
#[derive(Debug, Clone, Default)]
pub struct PodList {
    pub items: Vec<Pod>,
    pub resource_version: String,
}

/// Change to one script pod, as delivered by a watch.
#[derive(Debug, Clone)]
pub enum PodWatchEvent {
    Added(Pod),
    Modified(Pod),
    Deleted(Pod),
}

pub type PodWatchStream = BoxStream<'static, Result<PodWatchEvent>>;

/// Operations on script pods the agent depends on.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PodService: Send + Sync {
    async fn list_script_pods(&self) -> Result<PodList>;

    /// Changes after `resource_version`. The stream ends when the server
    /// closes the watch; an expired resource version surfaces as an error item.
    async fn watch_script_pods(&self, resource_version: &str) -> Result<PodWatchStream>;

    /// Raw log of the pod's script container, or `None` while the container
    /// has not started.
    async fn read_logs(
        &self,
        pod_name: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Option<String>>;

    async fn list_pod_events(&self, pod_name: &str) -> Result<Vec<Event>>;

    /// Delete the pod for `ticket`. A pod that is already gone is not an error.
    async fn delete_if_exists(&self, ticket: &ScriptTicket) -> Result<()>;
}

/// [`PodService`] backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubePodService {
    pods: Api<Pod>,
    events: Api<Event>,
    watch_timeout: Duration,
}

impl KubePodService {
    #[must_use]
    pub fn new(client: Client, config: &AgentConfig) -> Self {
        Self {
            pods: Api::namespaced(client.clone(), &config.namespace),
            events: Api::namespaced(client, &config.namespace),
            watch_timeout: config.effective_watch_timeout(),
        }
    }
}

#[async_trait]
impl PodService for KubePodService {
    #[instrument(skip(self))]
    async fn list_script_pods(&self) -> Result<PodList> {
        let list = self
            .pods
            .list(&ListParams::default().labels(&script_pod_selector()))
            .await?;

        Ok(PodList {
            resource_version: list.metadata.resource_version.unwrap_or_default(),
            items: list.items,
        })
    }

    #[instrument(skip(self))]
    async fn watch_script_pods(&self, resource_version: &str) -> Result<PodWatchStream> {
        let timeout_secs = u32::try_from(self.watch_timeout.as_secs()).unwrap_or(u32::MAX);
        let params = WatchParams::default()
            .labels(&script_pod_selector())
            .timeout(timeout_secs);

        let stream = self.pods.watch(&params, resource_version).await?;
        debug!(resource_version, timeout_secs, "Opened script pod watch");

        Ok(stream
            .filter_map(|event| async move {
                match event {
                    Ok(WatchEvent::Added(pod)) => Some(Ok(PodWatchEvent::Added(pod))),
                    Ok(WatchEvent::Modified(pod)) => Some(Ok(PodWatchEvent::Modified(pod))),
                    Ok(WatchEvent::Deleted(pod)) => Some(Ok(PodWatchEvent::Deleted(pod))),
                    Ok(WatchEvent::Bookmark(_)) => None,
                    Ok(WatchEvent::Error(status)) => Some(Err(Error::Watch(format!(
                        "{} ({}): {}",
                        status.reason, status.code, status.message
                    )))),
                    Err(e) => Some(Err(e.into())),
                }
            })
            .boxed())
    }

    #[instrument(skip(self))]
    async fn read_logs(
        &self,
        pod_name: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Option<String>> {
        let params = LogParams {
            container: Some(pod_name.to_string()),
            since_time: since,
            ..LogParams::default()
        };

        match self.pods.logs(pod_name, &params).await {
            Ok(logs) => Ok(Some(logs)),
            // The container has not started yet
            Err(kube::Error::Api(ae)) if ae.code == 404 || ae.code == 400 => {
                debug!(pod = pod_name, code = ae.code, "Pod logs not available yet");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self))]
    async fn list_pod_events(&self, pod_name: &str) -> Result<Vec<Event>> {
        let params = ListParams::default().fields(&format!("involvedObject.name={pod_name}"));
        Ok(self.events.list(&params).await?.items)
    }

    #[instrument(skip(self), fields(ticket = %ticket))]
    async fn delete_if_exists(&self, ticket: &ScriptTicket) -> Result<()> {
        let pod_name = ticket.pod_name();
        match self.pods.delete(&pod_name, &DeleteParams::background()).await {
            Ok(_) => {
                info!(pod = %pod_name, "Deleted script pod");
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(pod = %pod_name, "Script pod already deleted");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
