//! Script tickets and the pod naming derived from them.

use std::fmt;

use k8s_openapi::api::core::v1::Pod;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

/// Label selecting every pod this agent manages
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
/// Value of [`LABEL_MANAGED_BY`] on script pods
pub const MANAGED_BY_VALUE: &str = "script-pod-agent";
/// Label carrying the script ticket on each pod
pub const LABEL_SCRIPT_TICKET: &str = "scripts.cto.dev/ticket";

const MAX_DNS_LABEL_LENGTH: usize = 63;
const POD_NAME_PREFIX: &str = "script-";
const MAX_TICKET_SEGMENT_LENGTH: usize = 40;
const HASH_SUFFIX_LENGTH: usize = 10;

/// Opaque identifier of one script execution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScriptTicket(String);

impl ScriptTicket {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the pod (and of its script container) running this ticket.
    ///
    /// Format: `script-{sanitised ticket}-{sha1 prefix}`. The hash keeps two
    /// tickets that sanitise to the same text apart, and the result is always a
    /// valid DNS-1123 label.
    #[must_use]
    pub fn pod_name(&self) -> String {
        let sanitised: String = self
            .0
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_lowercase()
                } else {
                    '-'
                }
            })
            .collect();
        let segment: String = sanitised
            .trim_matches('-')
            .chars()
            .take(MAX_TICKET_SEGMENT_LENGTH)
            .collect();
        let segment = segment.trim_end_matches('-');

        let digest = hex::encode(Sha1::digest(self.0.as_bytes()));
        let hash = &digest[..HASH_SUFFIX_LENGTH];

        let name = if segment.is_empty() {
            format!("{POD_NAME_PREFIX}{hash}")
        } else {
            format!("{POD_NAME_PREFIX}{segment}-{hash}")
        };
        debug_assert!(name.len() <= MAX_DNS_LABEL_LENGTH);
        name
    }

    /// Ticket a pod belongs to, read from its labels.
    #[must_use]
    pub fn from_pod(pod: &Pod) -> Option<Self> {
        pod.metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(LABEL_SCRIPT_TICKET))
            .filter(|value| !value.is_empty())
            .map(|value| Self::new(value.clone()))
    }
}

impl fmt::Display for ScriptTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ScriptTicket {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Label selector matching all script pods.
#[must_use]
pub fn script_pod_selector() -> String {
    format!("{LABEL_MANAGED_BY}={MANAGED_BY_VALUE}")
}
