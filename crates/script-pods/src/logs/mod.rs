//! Script log protocol
//!
//! Script pods write numbered, optionally encrypted lines to stdout. This
//! module parses and orders those lines, merges them with pod events and with
//! the agent's own per-script messages, and tracks how far each script has
//! been read.

pub mod cipher;
pub mod events;
pub mod keys;
pub mod line;
pub mod reader;
pub mod service;
pub mod sink;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use cipher::LogCipher;
pub use keys::EncryptionKeyProvider;
pub use line::{LogLine, ParseResult};
pub use reader::{read_pod_logs, LogPosition, PodLogs};
pub use service::{PodLogService, ScriptLogs};
pub use sink::{ScriptLog, ScriptLogProvider};

/// Stream a script output line was written to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessOutputSource {
    StdOut,
    StdErr,
    Debug,
}

impl fmt::Display for ProcessOutputSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StdOut => write!(f, "stdout"),
            Self::StdErr => write!(f, "stderr"),
            Self::Debug => write!(f, "debug"),
        }
    }
}

impl FromStr for ProcessOutputSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stdout" => Ok(Self::StdOut),
            "stderr" => Ok(Self::StdErr),
            "debug" => Ok(Self::Debug),
            other => Err(format!("unknown output source '{other}'")),
        }
    }
}

/// One line of script output as delivered to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessOutput {
    pub source: ProcessOutputSource,
    pub text: String,
    pub occurred: DateTime<Utc>,
}

impl ProcessOutput {
    pub fn new(source: ProcessOutputSource, text: impl Into<String>, occurred: DateTime<Utc>) -> Self {
        Self {
            source,
            text: text.into(),
            occurred,
        }
    }
}

/// Expand `text` into a service-message block so the caller renders it with
/// the given style (`warning`, `wait`, ...).
///
/// The opening and closing markers sit one nanosecond either side of the line
/// so a stable sort by time keeps the block together.
pub(crate) fn wrapped(
    wrapper: &str,
    source: ProcessOutputSource,
    text: impl Into<String>,
    occurred: DateTime<Utc>,
) -> [ProcessOutput; 3] {
    let tick = chrono::Duration::nanoseconds(1);
    [
        ProcessOutput::new(
            ProcessOutputSource::StdOut,
            format!("##octopus[stdout-{wrapper}]"),
            occurred - tick,
        ),
        ProcessOutput::new(source, text, occurred),
        ProcessOutput::new(
            ProcessOutputSource::StdOut,
            "##octopus[stdout-default]",
            occurred + tick,
        ),
    ]
}
