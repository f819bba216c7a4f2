//! Error types shared by the script pod components.

use thiserror::Error;

/// Errors raised while tracking script pods or reading their logs
#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Workspace I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The pod log stream skipped or reordered a line number.
    #[error("Unexpected pod log line number: expected {expected}, found {actual}")]
    UnexpectedLogLineNumber { expected: i64, actual: i64 },

    #[error("Pod log encryption key error: {0}")]
    EncryptionKey(String),

    #[error("Pod log encryption failed: {0}")]
    Encryption(String),

    #[error("Pod log decryption failed: {0}")]
    Decryption(String),

    #[error("Pod watch failed: {0}")]
    Watch(String),

    #[error("Timed out waiting for the initial pod status load")]
    InitialLoadTimeout,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// True for infrastructure failures that are worth retrying with backoff.
    ///
    /// API errors count only when the server was overloaded or failed (429 and
    /// 5xx); other 4xx answers will not change on retry.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Kube(kube::Error::Api(response)) => {
                response.code == 429 || response.code >= 500
            }
            Self::Kube(_) | Self::Io(_) | Self::Watch(_) | Self::InitialLoadTimeout => true,
            _ => false,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
