//! Pod client errors

use thiserror::Error;

/// Errors that can occur when interacting with the Kubernetes Pod API.
///
/// The variants follow the way the controller has to react to them rather
/// than the transport they came from: `Auth` is fatal, `Expired` asks for a
/// re-list, `Conflict` is retried by the caller, `Transient` is retried with
/// backoff, and `Malformed` is skipped.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PodClientError {
    /// Credentials rejected or missing (401/403)
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Object does not exist (404)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Optimistic concurrency check failed on update (409)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The watch resumption token is too old (410 Gone)
    #[error("Resource version expired: {0}")]
    Expired(String),

    /// An object or event could not be decoded or lacks identifying fields
    #[error("Malformed object: {0}")]
    Malformed(String),

    /// Network failure, throttling or a server-side error worth retrying
    #[error("Transient error: {0}")]
    Transient(String),

    /// Any other status returned by the API server
    #[error("Kubernetes API error ({code}): {message}")]
    Api { code: u16, message: String },

    /// The client could not be configured (kubeconfig, in-cluster env)
    #[error("Client configuration error: {0}")]
    Config(String),
}

impl PodClientError {
    /// Classify an API status code the way both request errors and in-stream
    /// watch error events are classified.
    pub fn from_status(code: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            401 | 403 => Self::Auth(message),
            404 => Self::NotFound(message),
            409 => Self::Conflict(message),
            410 => Self::Expired(message),
            429 | 500..=599 => Self::Transient(message),
            _ => Self::Api { code, message },
        }
    }

    /// Whether this error must stop the process instead of being retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Auth(_) | Self::Config(_))
    }
}

impl From<kube::Error> for PodClientError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(status) => {
                let message = if status.message.is_empty() {
                    status.reason.clone()
                } else {
                    status.message.clone()
                };
                Self::from_status(status.code, message)
            }
            kube::Error::Auth(e) => Self::Auth(e.to_string()),
            kube::Error::SerdeError(e) => Self::Malformed(e.to_string()),
            kube::Error::InferConfig(e) => Self::Config(e.to_string()),
            other => Self::Transient(other.to_string()),
        }
    }
}
