//! Controller-specific error types.
//!
//! This module defines error types specific to the Pod Timestamp Controller
//! that are not covered by upstream library errors. Per-pod failures never
//! reach this type; they end as a reconciliation `Outcome`.

use pod_client::PodClientError;
use thiserror::Error;

/// Errors that stop the Pod Timestamp Controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Pod API client error
    #[error("Pod client error: {0}")]
    PodClient(#[from] PodClientError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Credentials rejected by the API server
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),

    /// Work could not be handed to a worker because the pool is shutting down
    #[error("Shutdown in progress: {0}")]
    Shutdown(String),
}
