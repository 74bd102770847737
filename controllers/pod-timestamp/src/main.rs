//! Pod Timestamp Controller
//!
//! Watches pods across the cluster and stamps every newly created pod with
//! an annotation holding its creation time in unix seconds:
//! - Replays recent pods from an initial list, then follows a watch
//! - Skips pods outside the namespace filter or older than the age threshold
//! - Re-reads each pod after a short delay and writes the annotation,
//!   retrying on optimistic-concurrency conflicts

mod backoff;
mod config;
mod controller;
mod error;
mod reconciler;
mod shutdown;
mod watcher;

#[cfg(test)]
mod test_utils;

use crate::config::ControllerConfig;
use crate::controller::Controller;
use crate::error::ControllerError;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting Pod Timestamp Controller");

    // kube's rustls client needs a process-wide crypto provider
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        debug!("rustls crypto provider already installed");
    }

    let config = ControllerConfig::from_env()?;
    config.log_summary();

    let (trigger, signal) = shutdown::channel();
    tokio::spawn(async move {
        shutdown::wait_for_signal().await;
        trigger.trigger();
    });

    let controller = Controller::new(config, signal).await?;
    controller.run().await?;

    Ok(())
}
