//! Controller configuration.
//!
//! Everything is read once from environment variables at startup and frozen
//! into a [`ControllerConfig`] that is shared by reference between the watch
//! loop, the reconciler and the worker pool. Empty variables count as unset.

use crate::error::ControllerError;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// Annotation key written when `WATCH_ANNOTATION` is unset
pub const DEFAULT_ANNOTATION_KEY: &str = "timestamp";

/// Immutable controller configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Annotation key to set on new pods
    pub annotation_key: String,
    /// Substring a namespace must contain; empty matches every namespace
    pub namespace_filter: String,
    /// Pods older than this when their Added event arrives are ignored
    pub age_threshold: Duration,
    /// Wait between a pod's Added event and the annotation write
    pub delay: Duration,
    /// Number of annotation workers (and the cap on in-flight annotations)
    pub worker_count: usize,
    /// Pending jobs each worker buffers before the watch loop waits
    pub worker_queue_depth: usize,
    /// Get/update attempt pairs before a conflicting update is given up
    pub conflict_retries: u32,
    /// Pause between conflict retries
    pub conflict_backoff: Duration,
    /// First reconnect delay after a watch failure
    pub backoff_initial: Duration,
    /// Ceiling for reconnect delays
    pub backoff_max: Duration,
    /// How long in-flight annotations may run after a shutdown signal
    pub shutdown_grace: Duration,
    /// Explicit kubeconfig; inferred when `None`
    pub kubeconfig: Option<PathBuf>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            annotation_key: DEFAULT_ANNOTATION_KEY.to_string(),
            namespace_filter: String::new(),
            age_threshold: Duration::from_secs(10),
            delay: Duration::from_secs(5),
            worker_count: 16,
            worker_queue_depth: 64,
            conflict_retries: 3,
            conflict_backoff: Duration::from_millis(200),
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(30),
            kubeconfig: None,
        }
    }
}

impl ControllerConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through `lookup`, falling back to defaults for
    /// anything unset or empty.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ControllerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let defaults = Self::default();

        let config = Self {
            annotation_key: get("WATCH_ANNOTATION").unwrap_or(defaults.annotation_key),
            namespace_filter: get("WATCH_NAMESPACES").unwrap_or(defaults.namespace_filter),
            age_threshold: parse_or(&get, "WATCH_AGE_THRESHOLD_SECS", defaults.age_threshold, Duration::from_secs)?,
            delay: parse_or(&get, "WATCH_DELAY_SECS", defaults.delay, Duration::from_secs)?,
            worker_count: parse_or(&get, "WATCH_WORKERS", defaults.worker_count, |n| n)?,
            worker_queue_depth: parse_or(&get, "WATCH_WORKER_QUEUE", defaults.worker_queue_depth, |n| n)?,
            conflict_retries: parse_or(&get, "WATCH_CONFLICT_RETRIES", defaults.conflict_retries, |n| n)?,
            conflict_backoff: parse_or(&get, "WATCH_CONFLICT_BACKOFF_MS", defaults.conflict_backoff, Duration::from_millis)?,
            backoff_initial: parse_or(&get, "WATCH_BACKOFF_INITIAL_SECS", defaults.backoff_initial, Duration::from_secs)?,
            backoff_max: parse_or(&get, "WATCH_BACKOFF_MAX_SECS", defaults.backoff_max, Duration::from_secs)?,
            shutdown_grace: parse_or(&get, "WATCH_SHUTDOWN_GRACE_SECS", defaults.shutdown_grace, Duration::from_secs)?,
            kubeconfig: get("KUBECONFIG").map(PathBuf::from),
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the controller cannot run with.
    pub fn validate(&self) -> Result<(), ControllerError> {
        validate_annotation_key(&self.annotation_key)?;
        if self.worker_count == 0 {
            return Err(ControllerError::InvalidConfig(
                "WATCH_WORKERS must be at least 1".to_string(),
            ));
        }
        if self.worker_queue_depth == 0 {
            return Err(ControllerError::InvalidConfig(
                "WATCH_WORKER_QUEUE must be at least 1".to_string(),
            ));
        }
        if self.conflict_retries == 0 {
            return Err(ControllerError::InvalidConfig(
                "WATCH_CONFLICT_RETRIES must be at least 1".to_string(),
            ));
        }
        if self.backoff_initial > self.backoff_max {
            return Err(ControllerError::InvalidConfig(format!(
                "WATCH_BACKOFF_INITIAL_SECS ({}s) exceeds WATCH_BACKOFF_MAX_SECS ({}s)",
                self.backoff_initial.as_secs(),
                self.backoff_max.as_secs()
            )));
        }
        Ok(())
    }

    /// Substring match on the namespace; an empty filter matches everything.
    pub fn matches_namespace(&self, namespace: &str) -> bool {
        namespace.contains(self.namespace_filter.as_str())
    }

    /// Log the effective configuration.
    pub fn log_summary(&self) {
        info!("Configuration:");
        info!("  Annotation key: {}", self.annotation_key);
        info!(
            "  Namespace filter: {}",
            if self.namespace_filter.is_empty() { "all namespaces" } else { self.namespace_filter.as_str() }
        );
        info!("  Age threshold: {}s", self.age_threshold.as_secs());
        info!("  Delay: {}s", self.delay.as_secs());
        info!("  Workers: {} (queue depth {})", self.worker_count, self.worker_queue_depth);
        info!(
            "  Conflict retries: {} ({}ms apart)",
            self.conflict_retries,
            self.conflict_backoff.as_millis()
        );
        info!(
            "  Watch backoff: {}s..{}s",
            self.backoff_initial.as_secs(),
            self.backoff_max.as_secs()
        );
        info!(
            "  Kubeconfig: {}",
            self.kubeconfig
                .as_ref()
                .map_or_else(|| "inferred".to_string(), |p| p.display().to_string())
        );
    }
}

fn parse_or<T, U, G>(get: &G, key: &str, default: U, convert: fn(T) -> U) -> Result<U, ControllerError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(convert)
            .map_err(|e| ControllerError::InvalidConfig(format!("{key}={raw}: {e}"))),
    }
}

/// Kubernetes annotation keys are `[prefix/]name`: the name is 1-63
/// alphanumerics, `-`, `_` or `.`, starting and ending alphanumeric; the
/// optional prefix is a DNS subdomain of at most 253 characters.
fn validate_annotation_key(key: &str) -> Result<(), ControllerError> {
    let invalid = |why: &str| ControllerError::InvalidConfig(format!("WATCH_ANNOTATION {key:?}: {why}"));

    let (prefix, name) = match key.rsplit_once('/') {
        Some((prefix, name)) => (Some(prefix), name),
        None => (None, key),
    };

    if name.is_empty() || name.len() > 63 {
        return Err(invalid("name must be 1-63 characters"));
    }
    let edge_ok = |c: Option<char>| c.is_some_and(|c| c.is_ascii_alphanumeric());
    if !edge_ok(name.chars().next()) || !edge_ok(name.chars().last()) {
        return Err(invalid("name must start and end with an alphanumeric character"));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')) {
        return Err(invalid("name may only contain alphanumerics, '-', '_' and '.'"));
    }

    if let Some(prefix) = prefix {
        if prefix.is_empty() || prefix.len() > 253 {
            return Err(invalid("prefix must be 1-253 characters"));
        }
        let label_ok = |label: &str| {
            !label.is_empty()
                && label.len() <= 63
                && label.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
                && !label.starts_with('-')
                && !label.ends_with('-')
        };
        if !prefix.split('.').all(label_ok) {
            return Err(invalid("prefix must be a lowercase DNS subdomain"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<ControllerConfig, ControllerError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        ControllerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config, ControllerConfig::default());
        assert_eq!(config.annotation_key, "timestamp");
        assert_eq!(config.age_threshold, Duration::from_secs(10));
        assert_eq!(config.delay, Duration::from_secs(5));
        assert_eq!(config.conflict_retries, 3);
        assert_eq!(config.backoff_initial, Duration::from_secs(1));
        assert_eq!(config.backoff_max, Duration::from_secs(30));
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("WATCH_ANNOTATION", "example.com/created-at"),
            ("WATCH_NAMESPACES", "prod"),
            ("WATCH_AGE_THRESHOLD_SECS", "20"),
            ("WATCH_DELAY_SECS", "0"),
            ("WATCH_WORKERS", "4"),
            ("WATCH_CONFLICT_BACKOFF_MS", "50"),
            ("KUBECONFIG", "/etc/kube/config"),
        ])
        .unwrap();

        assert_eq!(config.annotation_key, "example.com/created-at");
        assert_eq!(config.namespace_filter, "prod");
        assert_eq!(config.age_threshold, Duration::from_secs(20));
        assert_eq!(config.delay, Duration::ZERO);
        assert_eq!(config.worker_count, 4);
        assert_eq!(config.conflict_backoff, Duration::from_millis(50));
        assert_eq!(config.kubeconfig, Some(PathBuf::from("/etc/kube/config")));
    }

    #[test]
    fn test_empty_values_fall_back_to_defaults() {
        let config = load(&[("WATCH_ANNOTATION", ""), ("WATCH_DELAY_SECS", "  ")]).unwrap();
        assert_eq!(config.annotation_key, "timestamp");
        assert_eq!(config.delay, Duration::from_secs(5));
    }

    #[test]
    fn test_rejects_negative_and_garbage_numbers() {
        assert!(matches!(load(&[("WATCH_DELAY_SECS", "-5")]), Err(ControllerError::InvalidConfig(_))));
        assert!(matches!(load(&[("WATCH_WORKERS", "many")]), Err(ControllerError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_unusable_limits() {
        assert!(load(&[("WATCH_WORKERS", "0")]).is_err());
        assert!(load(&[("WATCH_WORKER_QUEUE", "0")]).is_err());
        assert!(load(&[("WATCH_CONFLICT_RETRIES", "0")]).is_err());
        assert!(load(&[("WATCH_BACKOFF_INITIAL_SECS", "60"), ("WATCH_BACKOFF_MAX_SECS", "30")]).is_err());
    }

    #[test]
    fn test_annotation_key_shape() {
        assert!(validate_annotation_key("timestamp").is_ok());
        assert!(validate_annotation_key("pods.example.com/created-at").is_ok());
        assert!(validate_annotation_key("-bad").is_err());
        assert!(validate_annotation_key("Bad.Prefix/name").is_err());
        assert!(validate_annotation_key("/name").is_err());
        assert!(validate_annotation_key(&"a".repeat(64)).is_err());
        assert!(validate_annotation_key("has space").is_err());
    }

    #[test]
    fn test_namespace_filter_is_substring() {
        let mut config = ControllerConfig::default();
        assert!(config.matches_namespace("anything"));

        config.namespace_filter = "prod".to_string();
        assert!(config.matches_namespace("prod-a"));
        assert!(config.matches_namespace("team-prod"));
        assert!(!config.matches_namespace("staging"));
    }
}
