//! Executor Configuration
//!
//! YAML configuration handed to the executor by the job framework. The
//! global section lists runners; each runner carries the Kubernetes settings
//! used to build and place job pods.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Global configuration (one file, many runners)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Maximum number of jobs run at once by this process
    #[serde(default = "default_concurrent")]
    pub concurrent: usize,

    /// Configured runners
    #[serde(default)]
    pub runners: Vec<RunnerConfig>,
}

/// A single runner definition
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunnerConfig {
    /// Runner name, used for lookups and pod labels
    pub name: String,

    /// Executor this runner dispatches to
    #[serde(default = "default_executor")]
    pub executor: String,

    /// Runner token; its prefix goes into pod names
    #[serde(default)]
    pub token: String,

    /// Kubernetes executor settings
    #[serde(default)]
    pub kubernetes: KubernetesConfig,
}

/// Kubernetes executor settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KubernetesConfig {
    /// Namespace job pods are created in
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// API server URL override
    #[serde(default)]
    pub host: Option<String>,

    /// Explicit kubeconfig path (falls back to in-cluster / default inference)
    #[serde(default)]
    pub kubeconfig: Option<String>,

    /// Kubeconfig context to use
    #[serde(default)]
    pub context: Option<String>,

    /// Skip TLS verification of the API server
    #[serde(default, rename = "acceptInvalidCerts")]
    pub accept_invalid_certs: bool,

    /// Image used when the job does not name one
    #[serde(default)]
    pub image: Option<String>,

    /// Image of the helper container
    #[serde(default = "default_helper_image", rename = "helperImage")]
    pub helper_image: String,

    /// CPU limit of the build container (e.g. "500m")
    #[serde(default)]
    pub cpus: String,

    /// Memory limit of the build container (e.g. "512Mi")
    #[serde(default)]
    pub memory: String,

    /// CPU limit of helper and service containers
    #[serde(default, rename = "serviceCpus")]
    pub service_cpus: String,

    /// Memory limit of helper and service containers
    #[serde(default, rename = "serviceMemory")]
    pub service_memory: String,

    /// Whether jobs may request privileged containers
    #[serde(default, rename = "allowPrivileged")]
    pub allow_privileged: bool,

    /// Seconds between pod status queries
    #[serde(default = "default_poll_interval", rename = "pollIntervalSeconds")]
    pub poll_interval_seconds: u64,

    /// Seconds to wait for a pod to start running
    #[serde(default = "default_poll_timeout", rename = "pollTimeoutSeconds")]
    pub poll_timeout_seconds: u64,
}

fn default_concurrent() -> usize {
    1
}

fn default_executor() -> String {
    "kubernetes".to_string()
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_helper_image() -> String {
    "registry.gitlab.com/gitlab-org/gitlab-runner/gitlab-runner-helper:x86_64-latest".to_string()
}

fn default_poll_interval() -> u64 {
    3
}

fn default_poll_timeout() -> u64 {
    180 // 3 minutes
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            host: None,
            kubeconfig: None,
            context: None,
            accept_invalid_certs: false,
            image: None,
            helper_image: default_helper_image(),
            cpus: String::new(),
            memory: String::new(),
            service_cpus: String::new(),
            service_memory: String::new(),
            allow_privileged: false,
            poll_interval_seconds: default_poll_interval(),
            poll_timeout_seconds: default_poll_timeout(),
        }
    }
}

impl KubernetesConfig {
    /// Polling cadence for pod status queries.
    #[must_use]
    pub fn poll_settings(&self) -> PollSettings {
        PollSettings::new(
            Duration::from_secs(self.poll_interval_seconds),
            Duration::from_secs(self.poll_timeout_seconds),
        )
    }

    /// Check the fields the executor cannot run without
    pub fn validate(&self) -> Result<()> {
        if self.namespace.trim().is_empty() {
            return Err(Error::Config("kubernetes.namespace must not be empty".to_string()));
        }
        if self.poll_interval_seconds == 0 {
            return Err(Error::Config(
                "kubernetes.pollIntervalSeconds must be greater than zero".to_string(),
            ));
        }
        if self.poll_timeout_seconds < self.poll_interval_seconds {
            return Err(Error::Config(format!(
                "kubernetes.pollTimeoutSeconds ({}) must be at least pollIntervalSeconds ({})",
                self.poll_timeout_seconds, self.poll_interval_seconds
            )));
        }
        if self.helper_image.trim().is_empty() {
            return Err(Error::Config("kubernetes.helperImage must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Bounded polling: how often to ask, and for how long.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub interval: Duration,
    pub timeout: Duration,
}

impl PollSettings {
    #[must_use]
    pub const fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    /// Number of status queries allowed, never less than one.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        if self.interval.is_zero() {
            return 1;
        }
        let attempts = self.timeout.as_millis() / self.interval.as_millis().max(1);
        u32::try_from(attempts).unwrap_or(u32::MAX).max(1)
    }
}

impl Default for PollSettings {
    fn default() -> Self {
        Self::new(
            Duration::from_secs(default_poll_interval()),
            Duration::from_secs(default_poll_timeout()),
        )
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read config file {}: {e}", path.display()))
        })?;
        Self::from_yaml(&raw)
    }

    /// Parse configuration from YAML text
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(raw)
            .map_err(|e| Error::Config(format!("failed to parse config YAML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every runner and reject duplicate names
    pub fn validate(&self) -> Result<()> {
        if self.concurrent == 0 {
            return Err(Error::Config("concurrent must be at least 1".to_string()));
        }

        let mut seen = HashSet::new();
        for runner in &self.runners {
            if runner.name.trim().is_empty() {
                return Err(Error::Config("runner name must not be empty".to_string()));
            }
            if !seen.insert(runner.name.as_str()) {
                return Err(Error::Config(format!("duplicate runner name '{}'", runner.name)));
            }
            runner.kubernetes.validate()?;
        }
        Ok(())
    }

    /// Find a runner by name
    #[must_use]
    pub fn runner(&self, name: &str) -> Option<&RunnerConfig> {
        self.runners.iter().find(|r| r.name == name)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            concurrent: default_concurrent(),
            runners: Vec::new(),
        }
    }
}

impl RunnerConfig {
    /// Runner with default Kubernetes settings
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            executor: default_executor(),
            token: String::new(),
            kubernetes: KubernetesConfig::default(),
        }
    }

    /// First eight characters of the token, as shown in pod names.
    #[must_use]
    pub fn short_token(&self) -> &str {
        match self.token.char_indices().nth(8) {
            Some((idx, _)) => &self.token[..idx],
            None => &self.token,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_deserialization() {
        let yaml = r#"
concurrent: 4
runners:
  - name: k8s
    token: "abcdef123456"
    kubernetes:
      namespace: ci
      image: "ruby:2.3"
      cpus: "100m"
      memory: "100Mi"
      serviceCpus: "50m"
      serviceMemory: "64Mi"
      allowPrivileged: true
      pollIntervalSeconds: 1
      pollTimeoutSeconds: 30
"#;

        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.concurrent, 4);
        let runner = config.runner("k8s").unwrap();
        assert_eq!(runner.executor, "kubernetes");
        assert_eq!(runner.short_token(), "abcdef12");
        assert_eq!(runner.kubernetes.namespace, "ci");
        assert_eq!(runner.kubernetes.image.as_deref(), Some("ruby:2.3"));
        assert_eq!(runner.kubernetes.service_memory, "64Mi");
        assert!(runner.kubernetes.allow_privileged);
        assert_eq!(runner.kubernetes.poll_settings().attempts(), 30);
    }

    #[test]
    fn test_default_config() {
        let k8s = KubernetesConfig::default();
        assert_eq!(k8s.namespace, "default");
        assert!(!k8s.allow_privileged);
        assert!(k8s.cpus.is_empty());
        assert_eq!(k8s.poll_settings().attempts(), 60);
        assert!(k8s.validate().is_ok());
    }

    #[test]
    fn validate_rejects_duplicate_runners() {
        let config = Config {
            concurrent: 1,
            runners: vec![RunnerConfig::new("a"), RunnerConfig::new("a")],
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate runner name"));
    }

    #[test]
    fn validate_rejects_bad_polling() {
        let mut k8s = KubernetesConfig {
            poll_interval_seconds: 0,
            ..KubernetesConfig::default()
        };
        assert!(k8s.validate().is_err());

        k8s.poll_interval_seconds = 10;
        k8s.poll_timeout_seconds = 5;
        assert!(k8s.validate().is_err());
    }

    #[test]
    fn short_token_handles_short_values() {
        let mut runner = RunnerConfig::new("r");
        assert_eq!(runner.short_token(), "");
        runner.token = "abc".to_string();
        assert_eq!(runner.short_token(), "abc");
    }

    #[test]
    fn poll_attempts_never_zero() {
        let settings = PollSettings::new(Duration::from_secs(5), Duration::from_secs(1));
        assert_eq!(settings.attempts(), 1);
        let settings = PollSettings::new(Duration::ZERO, Duration::from_secs(1));
        assert_eq!(settings.attempts(), 1);
    }
}
