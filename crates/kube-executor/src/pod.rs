//! Pod lifecycle
//!
//! [`compose_pod`] assembles the job pod from its containers. [`PodManager`]
//! submits it, waits for it to run and deletes it afterwards.

use crate::cluster::{ClusterClient, PodRef};
use crate::config::PollSettings;
use crate::container::REPO_VOLUME;
use crate::error::{ClusterError, Error, Result};
use crate::job::JobTrace;
use k8s_openapi::api::core::v1::{Container, EmptyDirVolumeSource, Pod, PodSpec, Volume};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Container running the user's script
pub const BUILD_CONTAINER: &str = "build";
/// Container running framework-internal steps
pub const HELPER_CONTAINER: &str = "helper";

/// Label marking pods owned by this executor
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
pub const LABEL_JOB_ID: &str = "kube-executor/job-id";
pub const LABEL_PROJECT_ID: &str = "kube-executor/project-id";
pub const LABEL_RUNNER: &str = "kube-executor/runner";
pub const MANAGED_BY_VALUE: &str = "kube-executor";

/// Name of the n-th service container
#[must_use]
pub fn service_container_name(index: usize) -> String {
    format!("svc-{index}")
}

/// Lifecycle phase of a pod as reported by the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    /// Map the API's phase string; anything unrecognised is `Unknown`
    #[must_use]
    pub fn from_phase(phase: &str) -> Self {
        match phase {
            "Pending" => Self::Pending,
            "Running" => Self::Running,
            "Succeeded" => Self::Succeeded,
            "Failed" => Self::Failed,
            _ => Self::Unknown,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for PodPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pod identity and placement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodMeta {
    pub generate_name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
}

/// Assemble the job pod: build, helper, then services in declared order,
/// all sharing one empty-dir volume. Containers are never restarted.
#[must_use]
pub fn compose_pod(
    meta: PodMeta,
    build: Container,
    helper: Container,
    services: Vec<Container>,
) -> Pod {
    let mut containers = Vec::with_capacity(services.len() + 2);
    containers.push(build);
    containers.push(helper);
    containers.extend(services);

    Pod {
        metadata: ObjectMeta {
            generate_name: Some(meta.generate_name),
            namespace: Some(meta.namespace),
            labels: (!meta.labels.is_empty()).then_some(meta.labels),
            ..Default::default()
        },
        spec: Some(PodSpec {
            volumes: Some(vec![Volume {
                name: REPO_VOLUME.to_string(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            }]),
            restart_policy: Some("Never".to_string()),
            containers,
            ..Default::default()
        }),
        status: None,
    }
}

/// Creates, watches and deletes job pods
#[derive(Clone)]
pub struct PodManager {
    client: Arc<dyn ClusterClient>,
    poll: PollSettings,
}

impl PodManager {
    #[must_use]
    pub fn new(client: Arc<dyn ClusterClient>, poll: PollSettings) -> Self {
        Self { client, poll }
    }

    /// Submit the pod; the orchestrator picks the final name
    #[instrument(skip(self, pod), fields(generate_name = ?pod.metadata.generate_name))]
    pub async fn create(&self, pod: &Pod) -> Result<PodRef> {
        let created = self.client.create_pod(pod).await.map_err(Error::PodCreation)?;
        info!(pod = %created, "🚀 Created job pod");
        Ok(created)
    }

    /// Poll until the pod runs or settles elsewhere.
    ///
    /// Returns the phase once it leaves `Pending`. Transient query errors are
    /// retried within the polling budget; a missing pod, a container that can
    /// never start, or a pod still pending when the budget runs out is an
    /// error.
    #[instrument(skip(self, trace), fields(pod = %pod))]
    pub async fn await_running(&self, pod: &PodRef, trace: &dyn JobTrace) -> Result<PodPhase> {
        let attempts = self.poll.attempts();
        let mut last_error: Option<ClusterError> = None;
        let mut last_phase = PodPhase::Unknown;

        for attempt in 1..=attempts {
            match self.client.pod_state(pod).await {
                Ok(state) => {
                    last_error = None;
                    last_phase = state.phase;

                    if state.phase != PodPhase::Pending {
                        debug!(phase = %state.phase, attempt, "Pod left Pending");
                        return Ok(state.phase);
                    }
                    if let Some(reason) = state.waiting_reason {
                        return Err(Error::PodNotRunning(format!("{} ({reason})", state.phase)));
                    }

                    trace.println(&format!(
                        "Waiting for pod {pod} to be running, status is {}",
                        state.phase
                    ));
                }
                Err(e) if e.is_not_found() => {
                    return Err(Error::PodStatus(e));
                }
                Err(e) => {
                    warn!(attempt, attempts, error = %e, "Pod status query failed, retrying");
                    trace.warningln(&format!("Failed to get status of pod {pod}, retrying: {e}"));
                    last_error = Some(e);
                }
            }

            if attempt < attempts {
                tokio::time::sleep(self.poll.interval).await;
            }
        }

        match last_error {
            Some(e) => Err(Error::PodStatus(e)),
            None => Err(Error::PodStartTimeout {
                pod: pod.to_string(),
                phase: last_phase,
            }),
        }
    }

    /// Delete the pod. Callers decide how loud a failure should be.
    #[instrument(skip(self), fields(pod = %pod))]
    pub async fn delete(&self, pod: &PodRef) -> Result<(), ClusterError> {
        self.client.delete_pod(pod).await?;
        info!(pod = %pod, "🧹 Deleted job pod");
        Ok(())
    }

    pub(crate) fn client(&self) -> &Arc<dyn ClusterClient> {
        &self.client
    }
}
