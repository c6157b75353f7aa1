//! Kubernetes executor lifecycle: prepare, run each step, clean up.

use crate::cluster::{ClusterClient, KubeCluster, PodRef};
use crate::config::{Config, RunnerConfig};
use crate::container::ContainerBuilder;
use crate::error::{ClusterError, Error, Result};
use crate::exec::ExecBridge;
use crate::job::{ExecutorCommand, Job, SecurityOptions};
use crate::limits::{parse_limits, ResourceLimits};
use crate::naming::PodNaming;
use crate::pod::{
    compose_pod, service_container_name, PodManager, PodMeta, BUILD_CONTAINER, HELPER_CONTAINER,
    LABEL_JOB_ID, LABEL_MANAGED_BY, LABEL_PROJECT_ID, LABEL_RUNNER, MANAGED_BY_VALUE,
};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Lifecycle every executor implements for the job framework
#[async_trait]
pub trait Executor: Send {
    /// Validate settings and get ready to run; no remote resources yet
    async fn prepare(&mut self, global: &Config, runner: &RunnerConfig, job: Job) -> Result<()>;

    /// Run one step to completion or abort
    async fn run(&mut self, cmd: ExecutorCommand) -> Result<()>;

    /// Release remote resources. Never fails; the outcome is informational.
    async fn cleanup(&mut self) -> CleanupOutcome;
}

/// What cleanup did. Kept apart from step results so a failed deletion can
/// never change how the job ended.
#[derive(Debug)]
pub enum CleanupOutcome {
    /// No pod was ever created
    NothingToDelete,
    Deleted(PodRef),
    Failed { pod: PodRef, error: ClusterError },
}

/// State fixed by `prepare`
struct Prepared {
    runner: RunnerConfig,
    job: Job,
    image: String,
    privileged: bool,
    build_limits: ResourceLimits,
    service_limits: ResourceLimits,
}

/// Executor that runs each job in its own pod
#[derive(Default)]
pub struct KubernetesExecutor {
    client: Option<Arc<dyn ClusterClient>>,
    prepared: Option<Prepared>,
    pods: Option<PodManager>,
    pod: Option<PodRef>,
}

impl KubernetesExecutor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use an existing client instead of connecting during `prepare`
    #[must_use]
    pub fn with_client(client: Arc<dyn ClusterClient>) -> Self {
        Self {
            client: Some(client),
            ..Self::default()
        }
    }

    /// Pod created for the current job, if any
    #[must_use]
    pub fn pod(&self) -> Option<&PodRef> {
        self.pod.as_ref()
    }

    /// Build the pod spec for the prepared job
    fn pod_spec(prepared: &Prepared) -> Pod {
        let Prepared {
            runner,
            job,
            image,
            privileged,
            build_limits,
            service_limits,
        } = prepared;

        let builder = ContainerBuilder::new(&job.build_dir, &job.variables, *privileged);
        let command = &job.shell.command;

        let build = builder.build(BUILD_CONTAINER, image, build_limits, command);
        let helper = builder.build(
            HELPER_CONTAINER,
            &runner.kubernetes.helper_image,
            service_limits,
            command,
        );
        let services = job
            .options
            .services
            .iter()
            .enumerate()
            .map(|(i, image)| builder.build(&service_container_name(i), image, service_limits, &[]))
            .collect();

        let mut labels = BTreeMap::new();
        labels.insert(LABEL_MANAGED_BY.to_string(), MANAGED_BY_VALUE.to_string());
        labels.insert(LABEL_JOB_ID.to_string(), job.id.to_string());
        labels.insert(LABEL_PROJECT_ID.to_string(), job.project_id.to_string());
        labels.insert(LABEL_RUNNER.to_string(), sanitize_label_value(&runner.name));

        compose_pod(
            PodMeta {
                generate_name: PodNaming::generate_name(runner, job),
                namespace: runner.kubernetes.namespace.clone(),
                labels,
            },
            build,
            helper,
            services,
        )
    }

    /// Create the job pod on first use
    async fn ensure_pod(&mut self) -> Result<(PodManager, PodRef)> {
        let prepared = self.prepared.as_ref().ok_or(Error::NotPrepared)?;
        let pods = self.pods.clone().ok_or(Error::NotPrepared)?;

        if let Some(pod) = &self.pod {
            return Ok((pods, pod.clone()));
        }

        let spec = Self::pod_spec(prepared);
        let pod = pods.create(&spec).await?;
        self.pod = Some(pod.clone());
        Ok((pods, pod))
    }
}

#[async_trait]
impl Executor for KubernetesExecutor {
    #[instrument(skip_all, fields(runner = %runner.name, job_id = job.id))]
    async fn prepare(&mut self, _global: &Config, runner: &RunnerConfig, job: Job) -> Result<()> {
        if job.shell.pass_file {
            return Err(Error::UnsupportedShell {
                shell: job.shell.shell.clone(),
            });
        }
        runner.kubernetes.validate()?;

        let image = job
            .options
            .image
            .clone()
            .or_else(|| runner.kubernetes.image.clone())
            .ok_or_else(|| {
                Error::Config("job has no image and the runner defines no default image".to_string())
            })?;

        let privileged = job.variables.privileged();
        if privileged && !runner.kubernetes.allow_privileged {
            return Err(Error::PrivilegedNotAllowed);
        }

        let service_limits =
            parse_limits(&runner.kubernetes.service_cpus, &runner.kubernetes.service_memory)?;
        let build_limits = parse_limits(&runner.kubernetes.cpus, &runner.kubernetes.memory)?;

        let client = match &self.client {
            Some(client) => client.clone(),
            None => {
                let cluster: Arc<dyn ClusterClient> =
                    Arc::new(KubeCluster::connect(&runner.kubernetes).await?);
                self.client = Some(cluster.clone());
                cluster
            }
        };

        job.trace
            .println(&format!("Using Kubernetes executor with image {image} ..."));
        info!(image = %image, services = job.options.services.len(), "Prepared Kubernetes executor");

        self.pods = Some(PodManager::new(client, runner.kubernetes.poll_settings()));
        self.prepared = Some(Prepared {
            runner: runner.clone(),
            job,
            image,
            privileged,
            build_limits,
            service_limits,
        });
        Ok(())
    }

    async fn run(&mut self, cmd: ExecutorCommand) -> Result<()> {
        debug!(predefined = cmd.predefined, "Starting Kubernetes command...");

        let (pods, pod) = self.ensure_pod().await?;
        let prepared = self.prepared.as_ref().ok_or(Error::NotPrepared)?;

        let container = if cmd.predefined {
            HELPER_CONTAINER
        } else {
            BUILD_CONTAINER
        };

        let bridge = ExecBridge::new(
            pods,
            pod,
            prepared.job.shell.command.clone(),
            prepared.job.trace.clone(),
        );
        let mut execution = bridge.run(container, cmd.script);

        tokio::select! {
            joined = &mut execution => match joined {
                Ok(result) => result,
                Err(e) => Err(Error::Execution(ClusterError::Stream(format!(
                    "exec task ended unexpectedly: {e}"
                )))),
            },
            () = cmd.abort.cancelled() => {
                // Stops waiting locally; the remote process is left to pod deletion
                execution.abort();
                warn!(container, "Step aborted");
                Err(Error::Aborted)
            }
        }
    }

    async fn cleanup(&mut self) -> CleanupOutcome {
        let Some(pod) = self.pod.take() else {
            return CleanupOutcome::NothingToDelete;
        };
        let Some(pods) = self.pods.as_ref() else {
            return CleanupOutcome::NothingToDelete;
        };

        match pods.delete(&pod).await {
            Ok(()) => CleanupOutcome::Deleted(pod),
            Err(error) => {
                warn!(pod = %pod, error = %error, "Error cleaning up pod");
                if let Some(prepared) = &self.prepared {
                    prepared
                        .job
                        .trace
                        .errorln(&format!("Error cleaning up pod: {error}"));
                }
                CleanupOutcome::Failed { pod, error }
            }
        }
    }
}

/// Label values: at most 63 chars of [A-Za-z0-9-_.], alphanumeric at both ends
fn sanitize_label_value(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .take(63)
        .collect();
    cleaned
        .trim_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{BufferTrace, JobOptions, JobVariable, JobVariables, ShellScript};

    fn prepared(services: Vec<String>) -> Prepared {
        let mut runner = RunnerConfig::new("k8s runner");
        runner.token = "abcdef123".to_string();
        runner.kubernetes.namespace = "ci".to_string();
        Prepared {
            runner,
            job: Job {
                id: 11,
                project_id: 3,
                concurrent_id: 1,
                build_dir: "/builds/group/project".to_string(),
                variables: JobVariables::new(vec![JobVariable::public("CI", "true")]),
                options: JobOptions {
                    image: Some("ruby:2.3".to_string()),
                    services,
                },
                shell: ShellScript::bash(),
                trace: Arc::new(BufferTrace::new()),
            },
            image: "ruby:2.3".to_string(),
            privileged: false,
            build_limits: parse_limits("100m", "100Mi").unwrap(),
            service_limits: ResourceLimits::new(),
        }
    }

    #[test]
    fn pod_spec_has_build_helper_and_services() {
        let spec = KubernetesExecutor::pod_spec(&prepared(vec![
            "postgres:9.6".to_string(),
            "redis".to_string(),
        ]));

        let containers = spec.spec.unwrap().containers;
        let names: Vec<&str> = containers.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["build", "helper", "svc-0", "svc-1"]);

        assert_eq!(containers[0].image.as_deref(), Some("ruby:2.3"));
        assert_eq!(containers[2].image.as_deref(), Some("postgres:9.6"));
        assert!(containers[0].command.is_some());
        assert!(containers[2].command.is_none());
        assert!(containers[0]
            .resources
            .as_ref()
            .and_then(|r| r.limits.as_ref())
            .is_some());
        assert!(containers[1]
            .resources
            .as_ref()
            .and_then(|r| r.limits.as_ref())
            .is_none());

        let labels = spec.metadata.labels.unwrap();
        assert_eq!(labels.get(LABEL_JOB_ID).map(String::as_str), Some("11"));
        assert_eq!(labels.get(LABEL_RUNNER).map(String::as_str), Some("k8s-runner"));
        assert_eq!(
            spec.metadata.generate_name.as_deref(),
            Some("runner-abcdef12-project-3-concurrent-1-")
        );
    }

    #[test]
    fn label_values_are_sanitized() {
        assert_eq!(sanitize_label_value("my runner!"), "my-runner");
        assert_eq!(sanitize_label_value("-x-"), "x");
        assert!(sanitize_label_value(&"a".repeat(100)).len() <= 63);
    }

    #[tokio::test]
    async fn run_requires_prepare() {
        let mut executor = KubernetesExecutor::new();
        let err = executor
            .run(ExecutorCommand::user("true", tokio_util::sync::CancellationToken::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotPrepared));
    }

    #[tokio::test]
    async fn cleanup_without_pod_is_noop() {
        let mut executor = KubernetesExecutor::new();
        assert!(matches!(
            executor.cleanup().await,
            CleanupOutcome::NothingToDelete
        ));
    }
}
