//! Orchestrator capabilities
//!
//! The executor talks to the cluster only through [`ClusterClient`]:
//! create a pod, read its status, stream a command into one of its
//! containers, delete it. [`KubeCluster`] implements it on top of `kube`.

use crate::config::KubernetesConfig;
use crate::error::{ClusterError, Error, Result};
use crate::job::JobTrace;
use crate::pod::PodPhase;
use async_trait::async_trait;
use futures::future::join_all;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use kube::api::{Api, AttachParams, AttachedProcess, DeleteParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Client;
use std::fmt;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Identity of a pod created for a job
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PodRef {
    pub name: String,
    pub namespace: String,
}

impl fmt::Display for PodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Observed pod state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodState {
    pub phase: PodPhase,
    /// Waiting reason of the first container that is stuck, if any
    pub waiting_reason: Option<String>,
}

impl PodState {
    #[must_use]
    pub fn new(phase: PodPhase) -> Self {
        Self {
            phase,
            waiting_reason: None,
        }
    }
}

/// A command streamed into a running container
pub struct ExecRequest {
    pub container: String,
    pub command: Vec<String>,
    /// Script text written to the process stdin
    pub stdin: String,
    /// Receives both stdout and stderr
    pub output: Arc<dyn JobTrace>,
}

impl fmt::Debug for ExecRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecRequest")
            .field("container", &self.container)
            .field("command", &self.command)
            .field("stdin_len", &self.stdin.len())
            .finish_non_exhaustive()
    }
}

/// Orchestrator control plane operations used by the executor
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Submit a pod; returns the server-assigned identity
    async fn create_pod(&self, pod: &Pod) -> Result<PodRef, ClusterError>;

    /// Current phase of the pod
    async fn pod_state(&self, pod: &PodRef) -> Result<PodState, ClusterError>;

    /// Delete the pod
    async fn delete_pod(&self, pod: &PodRef) -> Result<(), ClusterError>;

    /// Run a command in a container, resolving once the remote process exits
    async fn exec(&self, pod: &PodRef, request: ExecRequest) -> Result<(), ClusterError>;
}

/// `kube`-backed cluster client
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a client from the runner's connection settings.
    ///
    /// Without an explicit kubeconfig the in-cluster service account or the
    /// default kubeconfig is used.
    pub async fn connect(settings: &KubernetesConfig) -> Result<Self> {
        let mut config = match settings.kubeconfig.as_deref() {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path)
                    .map_err(|e| Error::Connection(format!("reading kubeconfig {path}: {e}")))?;
                let options = KubeConfigOptions {
                    context: settings.context.clone(),
                    ..Default::default()
                };
                kube::Config::from_custom_kubeconfig(kubeconfig, &options)
                    .await
                    .map_err(|e| Error::Connection(e.to_string()))?
            }
            None => kube::Config::infer()
                .await
                .map_err(|e| Error::Connection(e.to_string()))?,
        };

        if let Some(host) = settings.host.as_deref() {
            config.cluster_url = host
                .parse()
                .map_err(|e| Error::Connection(format!("invalid host {host}: {e}")))?;
        }
        if settings.accept_invalid_certs {
            warn!("TLS verification of the Kubernetes API server is disabled");
            config.accept_invalid_certs = true;
        }

        info!(cluster_url = %config.cluster_url, "Connecting to Kubernetes");
        let client = Client::try_from(config).map_err(|e| Error::Connection(e.to_string()))?;
        Ok(Self::new(client))
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn create_pod(&self, pod: &Pod) -> Result<PodRef, ClusterError> {
        let namespace = pod
            .metadata
            .namespace
            .clone()
            .ok_or_else(|| ClusterError::Malformed("pod spec has no namespace".to_string()))?;

        let created = self
            .pods(&namespace)
            .create(&PostParams::default(), pod)
            .await?;

        let name = created
            .metadata
            .name
            .ok_or_else(|| ClusterError::Malformed("created pod has no name".to_string()))?;

        Ok(PodRef {
            name,
            namespace: created.metadata.namespace.unwrap_or(namespace),
        })
    }

    async fn pod_state(&self, pod: &PodRef) -> Result<PodState, ClusterError> {
        let current = self.pods(&pod.namespace).get_status(&pod.name).await?;
        Ok(pod_state_from(&current))
    }

    async fn delete_pod(&self, pod: &PodRef) -> Result<(), ClusterError> {
        self.pods(&pod.namespace)
            .delete(&pod.name, &DeleteParams::default())
            .await?;
        Ok(())
    }

    async fn exec(&self, pod: &PodRef, request: ExecRequest) -> Result<(), ClusterError> {
        let params = AttachParams::default()
            .container(request.container.clone())
            .stdin(true)
            .stdout(true)
            .stderr(true);

        debug!(pod = %pod, container = %request.container, "Opening exec stream");
        let mut process = self
            .pods(&pod.namespace)
            .exec(&pod.name, request.command.clone(), &params)
            .await?;

        let status = process
            .take_status()
            .ok_or_else(|| ClusterError::Stream("exec status channel unavailable".to_string()))?;

        let mut stdin = process.stdin();
        let relays: Vec<JoinHandle<()>> = [
            process.stdout().map(|out| relay(out, request.output.clone())),
            process.stderr().map(|err| relay(err, request.output.clone())),
        ]
        .into_iter()
        .flatten()
        .collect();
        let mut session = ExecSession {
            process: Some(process),
            relays,
        };

        // Stdin must stay open until the status arrives: kube ends the whole
        // session on stdin EOF. The trailing exit lets the shell finish alone.
        if let Some(writer) = stdin.as_mut() {
            writer
                .write_all(script_with_exit(&request.stdin).as_bytes())
                .await
                .map_err(|e| ClusterError::Stream(format!("writing script: {e}")))?;
            writer
                .flush()
                .await
                .map_err(|e| ClusterError::Stream(format!("flushing script: {e}")))?;
        }

        let status = status.await;
        drop(stdin);

        for joined in join_all(session.relays.iter_mut()).await {
            if let Err(e) = joined {
                warn!(error = %e, "Output relay task failed");
            }
        }

        let joined = match session.process.take() {
            Some(process) => process
                .join()
                .await
                .map_err(|e| ClusterError::Stream(e.to_string())),
            None => Ok(()),
        };

        match (status, joined) {
            (Some(status), joined) => {
                if let Err(e) = joined {
                    debug!(error = %e, "Exec stream ended uncleanly after its status");
                }
                exec_result(&status)
            }
            (None, Err(e)) => Err(e),
            (None, Ok(())) => Err(ClusterError::Stream(
                "exec stream closed without a status".to_string(),
            )),
        }
    }
}

/// Background tasks of one exec call, stopped if the call is dropped early
struct ExecSession {
    process: Option<AttachedProcess>,
    relays: Vec<JoinHandle<()>>,
}

impl Drop for ExecSession {
    fn drop(&mut self) {
        if let Some(process) = &self.process {
            process.abort();
        }
        for relay in &self.relays {
            relay.abort();
        }
    }
}

/// Script text followed by an explicit `exit`, keeping the last status
fn script_with_exit(script: &str) -> String {
    if script.is_empty() || script.ends_with('\n') {
        format!("{script}exit\n")
    } else {
        format!("{script}\nexit\n")
    }
}

/// Copy a remote stream into the trace until EOF
fn relay<R>(mut reader: R, output: Arc<dyn JobTrace>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; 8 * 1024];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => output.write(&buf[..n]),
                Err(e) => {
                    warn!(error = %e, "Exec output stream ended with error");
                    break;
                }
            }
        }
    })
}

/// Container waiting reasons that never resolve on their own
const FATAL_WAITING_REASONS: &[&str] = &[
    "ErrImagePull",
    "ImagePullBackOff",
    "InvalidImageName",
    "CreateContainerConfigError",
];

/// Reduce a pod object to the state the executor cares about
#[must_use]
pub fn pod_state_from(pod: &Pod) -> PodState {
    let status = pod.status.as_ref();
    let phase = status
        .and_then(|s| s.phase.as_deref())
        .map_or(PodPhase::Unknown, PodPhase::from_phase);

    let waiting_reason = status
        .and_then(|s| s.container_statuses.as_ref())
        .and_then(|statuses| {
            statuses.iter().find_map(|cs| {
                cs.state
                    .as_ref()
                    .and_then(|state| state.waiting.as_ref())
                    .and_then(|waiting| waiting.reason.clone())
                    .filter(|reason| FATAL_WAITING_REASONS.contains(&reason.as_str()))
            })
        });

    PodState {
        phase,
        waiting_reason,
    }
}

/// Interpret the final exec status sent by the API server
fn exec_result(status: &Status) -> Result<(), ClusterError> {
    if status.status.as_deref() == Some("Success") {
        return Ok(());
    }

    let exit_code = status
        .details
        .as_ref()
        .and_then(|d| d.causes.as_ref())
        .and_then(|causes| {
            causes
                .iter()
                .find(|c| c.reason.as_deref() == Some("ExitCode"))
                .and_then(|c| c.message.as_deref())
                .and_then(|m| m.trim().parse::<i32>().ok())
        });

    let message = status
        .message
        .clone()
        .or_else(|| status.reason.clone())
        .unwrap_or_else(|| "command failed".to_string());

    Err(ClusterError::CommandFailed { exit_code, message })
}
