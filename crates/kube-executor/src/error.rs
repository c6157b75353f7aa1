//! Error types for the Kubernetes executor.
//!
//! [`Error`] is what the job framework sees from `prepare` and `run`.
//! [`ClusterError`] is what the orchestrator capabilities return; it is
//! wrapped by the job-facing variants once a pod operation is involved.

use crate::pod::PodPhase;
use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Job-facing errors raised by the executor lifecycle.
#[derive(Debug, Error)]
pub enum Error {
    /// The configured shell wants its script written to a file first
    #[error("Kubernetes doesn't support shells that require script file (shell: {shell})")]
    UnsupportedShell { shell: String },

    /// The job requested a privileged container but the runner forbids it
    #[error("Runner does not allow privileged containers")]
    PrivilegedNotAllowed,

    /// A CPU or memory limit string is not a valid quantity
    #[error("error parsing resource limit {raw:?}: {message}")]
    InvalidQuantity { raw: String, message: String },

    /// Job options payload failed validation
    #[error("invalid job options: {0}")]
    InvalidOptions(String),

    /// Runner or executor configuration problem
    #[error("configuration error: {0}")]
    Config(String),

    /// The orchestrator client could not be obtained
    #[error("Error connecting to Kubernetes: {0}")]
    Connection(String),

    /// `run` or `cleanup` was called before a successful `prepare`
    #[error("executor has not been prepared")]
    NotPrepared,

    /// The orchestrator rejected pod creation
    #[error("pod creation failed: {0}")]
    PodCreation(#[source] ClusterError),

    /// Pod status could not be observed
    #[error("failed to query pod status: {0}")]
    PodStatus(#[source] ClusterError),

    /// Pod stayed pending past the polling budget
    #[error("timed out waiting for pod {pod} to start running, last status: {phase}")]
    PodStartTimeout { pod: String, phase: PodPhase },

    /// Pod settled into anything other than Running
    #[error("pod failed to enter running state: {0}")]
    PodNotRunning(String),

    /// Remote command failed or the exec channel broke
    #[error("{0}")]
    Execution(#[source] ClusterError),

    /// The step's abort signal fired before the command finished
    #[error("build aborted")]
    Aborted,
}

impl Error {
    /// True when the step ended because of the external abort signal.
    #[must_use]
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Aborted)
    }
}

/// Errors returned by the orchestrator capabilities.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// API server answered with an error status
    #[error("Kubernetes API error ({code}): {message}")]
    Api { code: u16, message: String },

    /// Connection, TLS or protocol failure
    #[error("transport error: {0}")]
    Transport(String),

    /// The exec stream broke before a status was received
    #[error("exec stream error: {0}")]
    Stream(String),

    /// Remote command finished with a failure status
    #[error("command terminated with exit code {}: {message}", exit_code.map_or_else(|| "unknown".to_string(), |c| c.to_string()))]
    CommandFailed {
        exit_code: Option<i32>,
        message: String,
    },

    /// The API server returned an object missing required metadata
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl ClusterError {
    /// True when the API reported the object as missing.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Api { code: 404, .. })
    }
}

impl From<kube::Error> for ClusterError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ae) => Self::Api {
                code: ae.code,
                message: ae.message,
            },
            other => Self::Transport(other.to_string()),
        }
    }
}
