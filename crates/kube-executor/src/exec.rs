//! Streaming a step's script into a running container.

use crate::cluster::{ExecRequest, PodRef};
use crate::error::{Error, Result};
use crate::job::JobTrace;
use crate::pod::{PodManager, PodPhase};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, Instrument};

/// Runs scripts inside the containers of one job pod
#[derive(Clone)]
pub struct ExecBridge {
    pods: PodManager,
    pod: PodRef,
    /// Shell command that reads the script from stdin
    command: Vec<String>,
    trace: Arc<dyn JobTrace>,
}

impl ExecBridge {
    #[must_use]
    pub fn new(pods: PodManager, pod: PodRef, command: Vec<String>, trace: Arc<dyn JobTrace>) -> Self {
        Self {
            pods,
            pod,
            command,
            trace,
        }
    }

    /// Start the script in `container` on its own task.
    ///
    /// The handle resolves once the remote process exits, so callers can
    /// wait on it alongside other events.
    pub fn run(&self, container: &str, script: String) -> JoinHandle<Result<()>> {
        let bridge = self.clone();
        let container = container.to_string();
        let span = tracing::info_span!("exec", pod = %self.pod, container = %container);

        tokio::spawn(async move { bridge.run_in_container(container, script).await }.instrument(span))
    }

    async fn run_in_container(self, container: String, script: String) -> Result<()> {
        let phase = self.pods.await_running(&self.pod, self.trace.as_ref()).await?;
        if phase != PodPhase::Running {
            return Err(Error::PodNotRunning(phase.to_string()));
        }

        debug!(script_len = script.len(), "Streaming script into container");
        let request = ExecRequest {
            container,
            command: self.command.clone(),
            stdin: script,
            output: self.trace.clone(),
        };

        self.pods
            .client()
            .exec(&self.pod, request)
            .await
            .map_err(Error::Execution)?;

        info!("✅ Command finished");
        Ok(())
    }
}
