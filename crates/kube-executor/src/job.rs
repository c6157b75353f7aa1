//! Job model consumed from the job framework
//!
//! The framework owns configuration loading, script templating and the log
//! sink; the executor only sees the already-decoded values defined here.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Variable consulted for the privileged capability query
pub const PRIVILEGED_VARIABLE: &str = "KUBERNETES_PRIVILEGED";

/// A single job variable with its visibility flags
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct JobVariable {
    pub key: String,
    #[serde(default)]
    pub value: String,
    /// Exported to the job environment
    #[serde(default)]
    pub public: bool,
    /// Set by the framework itself
    #[serde(default)]
    pub internal: bool,
    /// Secret; must never reach a container spec
    #[serde(default)]
    pub masked: bool,
}

impl JobVariable {
    /// Public, exported variable
    pub fn public(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            public: true,
            internal: false,
            masked: false,
        }
    }

    /// Framework-internal variable
    pub fn internal(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            internal: true,
            public: false,
            ..Self::public(key, value)
        }
    }

    /// Secret variable; delivered through the command channel only
    pub fn secret(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            public: false,
            masked: true,
            ..Self::public(key, value)
        }
    }
}

/// Ordered job variables
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct JobVariables(Vec<JobVariable>);

impl JobVariables {
    #[must_use]
    pub fn new(variables: Vec<JobVariable>) -> Self {
        Self(variables)
    }

    /// Variables safe to place in a container environment, in declared order.
    pub fn public_or_internal(&self) -> impl Iterator<Item = &JobVariable> {
        self.0
            .iter()
            .filter(|v| !v.masked && (v.public || v.internal))
    }

    /// Last value declared for `key`
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .rev()
            .find(|v| v.key == key)
            .map(|v| v.value.as_str())
    }

    pub fn push(&mut self, variable: JobVariable) {
        self.0.push(variable);
    }
}

/// Job-level security capabilities
pub trait SecurityOptions {
    /// Whether the job asks for privileged containers
    fn privileged(&self) -> bool;
}

impl SecurityOptions for JobVariables {
    fn privileged(&self) -> bool {
        self.get(PRIVILEGED_VARIABLE).is_some_and(|value| {
            let value = value.trim();
            value.eq_ignore_ascii_case("true") || value == "1" || value.eq_ignore_ascii_case("yes")
        })
    }
}

/// Typed job options (`image`, `services`)
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct JobOptions {
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub services: Vec<String>,
}

impl JobOptions {
    /// Decode and validate the untyped options payload handed over by the
    /// framework. Unknown keys are ignored.
    pub fn decode(payload: serde_json::Value) -> Result<Self> {
        if payload.is_null() {
            return Ok(Self::default());
        }

        let options: JobOptions = serde_json::from_value(payload)
            .map_err(|e| Error::InvalidOptions(e.to_string()))?;

        if options
            .image
            .as_deref()
            .is_some_and(|image| image.trim().is_empty())
        {
            return Err(Error::InvalidOptions("image must not be empty".to_string()));
        }
        if let Some(idx) = options.services.iter().position(|s| s.trim().is_empty()) {
            return Err(Error::InvalidOptions(format!("services[{idx}] must not be empty")));
        }

        Ok(options)
    }
}

/// How the shell receives the job script
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ShellScript {
    /// Shell name, e.g. "bash"
    pub shell: String,
    /// Whether the shell needs the script written to a file first
    #[serde(default)]
    pub pass_file: bool,
    /// Container command that reads the script from stdin
    pub command: Vec<String>,
}

const BASH_DETECTION: &str = "if [ -x /usr/local/bin/bash ]; then\n\texec /usr/local/bin/bash \nelif [ -x /usr/bin/bash ]; then\n\texec /usr/bin/bash \nelif [ -x /bin/bash ]; then\n\texec /bin/bash \nelif [ -x /usr/local/bin/sh ]; then\n\texec /usr/local/bin/sh \nelif [ -x /usr/bin/sh ]; then\n\texec /usr/bin/sh \nelif [ -x /bin/sh ]; then\n\texec /bin/sh \nelse\n\techo shell not found\n\texit 1\nfi\n\n";

impl ShellScript {
    /// Bash (falling back to sh) reading the script from stdin
    #[must_use]
    pub fn bash() -> Self {
        Self {
            shell: "bash".to_string(),
            pass_file: false,
            command: vec!["sh".to_string(), "-c".to_string(), BASH_DETECTION.to_string()],
        }
    }
}

impl Default for ShellScript {
    fn default() -> Self {
        Self::bash()
    }
}

/// Output sink for user-visible job output
pub trait JobTrace: Send + Sync {
    /// Append raw output
    fn write(&self, chunk: &[u8]);

    fn println(&self, message: &str) {
        self.write(format!("{message}\n").as_bytes());
    }

    fn warningln(&self, message: &str) {
        self.write(format!("WARNING: {message}\n").as_bytes());
    }

    fn errorln(&self, message: &str) {
        self.write(format!("ERROR: {message}\n").as_bytes());
    }
}

/// Trace writing straight to the process stdout
#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutTrace;

impl JobTrace for StdoutTrace {
    fn write(&self, chunk: &[u8]) {
        use std::io::Write;
        let mut out = std::io::stdout().lock();
        // A closed stdout is not worth failing the job over
        let _ = out.write_all(chunk);
        let _ = out.flush();
    }
}

/// In-memory trace
#[derive(Debug, Default, Clone)]
pub struct BufferTrace {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl BufferTrace {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything written so far, lossily decoded
    #[must_use]
    pub fn contents(&self) -> String {
        let buffer = self
            .buffer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl JobTrace for BufferTrace {
    fn write(&self, chunk: &[u8]) {
        self.buffer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .extend_from_slice(chunk);
    }
}

/// Everything the executor needs to know about one job invocation
#[derive(Clone)]
pub struct Job {
    pub id: u64,
    pub project_id: u64,
    /// Slot of this job among the runner's concurrent jobs
    pub concurrent_id: usize,
    /// Working directory of the checkout, e.g. "/builds/group/project"
    pub build_dir: String,
    pub variables: JobVariables,
    pub options: JobOptions,
    pub shell: ShellScript,
    pub trace: Arc<dyn JobTrace>,
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("project_id", &self.project_id)
            .field("concurrent_id", &self.concurrent_id)
            .field("build_dir", &self.build_dir)
            .field("options", &self.options)
            .field("shell", &self.shell.shell)
            .finish_non_exhaustive()
    }
}

/// One step handed to `Executor::run`
#[derive(Debug, Clone)]
pub struct ExecutorCommand {
    /// Script text streamed over stdin
    pub script: String,
    /// Framework-internal step (artifacts, cache, ...)
    pub predefined: bool,
    /// Fires when the user aborts the step
    pub abort: CancellationToken,
}

impl ExecutorCommand {
    /// User-declared step
    pub fn user(script: impl Into<String>, abort: CancellationToken) -> Self {
        Self {
            script: script.into(),
            predefined: false,
            abort,
        }
    }

    /// Framework-internal step
    pub fn predefined(script: impl Into<String>, abort: CancellationToken) -> Self {
        Self {
            script: script.into(),
            predefined: true,
            abort,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn secrets_are_filtered_and_order_is_kept() {
        let vars = JobVariables::new(vec![
            JobVariable::public("CI", "true"),
            JobVariable::secret("TOKEN", "s3cr3t"),
            JobVariable::internal("CI_JOB_ID", "42"),
            JobVariable {
                key: "HIDDEN".to_string(),
                value: "x".to_string(),
                public: true,
                internal: false,
                masked: true,
            },
            JobVariable::public("CI_PROJECT_DIR", "/builds/p"),
        ]);

        let keys: Vec<&str> = vars.public_or_internal().map(|v| v.key.as_str()).collect();
        assert_eq!(keys, vec!["CI", "CI_JOB_ID", "CI_PROJECT_DIR"]);
    }

    #[test]
    fn privileged_query_reads_variable() {
        let mut vars = JobVariables::default();
        assert!(!vars.privileged());

        vars.push(JobVariable::public(PRIVILEGED_VARIABLE, "TRUE"));
        assert!(vars.privileged());

        vars.push(JobVariable::public(PRIVILEGED_VARIABLE, "false"));
        assert!(!vars.privileged(), "last declaration wins");
    }

    #[test]
    fn decode_options() {
        let options = JobOptions::decode(json!({
            "image": "ruby:2.3",
            "services": ["postgres:9.6", "redis"],
            "artifacts": {"paths": ["out/"]}
        }))
        .unwrap();
        assert_eq!(options.image.as_deref(), Some("ruby:2.3"));
        assert_eq!(options.services, vec!["postgres:9.6", "redis"]);

        assert_eq!(JobOptions::decode(serde_json::Value::Null).unwrap(), JobOptions::default());
    }

    #[test]
    fn decode_rejects_malformed_options() {
        assert!(JobOptions::decode(json!({"image": 5})).is_err());
        assert!(JobOptions::decode(json!({"image": " "})).is_err());
        let err = JobOptions::decode(json!({"services": ["redis", ""]})).unwrap_err();
        assert!(err.to_string().contains("services[1]"));
    }

    #[test]
    fn buffer_trace_collects_lines() {
        let trace = BufferTrace::new();
        trace.println("hello");
        trace.errorln("bad");
        assert_eq!(trace.contents(), "hello\nERROR: bad\n");
    }

    #[test]
    fn bash_shell_reads_stdin() {
        let shell = ShellScript::bash();
        assert!(!shell.pass_file);
        assert_eq!(shell.command[..2], ["sh".to_string(), "-c".to_string()]);
    }
}
