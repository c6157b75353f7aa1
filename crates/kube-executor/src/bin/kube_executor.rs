/*
 * 5D Labs Agent Platform - Kubernetes Job Executor
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! kube-executor - run a CI job description inside a Kubernetes pod
//!
//! This binary is the composition root:
//! - Loads the runner configuration and the job description
//! - Builds the executor registry and picks the runner's executor
//! - Runs prepare, every step, then cleanup
//! - Maps Ctrl-C to the running step's abort signal

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use kube_executor::{
    CleanupOutcome, Config, ExecutorCommand, ExecutorRegistry, Job, JobOptions, JobVariables,
    ShellScript, StdoutTrace,
};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "kube-executor", version, about = "Run CI jobs in Kubernetes pods")]
struct Cli {
    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a job description to completion
    Run {
        /// Runner configuration file
        #[arg(long, env = "KUBE_EXECUTOR_CONFIG", default_value = "config.yaml")]
        config: PathBuf,

        /// Job description file
        #[arg(long)]
        job: PathBuf,

        /// Runner to use (defaults to the first configured runner)
        #[arg(long)]
        runner: Option<String>,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Job description as written to disk by the framework
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobFile {
    id: u64,
    project_id: u64,
    #[serde(default)]
    concurrent_id: usize,
    build_dir: String,
    #[serde(default)]
    variables: JobVariables,
    /// Untyped options payload, validated by `JobOptions::decode`
    #[serde(default)]
    options: serde_json::Value,
    #[serde(default)]
    shell: Option<ShellScript>,
    steps: Vec<StepFile>,
}

#[derive(Debug, Deserialize)]
struct StepFile {
    #[serde(default)]
    name: Option<String>,
    script: String,
    #[serde(default)]
    predefined: bool,
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,kube=warn".into());
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init(),
    }
}

fn load_job(path: &Path) -> Result<(Job, Vec<StepFile>)> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read job file {}", path.display()))?;
    let file: JobFile = serde_yaml::from_str(&raw).context("Failed to parse job YAML")?;

    let options = JobOptions::decode(file.options)?;
    let job = Job {
        id: file.id,
        project_id: file.project_id,
        concurrent_id: file.concurrent_id,
        build_dir: file.build_dir,
        variables: file.variables,
        options,
        shell: file.shell.unwrap_or_default(),
        trace: Arc::new(StdoutTrace),
    };
    Ok((job, file.steps))
}

async fn run_job(config_path: &Path, job_path: &Path, runner_name: Option<&str>) -> Result<ExitCode> {
    let config = Config::from_file(config_path)?;
    let runner = match runner_name {
        Some(name) => config
            .runner(name)
            .with_context(|| format!("Runner '{name}' not found in configuration"))?,
        None => config
            .runners
            .first()
            .context("Configuration defines no runners")?,
    }
    .clone();

    let (job, steps) = load_job(job_path)?;
    if steps.is_empty() {
        bail!("Job {} has no steps", job.id);
    }
    let trace = job.trace.clone();

    let registry = ExecutorRegistry::with_defaults();
    let mut executor = registry.create(&runner.executor)?;

    info!(runner = %runner.name, executor = %runner.executor, job_id = job.id, "Preparing job");
    if let Err(e) = executor.prepare(&config, &runner, job).await {
        trace.errorln(&format!("Job failed during preparation: {e}"));
        error!(error = %e, "Preparation failed");
        return Ok(ExitCode::FAILURE);
    }

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, aborting current step");
                shutdown.cancel();
            }
        }
    });

    let mut result = Ok(());
    for (index, step) in steps.into_iter().enumerate() {
        let name = step.name.unwrap_or_else(|| format!("step-{index}"));
        info!(step = %name, predefined = step.predefined, "Running step");

        let abort = shutdown.child_token();
        let cmd = if step.predefined {
            ExecutorCommand::predefined(step.script, abort)
        } else {
            ExecutorCommand::user(step.script, abort)
        };

        if let Err(e) = executor.run(cmd).await {
            error!(step = %name, error = %e, "Step failed");
            result = Err(e);
            break;
        }
    }

    match executor.cleanup().await {
        CleanupOutcome::NothingToDelete => info!("No pod to clean up"),
        CleanupOutcome::Deleted(pod) => info!(pod = %pod, "Pod cleaned up"),
        CleanupOutcome::Failed { pod, error } => {
            warn!(pod = %pod, error = %error, "Pod cleanup failed; it may need manual removal");
        }
    }

    Ok(match result {
        Ok(()) => {
            trace.println("Job succeeded");
            ExitCode::SUCCESS
        }
        Err(e) if e.is_abort() => {
            trace.errorln("Job aborted");
            ExitCode::from(2)
        }
        Err(e) => {
            trace.errorln(&format!("Job failed: {e}"));
            ExitCode::FAILURE
        }
    })
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let outcome = match &cli.command {
        Command::Run {
            config,
            job,
            runner,
        } => run_job(config, job, runner.as_deref()).await,
    };

    match outcome {
        Ok(code) => code,
        Err(e) => {
            error!("❌ {e:#}");
            ExitCode::FAILURE
        }
    }
}
