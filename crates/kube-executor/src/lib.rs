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

#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc, clippy::doc_markdown)]

//! Kubernetes job executor
//!
//! Runs the steps of a CI job inside a short-lived pod. One pod is created
//! per job on the first step, every step's script is streamed into one of
//! its containers over stdin, and the pod is deleted during cleanup.
//!
//! # Architecture
//!
//! - [`limits`] parses CPU/memory limit strings
//! - [`container`] builds the container specs (build, helper, services)
//! - [`pod`] composes the pod and manages its lifecycle
//! - [`exec`] streams scripts into a running container
//! - [`executor`] drives prepare / run / cleanup for the job framework
//! - [`cluster`] is the seam to the orchestrator, backed by `kube`
//! - [`registry`] is the executor table built by the composition root

pub mod cluster;
pub mod config;
pub mod container;
pub mod error;
pub mod exec;
pub mod executor;
pub mod job;
pub mod limits;
pub mod naming;
pub mod pod;
pub mod registry;

// Re-export commonly used types
pub use cluster::{ClusterClient, ExecRequest, KubeCluster, PodRef, PodState};
pub use config::{Config, KubernetesConfig, PollSettings, RunnerConfig};
pub use error::{ClusterError, Error, Result};
pub use executor::{CleanupOutcome, Executor, KubernetesExecutor};
pub use job::{
    BufferTrace, ExecutorCommand, Job, JobOptions, JobTrace, JobVariable, JobVariables,
    SecurityOptions, ShellScript, StdoutTrace,
};
pub use pod::PodPhase;
pub use registry::{ExecutorProvider, ExecutorRegistry, FeaturesInfo, KubernetesProvider};
