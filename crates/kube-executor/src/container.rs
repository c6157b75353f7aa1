//! Container spec construction
//!
//! Builds the `Container` entries of a job pod. Construction is pure: the
//! same inputs always produce an equal spec, so tests compare specs directly.

use crate::job::JobVariables;
use crate::limits::ResourceLimits;
use k8s_openapi::api::core::v1::{
    Container, EnvVar, ResourceRequirements, SecurityContext, VolumeMount,
};

/// Name of the shared checkout volume
pub const REPO_VOLUME: &str = "repo";

/// Builds containers that share the job's checkout volume and environment.
#[derive(Debug, Clone, Copy)]
pub struct ContainerBuilder<'a> {
    build_dir: &'a str,
    variables: &'a JobVariables,
    privileged: bool,
}

impl<'a> ContainerBuilder<'a> {
    #[must_use]
    pub fn new(build_dir: &'a str, variables: &'a JobVariables, privileged: bool) -> Self {
        Self {
            build_dir,
            variables,
            privileged,
        }
    }

    /// Build one container. An empty `command` keeps the image entrypoint.
    #[must_use]
    pub fn build(
        &self,
        name: &str,
        image: &str,
        limits: &ResourceLimits,
        command: &[String],
    ) -> Container {
        Container {
            name: name.to_string(),
            image: Some(image.to_string()),
            command: (!command.is_empty()).then(|| command.to_vec()),
            env: Some(self.environment()),
            resources: Some(ResourceRequirements {
                limits: (!limits.is_empty()).then(|| limits.clone()),
                ..Default::default()
            }),
            volume_mounts: Some(vec![VolumeMount {
                name: REPO_VOLUME.to_string(),
                mount_path: self.mount_path(),
                ..Default::default()
            }]),
            security_context: Some(SecurityContext {
                privileged: Some(self.privileged),
                ..Default::default()
            }),
            // The script arrives over stdin
            stdin: Some(true),
            ..Default::default()
        }
    }

    /// Public and internal variables only; secrets travel through the script.
    fn environment(&self) -> Vec<EnvVar> {
        self.variables
            .public_or_internal()
            .map(|v| EnvVar {
                name: v.key.clone(),
                value: Some(v.value.clone()),
                ..Default::default()
            })
            .collect()
    }

    /// Parent of the build directory, shared by every container in the pod.
    #[must_use]
    pub fn mount_path(&self) -> String {
        shared_mount_path(self.build_dir)
    }
}

/// Drop the last `/`-separated segment of `build_dir`.
///
/// A trailing slash counts as an empty last segment, so `/a/b/` mounts at
/// `/a/b`. A build directory directly under the root mounts at "/".
#[must_use]
pub fn shared_mount_path(build_dir: &str) -> String {
    match build_dir.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => build_dir[..idx].to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobVariable;
    use crate::limits::parse_limits;

    fn variables() -> JobVariables {
        JobVariables::new(vec![
            JobVariable::public("CI", "true"),
            JobVariable::secret("CI_JOB_TOKEN", "hunter2"),
            JobVariable::internal("CI_PROJECT_DIR", "/test/build"),
        ])
    }

    #[test]
    fn test_build_container() {
        let vars = variables();
        let builder = ContainerBuilder::new("/test/build", &vars, true);
        let command = vec!["test".to_string(), "command".to_string()];

        let container = builder.build("test", "image", &ResourceLimits::new(), &command);

        let expected = Container {
            name: "test".to_string(),
            image: Some("image".to_string()),
            command: Some(command.clone()),
            env: Some(vec![
                EnvVar {
                    name: "CI".to_string(),
                    value: Some("true".to_string()),
                    ..Default::default()
                },
                EnvVar {
                    name: "CI_PROJECT_DIR".to_string(),
                    value: Some("/test/build".to_string()),
                    ..Default::default()
                },
            ]),
            resources: Some(ResourceRequirements::default()),
            volume_mounts: Some(vec![VolumeMount {
                name: "repo".to_string(),
                mount_path: "/test".to_string(),
                ..Default::default()
            }]),
            security_context: Some(SecurityContext {
                privileged: Some(true),
                ..Default::default()
            }),
            stdin: Some(true),
            ..Default::default()
        };

        assert_eq!(container, expected);
    }

    #[test]
    fn build_is_deterministic() {
        let vars = variables();
        let limits = parse_limits("100m", "100Mi").unwrap();
        let builder = ContainerBuilder::new("/builds/group/project", &vars, false);

        let first = builder.build("build", "ruby:2.3", &limits, &[]);
        let second = builder.build("build", "ruby:2.3", &limits, &[]);
        assert_eq!(first, second);

        assert_eq!(first.command, None);
        assert_eq!(
            first.resources.as_ref().and_then(|r| r.limits.clone()),
            Some(limits)
        );
        assert_eq!(
            first.security_context.and_then(|s| s.privileged),
            Some(false)
        );
    }

    #[test]
    fn secrets_never_reach_environment() {
        let vars = variables();
        let container =
            ContainerBuilder::new("/b/p", &vars, false).build("svc-0", "redis", &ResourceLimits::new(), &[]);

        let env = container.env.unwrap_or_default();
        assert!(env.iter().all(|e| e.name != "CI_JOB_TOKEN"));
        assert!(env
            .iter()
            .all(|e| e.value.as_deref() != Some("hunter2")));
    }

    #[test]
    fn mount_path_is_parent_directory() {
        assert_eq!(shared_mount_path("/builds/group/project"), "/builds/group");
        assert_eq!(shared_mount_path("/builds/group/project/"), "/builds/group/project");
        assert_eq!(shared_mount_path("/test"), "/");
        assert_eq!(shared_mount_path("project"), "/");
    }
}
