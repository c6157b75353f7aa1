use crate::config::RunnerConfig;
use crate::job::Job;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

const MAX_K8S_NAME_LENGTH: usize = 63;
/// Characters the API server appends to a generateName prefix
const GENERATED_SUFFIX_LENGTH: usize = 5;

pub struct PodNaming;

impl PodNaming {
    /// Generate-name prefix unique to the runner, project and concurrency slot
    /// Format: runner-{token8}-project-{project_id}-concurrent-{n}-
    /// The server appends a random suffix, so concurrent jobs never collide
    pub fn generate_name(runner: &RunnerConfig, job: &Job) -> String {
        let base = format!(
            "runner-{}-project-{}-concurrent-{}",
            runner.short_token(),
            job.project_id,
            job.concurrent_id
        );

        let available = MAX_K8S_NAME_LENGTH - GENERATED_SUFFIX_LENGTH - 1;
        let trimmed = Self::ensure_k8s_name_length(&Self::sanitize(&base), available);

        format!("{trimmed}-")
    }

    /// Lowercase and replace anything outside [a-z0-9-]
    fn sanitize(name: &str) -> String {
        let mut out = String::with_capacity(name.len());
        let mut last_dash = false;
        for c in name.chars() {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_lowercase() || c.is_ascii_digit() {
                out.push(c);
                last_dash = false;
            } else if !last_dash {
                out.push('-');
                last_dash = true;
            }
        }
        let trimmed = out.trim_matches('-');
        if trimmed.is_empty() {
            "runner".to_string()
        } else {
            trimmed.to_string()
        }
    }

    fn ensure_k8s_name_length(name: &str, limit: usize) -> String {
        if name.len() <= limit {
            return name.to_string();
        }

        // Keep the readable head, replace the tail with a stable hash
        let hash = Self::hash_string(name);
        let head_len = limit.saturating_sub(hash.len() + 1);
        let head = name[..head_len].trim_end_matches('-');
        format!("{head}-{hash}")
    }

    fn hash_string(input: &str) -> String {
        let mut hasher = DefaultHasher::new();
        input.hash(&mut hasher);
        format!("{:016x}", hasher.finish())[..8].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{BufferTrace, JobOptions, JobVariables, ShellScript};
    use std::sync::Arc;

    fn build_job(project_id: u64) -> Job {
        Job {
            id: 7,
            project_id,
            concurrent_id: 0,
            build_dir: "/builds/group/project".to_string(),
            variables: JobVariables::default(),
            options: JobOptions::default(),
            shell: ShellScript::bash(),
            trace: Arc::new(BufferTrace::new()),
        }
    }

    #[test]
    fn generate_name_includes_token_and_project() {
        let mut runner = RunnerConfig::new("k8s");
        runner.token = "AbCdEf123456".to_string();

        let name = PodNaming::generate_name(&runner, &build_job(42));
        assert_eq!(name, "runner-abcdef12-project-42-concurrent-0-");
    }

    #[test]
    fn generate_name_fits_with_server_suffix() {
        let mut runner = RunnerConfig::new("k8s");
        runner.token = "x".repeat(40);
        let mut job = build_job(u64::MAX);
        job.concurrent_id = usize::MAX;

        let name = PodNaming::generate_name(&runner, &job);
        assert!(name.len() + GENERATED_SUFFIX_LENGTH <= MAX_K8S_NAME_LENGTH);
        assert!(name.starts_with("runner-"));
        assert!(name.ends_with('-'));
    }

    #[test]
    fn sanitize_strips_invalid_characters() {
        assert_eq!(PodNaming::sanitize("Runner_A..b"), "runner-a-b");
        assert_eq!(PodNaming::sanitize("__"), "runner");
    }

    #[test]
    fn long_names_are_hashed_deterministically() {
        let long = "a".repeat(100);
        let first = PodNaming::ensure_k8s_name_length(&long, 57);
        let second = PodNaming::ensure_k8s_name_length(&long, 57);
        assert_eq!(first, second);
        assert!(first.len() <= 57);
    }
}
