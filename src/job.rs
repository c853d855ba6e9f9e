//! Jobs, tasks, and which of them apply to which host.

use std::collections::HashSet;
use std::str::FromStr;

use serde::Deserialize;
use void::Void;

/// One remote command with a human-readable label.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TaskDef {
    /// Label only. Defaults to the script itself.
    #[serde(default)]
    pub name: String,
    /// The command to execute on the remote host.
    pub script: String,
}

impl TaskDef {
    pub fn new(name: &str, script: &str) -> Self {
        Self {
            name: name.to_string(),
            script: script.to_string(),
        }
    }
}

/// A bare string in the playbook is a task whose label is its script.
impl FromStr for TaskDef {
    type Err = Void;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::new(s, s))
    }
}

/// A named set of target hosts plus an ordered task list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub name: String,
    pub hosts: HashSet<String>,
    pub tasks: Vec<TaskDef>,
}

impl Job {
    pub fn new<'a>(name: &str, hosts: impl IntoIterator<Item = &'a str>, tasks: Vec<TaskDef>) -> Self {
        Self {
            name: name.to_string(),
            hosts: hosts.into_iter().map(str::to_string).collect(),
            tasks,
        }
    }

    /// A job applies to a host iff the host's name is one of its targets.
    pub fn applies_to(&self, host: &str) -> bool {
        self.hosts.contains(host)
    }
}

/// Jobs that apply to `host`, in declaration order.
pub fn matching_jobs<'a>(host: &'a str, jobs: &'a [Job]) -> impl Iterator<Item = &'a Job> + 'a {
    jobs.iter().filter(move |job| job.applies_to(host))
}

/// The ordered task sequence `host` runs: the tasks of every applicable job,
/// concatenated in declaration order. Nothing is deduplicated.
pub fn resolve<'a>(host: &str, jobs: &'a [Job]) -> Vec<&'a TaskDef> {
    jobs.iter()
        .filter(|job| job.applies_to(host))
        .flat_map(|job| job.tasks.iter())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scripts(tasks: &[&TaskDef]) -> Vec<String> {
        tasks.iter().map(|task| task.script.clone()).collect()
    }

    fn job(name: &str, hosts: &[&str], scripts: &[&str]) -> Job {
        let tasks = scripts.iter().map(|s| TaskDef::new(s, s)).collect();
        Job::new(name, hosts.iter().copied(), tasks)
    }

    #[test]
    fn test_no_targets_never_matches() {
        let jobs = vec![job("empty", &[], &["true"])];
        assert!(resolve("a", &jobs).is_empty());
    }

    #[test]
    fn test_single_target() {
        let jobs = vec![job("only_a", &["a"], &["true"])];
        assert_eq!(scripts(&resolve("a", &jobs)), vec!["true"]);
        assert!(resolve("b", &jobs).is_empty());
    }

    #[test]
    fn test_target_among_others() {
        let jobs = vec![job("both", &["a", "other"], &["true"])];
        assert_eq!(scripts(&resolve("a", &jobs)), vec!["true"]);
        assert_eq!(scripts(&resolve("other", &jobs)), vec!["true"]);
        assert!(resolve("b", &jobs).is_empty());
    }

    #[test]
    fn test_overlapping_jobs_concatenate_without_dedup() {
        let jobs = vec![
            job("first", &["a"], &["make", "make install"]),
            job("disjoint", &["b"], &["skip me"]),
            job("second", &["a", "b"], &["make"]),
        ];
        assert_eq!(
            scripts(&resolve("a", &jobs)),
            vec!["make", "make install", "make"]
        );
        assert_eq!(scripts(&resolve("b", &jobs)), vec!["skip me", "make"]);
    }

    #[test]
    fn test_resolve_is_stable() {
        let jobs = vec![
            job("deploy", &["a"], &["make", "systemctl restart app"]),
            job("check", &["a", "b"], &["echo ok"]),
        ];
        assert_eq!(resolve("a", &jobs), resolve("a", &jobs));
        assert_eq!(
            scripts(&resolve("a", &jobs)),
            vec!["make", "systemctl restart app", "echo ok"]
        );
    }

    #[test]
    fn test_matching_jobs_order() {
        let jobs = vec![
            job("z", &["a"], &["1"]),
            job("y", &["b"], &["2"]),
            job("x", &["a"], &["3"]),
        ];
        let names: Vec<_> = matching_jobs("a", &jobs).map(|j| j.name.as_str()).collect();
        assert_eq!(names, vec!["z", "x"]);
    }

    #[test]
    fn test_bare_string_task() {
        let task: TaskDef = "uptime".parse().unwrap();
        assert_eq!(task, TaskDef::new("uptime", "uptime"));
    }
}
