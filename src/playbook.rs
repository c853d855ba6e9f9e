//! Playbook loading.
//!
//! A playbook names its hosts and jobs in one YAML document. Host order and job order are both
//! kept exactly as written.

use std::collections::HashSet;
use std::fs::File;
use std::path::Path;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::ConfigError;
use crate::host::{ConnectionParams, HostEntry};
use crate::job::{Job, TaskDef};
use crate::serde::{null_as_default, ordered_mapping, string_or_mapping};

/// Hosts and jobs for one run.
#[derive(Debug, Clone, Default)]
pub struct Playbook {
    pub name: String,
    /// Connect order.
    pub hosts: Vec<HostEntry>,
    /// Declaration order.
    pub jobs: Vec<Job>,
}

#[derive(Debug, Deserialize)]
struct PlaybookSpec {
    #[serde(default, rename = "playbook_name")]
    name: String,
    #[serde(default)]
    hosts: Vec<HostGroupSpec>,
    #[serde(default, deserialize_with = "ordered_mapping")]
    jobs: Vec<(String, JobSpec)>,
}

#[derive(Debug, Deserialize)]
struct HostGroupSpec(#[serde(deserialize_with = "ordered_mapping")] Vec<(String, ConnectionParams)>);

#[derive(Debug, Deserialize)]
struct JobSpec {
    #[serde(default, deserialize_with = "null_as_default")]
    hosts: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    tasks: Vec<TaskSpec>,
}

#[derive(Debug, Deserialize)]
struct TaskSpec(#[serde(deserialize_with = "string_or_mapping")] TaskDef);

impl Playbook {
    /// Reads and validates the playbook at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let spec: PlaybookSpec = serde_yaml::from_reader(file)?;
        let playbook = Self::from_spec(spec)?;
        debug!(
            path = %path.display(),
            hosts = playbook.hosts.len(),
            jobs = playbook.jobs.len(),
            "Loaded playbook"
        );
        Ok(playbook)
    }

    /// Parses and validates a playbook document.
    pub fn from_yaml(document: &str) -> Result<Self, ConfigError> {
        let spec: PlaybookSpec = serde_yaml::from_str(document)?;
        Self::from_spec(spec)
    }

    fn from_spec(spec: PlaybookSpec) -> Result<Self, ConfigError> {
        let mut hosts = Vec::new();
        let mut host_names = HashSet::new();
        for HostGroupSpec(group) in spec.hosts {
            for (name, connection) in group {
                if !host_names.insert(name.clone()) {
                    return Err(ConfigError::DuplicateHost(name));
                }
                if connection.user.is_empty() {
                    return Err(ConfigError::MissingUser(name));
                }
                hosts.push(HostEntry { name, connection });
            }
        }

        let mut jobs = Vec::with_capacity(spec.jobs.len());
        let mut job_names = HashSet::new();
        for (name, job) in spec.jobs {
            if !job_names.insert(name.clone()) {
                return Err(ConfigError::DuplicateJob(name));
            }
            let mut tasks = Vec::with_capacity(job.tasks.len());
            for TaskSpec(mut task) in job.tasks {
                if task.script.trim().is_empty() {
                    return Err(ConfigError::EmptyScript {
                        job: name,
                        task: task.name,
                    });
                }
                if task.name.is_empty() {
                    task.name = task.script.clone();
                }
                tasks.push(task);
            }
            for target in job.hosts.iter().filter(|h| !host_names.contains(*h)) {
                warn!(job = %name, host = %target, "Job targets a host that is not defined");
            }
            jobs.push(Job {
                name,
                hosts: job.hosts.into_iter().collect(),
                tasks,
            });
        }

        Ok(Self {
            name: spec.name,
            hosts,
            jobs,
        })
    }

    pub fn host(&self, name: &str) -> Option<&HostEntry> {
        self.hosts.iter().find(|host| host.name == name)
    }
}
