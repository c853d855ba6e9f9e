//! The dispatch engine.
//!
//! A run goes through three phases:
//! 1. Connecting: hosts are connected one after another, in playbook order. The first failure
//!    aborts the whole run, after closing whatever was already connected.
//! 2. Executing: one tokio task per host. Each holds an admission gate slot for its whole task
//!    sequence and stops at its first failing task. Other hosts are unaffected.
//! 3. Tearing down: every session is closed, again one gate slot per host. Close errors are
//!    reported and otherwise ignored.

use std::time::Duration;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{ConnectError, DispatchError, ExecError};
use crate::gate::AdmissionGate;
use crate::job::{matching_jobs, resolve, TaskDef};
use crate::playbook::Playbook;
use crate::report::{Event, Phase, Reporter, TaskOutcome};
use crate::session::{Connector, Session, TaskOutput};

/// Maximum number of hosts inside a session operation at once, unless configured otherwise.
pub const DEFAULT_MAX_CONCURRENCY: usize = 10;

#[derive(Debug, Clone)]
pub struct DispatchOptions {
    /// Capacity of the admission gate.
    pub max_concurrency: usize,
    /// Give up on a host's connection attempt after this long.
    pub connect_timeout: Option<Duration>,
    /// Give up on a single task after this long.
    pub task_timeout: Option<Duration>,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            connect_timeout: None,
            task_timeout: None,
        }
    }
}

/// How a host's task sequence ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostStatus {
    /// Every resolved task succeeded.
    Completed,
    /// This task failed and the rest were skipped.
    Failed { task: String },
    /// The run was cancelled before the sequence finished.
    Cancelled,
    /// The worker panicked.
    Crashed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSummary {
    pub host: String,
    /// Number of tasks resolved for this host.
    pub planned: usize,
    /// Number of tasks that succeeded.
    pub succeeded: usize,
    pub status: HostStatus,
}

/// What a finished run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// One entry per host, in playbook order.
    pub hosts: Vec<HostSummary>,
    pub close_failures: usize,
}

impl RunSummary {
    /// Hosts whose task sequence did not complete.
    pub fn failed_hosts(&self) -> impl Iterator<Item = &HostSummary> {
        self.hosts
            .iter()
            .filter(|host| host.status != HostStatus::Completed)
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed_hosts().next().is_none()
    }
}

/// Connects to every host of a playbook and runs each host's jobs.
pub struct Dispatcher<C> {
    connector: C,
    gate: AdmissionGate,
    options: DispatchOptions,
    cancel: CancellationToken,
}

impl<C: Connector> Dispatcher<C> {
    pub fn new(connector: C, options: DispatchOptions) -> Self {
        Self {
            connector,
            gate: AdmissionGate::new(options.max_concurrency),
            options,
            cancel: CancellationToken::new(),
        }
    }

    /// Stop the run early when `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn gate(&self) -> &AdmissionGate {
        &self.gate
    }

    /// Runs the playbook to completion.
    ///
    /// Fails only if some host cannot be connected, in which case no task runs anywhere.
    pub async fn run(
        &self,
        playbook: &Playbook,
        reporter: &Reporter,
    ) -> Result<RunSummary, DispatchError> {
        reporter.phase(Phase::Idle);

        reporter.phase(Phase::Connecting);
        let sessions = match self.connect_all(playbook, reporter).await {
            Ok(sessions) => sessions,
            Err(e) => {
                error!(host = %e.host(), "{}", e);
                reporter.phase(Phase::Aborted);
                reporter.emit(Event::RunAborted {
                    reason: e.to_string(),
                });
                return Err(e.into());
            }
        };

        reporter.phase(Phase::Executing);
        let (sessions, hosts) = self.execute_all(sessions, playbook, reporter).await;

        reporter.phase(Phase::TearingDown);
        let close_failures = self.close_all(sessions, reporter).await;

        reporter.phase(Phase::Done);
        reporter.emit(Event::RunFinished);
        Ok(RunSummary {
            hosts,
            close_failures,
        })
    }

    /// Connects every host in order. On failure, already-open sessions are closed first.
    async fn connect_all(
        &self,
        playbook: &Playbook,
        reporter: &Reporter,
    ) -> Result<Vec<Box<dyn Session>>, ConnectError> {
        let mut sessions = Vec::with_capacity(playbook.hosts.len());
        for host in &playbook.hosts {
            let attempt = async {
                match self.options.connect_timeout {
                    Some(after) => {
                        match tokio::time::timeout(after, self.connector.connect(host)).await {
                            Ok(result) => result,
                            Err(_) => Err(ConnectError::TimedOut {
                                host: host.name.clone(),
                                after,
                            }),
                        }
                    }
                    None => self.connector.connect(host).await,
                }
            };
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Err(ConnectError::Cancelled {
                    host: host.name.clone(),
                }),
                result = attempt => result,
            };
            match result {
                Ok(session) => {
                    info!(host = %host.name, "Connected");
                    reporter.emit(Event::Connected {
                        host: host.name.clone(),
                    });
                    sessions.push(session);
                }
                Err(e) => {
                    if !sessions.is_empty() {
                        warn!(
                            opened = sessions.len(),
                            "Closing sessions opened before the failed connection"
                        );
                        self.close_all(sessions, reporter).await;
                    }
                    return Err(e);
                }
            }
        }
        Ok(sessions)
    }

    /// Runs each session's task sequence in its own worker and waits for all of them.
    ///
    /// Sessions come back in the order they went in, together with one summary per host.
    async fn execute_all(
        &self,
        sessions: Vec<Box<dyn Session>>,
        playbook: &Playbook,
        reporter: &Reporter,
    ) -> (Vec<Box<dyn Session>>, Vec<HostSummary>) {
        let mut names = Vec::with_capacity(sessions.len());
        let mut workers = Vec::with_capacity(sessions.len());
        for session in sessions {
            let host = session.host().to_string();
            for job in matching_jobs(&host, &playbook.jobs) {
                debug!(host = %host, job = %job.name, "Job matched");
            }
            let tasks: Vec<TaskDef> = resolve(&host, &playbook.jobs)
                .into_iter()
                .cloned()
                .collect();
            let worker = HostWorker {
                session,
                tasks,
                gate: self.gate.clone(),
                reporter: reporter.clone(),
                cancel: self.cancel.clone(),
                task_timeout: self.options.task_timeout,
            };
            names.push(host);
            workers.push(tokio::spawn(worker.run()));
        }

        let mut sessions = Vec::with_capacity(workers.len());
        let mut summaries = Vec::with_capacity(workers.len());
        for (host, joined) in names.into_iter().zip(join_all(workers).await) {
            match joined {
                Ok((session, summary)) => {
                    sessions.push(session);
                    summaries.push(summary);
                }
                Err(e) => {
                    // The session went down with the worker; nothing left to close.
                    error!(host = %host, "Worker died: {}", e);
                    summaries.push(HostSummary {
                        host,
                        planned: 0,
                        succeeded: 0,
                        status: HostStatus::Crashed,
                    });
                }
            }
        }
        (sessions, summaries)
    }

    /// Closes every session, each under its own gate slot. Returns the number of failures.
    async fn close_all(&self, sessions: Vec<Box<dyn Session>>, reporter: &Reporter) -> usize {
        let closers = sessions.into_iter().map(|mut session| {
            let gate = self.gate.clone();
            let reporter = reporter.clone();
            tokio::spawn(async move {
                let _permit = gate.acquire().await;
                let host = session.host().to_string();
                match session.close().await {
                    Ok(()) => {
                        reporter.emit(Event::Closed { host });
                        true
                    }
                    Err(e) => {
                        warn!(host = %host, "{}", e);
                        reporter.emit(Event::CloseFailed {
                            host,
                            error: e.to_string(),
                        });
                        false
                    }
                }
            })
        });
        join_all(closers)
            .await
            .into_iter()
            .filter(|closed| !matches!(closed, Ok(true)))
            .count()
    }
}

/// Everything one host's worker owns while executing.
struct HostWorker {
    session: Box<dyn Session>,
    tasks: Vec<TaskDef>,
    gate: AdmissionGate,
    reporter: Reporter,
    cancel: CancellationToken,
    task_timeout: Option<Duration>,
}

impl HostWorker {
    async fn run(self) -> (Box<dyn Session>, HostSummary) {
        let Self {
            session,
            tasks,
            gate,
            reporter,
            cancel,
            task_timeout,
        } = self;
        let host = session.host().to_string();
        let mut summary = HostSummary {
            host: host.clone(),
            planned: tasks.len(),
            succeeded: 0,
            status: HostStatus::Completed,
        };

        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                summary.status = HostStatus::Cancelled;
                return (session, summary);
            }
            permit = gate.acquire() => permit,
        };
        debug!(host = %host, tasks = tasks.len(), "Admitted");

        for task in tasks {
            if cancel.is_cancelled() {
                summary.status = HostStatus::Cancelled;
                break;
            }
            reporter.emit(Event::TaskStarted {
                host: host.clone(),
                task: task.name.clone(),
            });
            let result = run_task(session.as_ref(), &task.script, task_timeout, &cancel).await;
            let outcome = TaskOutcome::new(&host, &task.name, &result);
            reporter.emit(Event::TaskCompleted(outcome));
            match result {
                Ok(_) => summary.succeeded += 1,
                Err(ExecError::Cancelled) => {
                    summary.status = HostStatus::Cancelled;
                    break;
                }
                Err(e) => {
                    warn!(host = %host, task = %task.name, "Task failed: {}", e);
                    summary.status = HostStatus::Failed { task: task.name };
                    break;
                }
            }
        }

        (session, summary)
    }
}

async fn run_task(
    session: &dyn Session,
    script: &str,
    timeout: Option<Duration>,
    cancel: &CancellationToken,
) -> Result<TaskOutput, ExecError> {
    let run = async {
        match timeout {
            Some(limit) => match tokio::time::timeout(limit, session.run(script)).await {
                Ok(result) => result,
                Err(_) => Err(ExecError::TimedOut(limit)),
            },
            None => session.run(script).await,
        }
    };
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ExecError::Cancelled),
        result = run => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(host: &str, status: HostStatus) -> HostSummary {
        HostSummary {
            host: host.to_string(),
            planned: 3,
            succeeded: 1,
            status,
        }
    }

    #[test]
    fn test_failed_hosts() {
        let run = RunSummary {
            hosts: vec![
                summary("a", HostStatus::Completed),
                summary(
                    "b",
                    HostStatus::Failed {
                        task: "build".to_string(),
                    },
                ),
                summary("c", HostStatus::Cancelled),
            ],
            close_failures: 0,
        };
        let failed: Vec<_> = run.failed_hosts().map(|h| h.host.as_str()).collect();
        assert_eq!(failed, vec!["b", "c"]);
        assert!(!run.all_succeeded());
    }

    #[test]
    fn test_empty_run_succeeds() {
        assert!(RunSummary::default().all_succeeded());
    }

    #[test]
    fn test_default_options() {
        let options = DispatchOptions::default();
        assert_eq!(options.max_concurrency, 10);
        assert!(options.task_timeout.is_none());
    }
}
