use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Top-level failure of a dispatch run.
///
/// Only configuration and connection problems end a run early. Task and
/// teardown failures are reported per host and never surface here.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Connect(#[from] ConnectError),
}

/// The playbook could not be read or does not describe a valid run.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read playbook {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse playbook: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Host '{0}' is defined more than once")]
    DuplicateHost(String),
    #[error("Job '{0}' is defined more than once")]
    DuplicateJob(String),
    #[error("Host '{0}' has no user")]
    MissingUser(String),
    #[error("Task '{task}' of job '{job}' has an empty script")]
    EmptyScript { job: String, task: String },
}

/// A host could not be connected. Fatal to the whole run.
#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("[{host}] Failed to resolve private key path '{path}': {reason}")]
    KeyPath {
        host: String,
        path: String,
        reason: String,
    },
    #[error("[{host}] Unusable credentials: {reason}")]
    Credentials { host: String, reason: String },
    #[error("[{host}] Failed to connect SSH session: {source}")]
    Ssh {
        host: String,
        #[source]
        source: openssh::Error,
    },
    #[error("[{host}] Failed to reach host: {source}")]
    Io {
        host: String,
        #[source]
        source: std::io::Error,
    },
    #[error("[{host}] Failed to set up SSH session: {source}")]
    Libssh2 {
        host: String,
        #[source]
        source: ssh2::Error,
    },
    #[error("[{host}] Host key rejected: {reason}")]
    HostKey { host: String, reason: String },
    #[error("[{host}] Connection attempt timed out after {after:?}")]
    TimedOut { host: String, after: Duration },
    #[error("[{host}] Connection attempt cancelled")]
    Cancelled { host: String },
}

impl ConnectError {
    /// Name of the host that failed to connect.
    pub fn host(&self) -> &str {
        match self {
            Self::KeyPath { host, .. }
            | Self::Credentials { host, .. }
            | Self::Ssh { host, .. }
            | Self::Io { host, .. }
            | Self::Libssh2 { host, .. }
            | Self::HostKey { host, .. }
            | Self::TimedOut { host, .. }
            | Self::Cancelled { host } => host,
        }
    }
}

/// A task failed on its host. Fatal only to that host's remaining tasks.
#[derive(Error, Debug)]
pub enum ExecError {
    #[error("Command exited with status {code}. Stderr: {}", stderr.trim_end())]
    NonZeroExit {
        code: i32,
        stdout: String,
        stderr: String,
    },
    #[error(
        "Command terminated without an exit status; connection likely closed unexpectedly. Stderr: {}",
        stderr.trim_end()
    )]
    Terminated { stdout: String, stderr: String },
    #[error("Connection to the remote host was severed")]
    Disconnected,
    #[error("SSH session error: {0}")]
    Ssh(#[source] openssh::Error),
    #[error("SSH session error: {0}")]
    Libssh2(#[source] ssh2::Error),
    #[error("Failed to read command output: {0}")]
    Io(#[from] std::io::Error),
    #[error("Command timed out after {0:?}")]
    TimedOut(Duration),
    #[error("Command cancelled")]
    Cancelled,
    #[error("Session is already closed")]
    Closed,
}

impl ExecError {
    /// Classifies a transport error raised while running a command.
    pub fn from_ssh(error: openssh::Error) -> Self {
        match error {
            openssh::Error::Disconnected => Self::Disconnected,
            openssh::Error::RemoteProcessTerminated => Self::Terminated {
                stdout: String::new(),
                stderr: String::new(),
            },
            other => Self::Ssh(other),
        }
    }

    /// Whatever the command printed to stdout before failing.
    pub fn stdout(&self) -> &str {
        match self {
            Self::NonZeroExit { stdout, .. } | Self::Terminated { stdout, .. } => stdout,
            _ => "",
        }
    }

    /// True when the command did not end with a clean exit status.
    pub fn is_abnormal(&self) -> bool {
        !matches!(self, Self::NonZeroExit { .. })
    }
}

/// A session could not be torn down cleanly. Never fatal.
#[derive(Error, Debug)]
pub enum CloseError {
    #[error("[{host}] Error while terminating: {source}")]
    Ssh {
        host: String,
        #[source]
        source: openssh::Error,
    },
    #[error("[{host}] Error while terminating: {source}")]
    Libssh2 {
        host: String,
        #[source]
        source: ssh2::Error,
    },
    #[error("[{host}] Error while terminating: {reason}")]
    Failed { host: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_zero_exit_is_not_abnormal() {
        let error = ExecError::NonZeroExit {
            code: 2,
            stdout: "partial".to_string(),
            stderr: "no such file\n".to_string(),
        };
        assert!(!error.is_abnormal());
        assert_eq!(error.stdout(), "partial");
        assert_eq!(
            error.to_string(),
            "Command exited with status 2. Stderr: no such file"
        );
    }

    #[test]
    fn test_terminated_is_abnormal() {
        let error = ExecError::from_ssh(openssh::Error::RemoteProcessTerminated);
        assert!(error.is_abnormal());
        assert!(matches!(error, ExecError::Terminated { .. }));
        assert!(ExecError::from_ssh(openssh::Error::Disconnected).is_abnormal());
    }

    #[test]
    fn test_connect_error_names_host() {
        let error = ConnectError::Cancelled {
            host: "web1".to_string(),
        };
        assert_eq!(error.host(), "web1");
        let error: DispatchError = error.into();
        assert_eq!(error.to_string(), "[web1] Connection attempt cancelled");
    }
}
