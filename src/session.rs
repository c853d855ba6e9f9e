//! Remote sessions.
//!
//! The dispatcher only sees the `Connector` and `Session` traits. `SshConnector` implements them
//! over OpenSSH multiplexed connections, or over libssh2 (`crate::direct`) for hosts that carry a
//! password or key passphrase in the playbook.

use std::path::PathBuf;
use std::process::Output;
use std::time::Duration;

use async_trait::async_trait;
use openssh::{KnownHosts, Session as SSHSession, SessionBuilder};
use tracing::debug;

use crate::direct;
use crate::error::{CloseError, ConnectError, ExecError};
use crate::host::{expand_tilde, ConnectionParams, HostEntry};

/// Captured output of a command that exited successfully.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskOutput {
    pub stdout: String,
    pub stderr: String,
}

/// A live connection to one host.
#[async_trait]
pub trait Session: Send + Sync {
    /// Name of the host this session is connected to.
    fn host(&self) -> &str;

    /// Runs `script` on the remote host and captures its output.
    async fn run(&self, script: &str) -> Result<TaskOutput, ExecError>;

    /// Tears the connection down. Closing twice is a no-op.
    async fn close(&mut self) -> Result<(), CloseError>;
}

/// Opens sessions.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, host: &HostEntry) -> Result<Box<dyn Session>, ConnectError>;
}

/// Which SSH client library a host is reached with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// OpenSSH control master. Authenticates with key files and ssh-agent.
    Mux,
    /// libssh2. Takes a password and key passphrase inline.
    Direct,
}

impl Transport {
    pub fn for_host(params: &ConnectionParams) -> Self {
        // OpenSSH runs in batch mode and never prompts for secrets.
        if params.password.is_some() || params.passphrase.is_some() {
            Self::Direct
        } else {
            Self::Mux
        }
    }
}

/// Connects to hosts, verifying host keys against `~/.ssh/known_hosts`.
#[derive(Debug, Clone)]
pub struct SshConnector {
    accept_new_host_keys: bool,
    connect_timeout: Option<Duration>,
}

impl SshConnector {
    pub fn new() -> Self {
        Self {
            accept_new_host_keys: false,
            connect_timeout: None,
        }
    }

    /// Record keys of hosts never seen before instead of rejecting them.
    pub fn accept_new_host_keys(mut self, accept: bool) -> Self {
        self.accept_new_host_keys = accept;
        self
    }

    pub fn connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn builder(&self, host: &HostEntry) -> Result<SessionBuilder, ConnectError> {
        let params = &host.connection;
        let known_hosts = if self.accept_new_host_keys {
            KnownHosts::Add
        } else {
            KnownHosts::Strict
        };
        let mut builder = SessionBuilder::default();
        builder
            .user(params.user.clone())
            .port(params.port)
            .known_hosts_check(known_hosts);
        if let Some(timeout) = self.connect_timeout {
            builder.connect_timeout(timeout);
        }
        if let Some(path) = key_file(host)? {
            builder.keyfile(path);
        }
        Ok(builder)
    }

    async fn connect_mux(&self, host: &HostEntry) -> Result<Box<dyn Session>, ConnectError> {
        let builder = self.builder(host)?;
        let session = builder
            .connect_mux(&host.connection.address)
            .await
            .map_err(|source| ConnectError::Ssh {
                host: host.name.clone(),
                source,
            })?;
        Ok(Box::new(SshSession {
            host: host.name.clone(),
            session: Some(session),
        }))
    }
}

/// Resolves the host's private key path and checks that the file exists.
pub(crate) fn key_file(host: &HostEntry) -> Result<Option<PathBuf>, ConnectError> {
    let key = match &host.connection.private_key {
        Some(key) => key,
        None => return Ok(None),
    };
    let path = expand_tilde(key).map_err(|reason| ConnectError::KeyPath {
        host: host.name.clone(),
        path: key.clone(),
        reason,
    })?;
    if !path.is_file() {
        return Err(ConnectError::Credentials {
            host: host.name.clone(),
            reason: format!("private key file '{}' does not exist", path.display()),
        });
    }
    Ok(Some(path))
}

impl Default for SshConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(&self, host: &HostEntry) -> Result<Box<dyn Session>, ConnectError> {
        let transport = Transport::for_host(&host.connection);
        debug!(
            host = %host.name,
            address = %host.connection.address,
            port = host.connection.port,
            ?transport,
            "Connecting"
        );
        match transport {
            Transport::Mux => self.connect_mux(host).await,
            Transport::Direct => {
                let session =
                    direct::connect(host, self.accept_new_host_keys, self.connect_timeout).await?;
                Ok(Box::new(session))
            }
        }
    }
}

/// SSH session wrapper.
pub struct SshSession {
    host: String,
    session: Option<SSHSession>,
}

#[async_trait]
impl Session for SshSession {
    fn host(&self) -> &str {
        &self.host
    }

    async fn run(&self, script: &str) -> Result<TaskOutput, ExecError> {
        let session = self.session.as_ref().ok_or(ExecError::Closed)?;
        let output = session
            .raw_command(script)
            .output()
            .await
            .map_err(ExecError::from_ssh)?;
        check_output(output)
    }

    async fn close(&mut self) -> Result<(), CloseError> {
        match self.session.take() {
            Some(session) => session.close().await.map_err(|source| CloseError::Ssh {
                host: self.host.clone(),
                source,
            }),
            None => Ok(()),
        }
    }
}

/// Turns a finished remote process into its captured output, or the way it failed.
pub fn check_output(output: Output) -> Result<TaskOutput, ExecError> {
    classify(output.status.code(), &output.stdout, &output.stderr)
}

/// `code` is `None` when the command ended without an exit status.
pub(crate) fn classify(
    code: Option<i32>,
    stdout: &[u8],
    stderr: &[u8],
) -> Result<TaskOutput, ExecError> {
    let stdout = String::from_utf8_lossy(stdout).into_owned();
    let stderr = String::from_utf8_lossy(stderr).into_owned();
    match code {
        Some(0) => Ok(TaskOutput { stdout, stderr }),
        Some(code) => Err(ExecError::NonZeroExit {
            code,
            stdout,
            stderr,
        }),
        None => Err(ExecError::Terminated { stdout, stderr }),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::os::unix::process::ExitStatusExt;
    use std::process::ExitStatus;

    use super::*;

    fn output(raw_status: i32, stdout: &str, stderr: &str) -> Output {
        Output {
            status: ExitStatus::from_raw(raw_status),
            stdout: stdout.as_bytes().to_vec(),
            stderr: stderr.as_bytes().to_vec(),
        }
    }

    #[test]
    fn test_success_captures_output() {
        let captured = check_output(output(0, "ok\n", "")).unwrap();
        assert_eq!(captured.stdout, "ok\n");
        assert!(captured.stderr.is_empty());
    }

    #[test]
    fn test_non_zero_exit() {
        let error = check_output(output(3 << 8, "half", "boom\n")).unwrap_err();
        match error {
            ExecError::NonZeroExit {
                code,
                stdout,
                stderr,
            } => {
                assert_eq!(code, 3);
                assert_eq!(stdout, "half");
                assert_eq!(stderr, "boom\n");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_killed_by_signal_is_terminated() {
        // SIGKILL, no exit code.
        let error = check_output(output(9, "", "")).unwrap_err();
        assert!(matches!(error, ExecError::Terminated { .. }));
        assert!(error.is_abnormal());
    }

    #[test]
    fn test_invalid_utf8_is_lossy() {
        let mut raw = output(0, "", "");
        raw.stdout = vec![b'a', 0xff, b'b'];
        assert_eq!(check_output(raw).unwrap().stdout, "a\u{FFFD}b");
    }

    #[test]
    fn test_missing_key_file_is_rejected() {
        let mut params = crate::host::ConnectionParams::new("10.0.0.1", "root");
        params.private_key = Some("/nonexistent/id_ed25519".to_string());
        let host = HostEntry::new("web1", params);
        let error = match SshConnector::new().builder(&host) {
            Ok(_) => panic!("a missing key file must be rejected"),
            Err(error) => error,
        };
        assert!(matches!(error, ConnectError::Credentials { .. }));
        assert_eq!(error.host(), "web1");
    }

    #[test]
    fn test_other_users_home_is_a_key_path_error() {
        let mut params = crate::host::ConnectionParams::new("10.0.0.1", "root");
        params.private_key = Some("~alice/.ssh/id_rsa".to_string());
        let host = HostEntry::new("web1", params);
        let error = match SshConnector::new().builder(&host) {
            Ok(_) => panic!("a ~user key path must be rejected"),
            Err(error) => error,
        };
        match error {
            ConnectError::KeyPath { host, path, .. } => {
                assert_eq!(host, "web1");
                assert_eq!(path, "~alice/.ssh/id_rsa");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_transport_follows_inline_secrets() {
        let mut params = crate::host::ConnectionParams::new("10.0.0.1", "root");
        assert_eq!(Transport::for_host(&params), Transport::Mux);
        params.private_key = Some("~/.ssh/id_ed25519".to_string());
        assert_eq!(Transport::for_host(&params), Transport::Mux);
        params.passphrase = Some("open sesame".to_string());
        assert_eq!(Transport::for_host(&params), Transport::Direct);

        let mut params = crate::host::ConnectionParams::new("10.0.0.2", "root");
        params.password = Some("secret".to_string());
        assert_eq!(Transport::for_host(&params), Transport::Direct);
    }
}
