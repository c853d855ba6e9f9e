//! Direct SSH sessions over libssh2.
//!
//! Used for hosts whose playbook entry carries a password or a key passphrase, which OpenSSH in
//! batch mode cannot take. libssh2 calls block, so each one runs on tokio's blocking pool.

use std::fmt;
use std::io::{self, Read};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use ssh2::{CheckResult, KnownHostFileKind};
use tracing::{debug, info, warn};

use crate::error::{CloseError, ConnectError, ExecError};
use crate::host::{expand_tilde, ConnectionParams, HostEntry};
use crate::session::{classify, key_file, Session, TaskOutput};

const KNOWN_HOSTS: &str = "~/.ssh/known_hosts";

/// One way of authenticating, tried in the order `auth_methods` returns them.
#[derive(Clone, PartialEq, Eq)]
pub enum AuthMethod {
    PublicKey {
        path: PathBuf,
        passphrase: Option<String>,
    },
    Password(String),
    Agent,
}

impl AuthMethod {
    pub fn name(&self) -> &'static str {
        match self {
            Self::PublicKey { .. } => "publickey",
            Self::Password(_) => "password",
            Self::Agent => "agent",
        }
    }
}

impl fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PublicKey { path, passphrase } => f
                .debug_struct("PublicKey")
                .field("path", path)
                .field("passphrase", &passphrase.as_ref().map(|_| "<redacted>"))
                .finish(),
            Self::Password(_) => f.write_str("Password(<redacted>)"),
            Self::Agent => f.write_str("Agent"),
        }
    }
}

/// Authentication methods for `host`. The private key comes before the password; with neither,
/// ssh-agent is asked.
pub fn auth_methods(host: &HostEntry) -> Result<Vec<AuthMethod>, ConnectError> {
    let params = &host.connection;
    let mut methods = Vec::new();
    match key_file(host)? {
        Some(path) => methods.push(AuthMethod::PublicKey {
            path,
            passphrase: params.passphrase.clone(),
        }),
        None if params.passphrase.is_some() => {
            warn!(host = %host.name, "Ignoring key passphrase: no private_key is set");
        }
        None => {}
    }
    if let Some(password) = &params.password {
        methods.push(AuthMethod::Password(password.clone()));
    }
    if methods.is_empty() {
        methods.push(AuthMethod::Agent);
    }
    Ok(methods)
}

/// Opens an authenticated session to `host`.
pub async fn connect(
    host: &HostEntry,
    accept_new_host_keys: bool,
    timeout: Option<Duration>,
) -> Result<DirectSession, ConnectError> {
    let methods = auth_methods(host)?;
    let known_hosts = expand_tilde(KNOWN_HOSTS).map_err(|reason| ConnectError::HostKey {
        host: host.name.clone(),
        reason,
    })?;
    let entry = host.clone();
    let session = tokio::task::spawn_blocking(move || {
        open(&entry, &methods, &known_hosts, accept_new_host_keys, timeout)
    })
    .await
    .map_err(|e| ConnectError::Io {
        host: host.name.clone(),
        source: io::Error::new(io::ErrorKind::Other, e),
    })??;
    Ok(DirectSession {
        host: host.name.clone(),
        session: Some(session),
    })
}

fn open(
    host: &HostEntry,
    methods: &[AuthMethod],
    known_hosts: &Path,
    accept_new_host_keys: bool,
    timeout: Option<Duration>,
) -> Result<ssh2::Session, ConnectError> {
    let ssh_error = |source| ConnectError::Libssh2 {
        host: host.name.clone(),
        source,
    };
    let stream = dial(&host.connection, timeout).map_err(|source| ConnectError::Io {
        host: host.name.clone(),
        source,
    })?;
    let mut session = ssh2::Session::new().map_err(ssh_error)?;
    if let Some(timeout) = timeout {
        session.set_timeout(u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX));
    }
    session.set_tcp_stream(stream);
    session.handshake().map_err(ssh_error)?;
    verify_host_key(&session, host, known_hosts, accept_new_host_keys)?;
    authenticate(&session, host, methods)?;
    // The connect timeout must not cut long-running commands short.
    session.set_timeout(0);
    Ok(session)
}

fn dial(params: &ConnectionParams, timeout: Option<Duration>) -> io::Result<TcpStream> {
    let address = (params.address.as_str(), params.port);
    let timeout = match timeout {
        Some(timeout) => timeout,
        None => return TcpStream::connect(address),
    };
    let mut last_error = None;
    for addr in address.to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => last_error = Some(e),
        }
    }
    Err(last_error.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, "address resolved to nothing")
    }))
}

/// Checks the server's key against the known hosts file, recording it when new keys are accepted.
fn verify_host_key(
    session: &ssh2::Session,
    host: &HostEntry,
    path: &Path,
    accept_new: bool,
) -> Result<(), ConnectError> {
    let params = &host.connection;
    let rejected = |reason: String| ConnectError::HostKey {
        host: host.name.clone(),
        reason,
    };
    let ssh_error = |source| ConnectError::Libssh2 {
        host: host.name.clone(),
        source,
    };

    let (key, key_type) = session
        .host_key()
        .ok_or_else(|| rejected("server sent no host key".to_string()))?;
    let mut known = session.known_hosts().map_err(ssh_error)?;
    if let Err(e) = known.read_file(path, KnownHostFileKind::OpenSSH) {
        if !accept_new {
            return Err(rejected(format!("cannot read {}: {}", path.display(), e)));
        }
    }

    match known.check_port(&params.address, params.port, key) {
        CheckResult::Match => Ok(()),
        CheckResult::Mismatch => Err(rejected(format!(
            "key for {} does not match {}",
            params.address,
            path.display()
        ))),
        CheckResult::NotFound if accept_new => {
            let entry = if params.port == 22 {
                params.address.clone()
            } else {
                format!("[{}]:{}", params.address, params.port)
            };
            known
                .add(&entry, key, "", key_type.into())
                .map_err(ssh_error)?;
            known
                .write_file(path, KnownHostFileKind::OpenSSH)
                .map_err(ssh_error)?;
            info!(host = %host.name, "Recorded new host key");
            Ok(())
        }
        CheckResult::NotFound => Err(rejected(format!(
            "{} is not in {}",
            params.address,
            path.display()
        ))),
        CheckResult::Failure => Err(rejected("host key check failed".to_string())),
    }
}

fn authenticate(
    session: &ssh2::Session,
    host: &HostEntry,
    methods: &[AuthMethod],
) -> Result<(), ConnectError> {
    let user = host.connection.user.as_str();
    for method in methods {
        let attempt = match method {
            AuthMethod::PublicKey { path, passphrase } => {
                session.userauth_pubkey_file(user, None, path, passphrase.as_deref())
            }
            AuthMethod::Password(password) => session.userauth_password(user, password),
            AuthMethod::Agent => session.userauth_agent(user),
        };
        match attempt {
            Ok(()) if session.authenticated() => return Ok(()),
            Ok(()) => {}
            Err(e) => {
                debug!(host = %host.name, method = method.name(), error = %e, "Authentication failed")
            }
        }
    }
    let tried: Vec<_> = methods.iter().map(AuthMethod::name).collect();
    Err(ConnectError::Credentials {
        host: host.name.clone(),
        reason: format!("server rejected {}", tried.join(", ")),
    })
}

/// A libssh2 session. Commands run one at a time on the blocking pool.
pub struct DirectSession {
    host: String,
    session: Option<ssh2::Session>,
}

#[async_trait]
impl Session for DirectSession {
    fn host(&self) -> &str {
        &self.host
    }

    async fn run(&self, script: &str) -> Result<TaskOutput, ExecError> {
        let session = self.session.clone().ok_or(ExecError::Closed)?;
        let script = script.to_string();
        tokio::task::spawn_blocking(move || execute(&session, &script))
            .await
            .map_err(|e| ExecError::Io(io::Error::new(io::ErrorKind::Other, e)))?
    }

    async fn close(&mut self) -> Result<(), CloseError> {
        let session = match self.session.take() {
            Some(session) => session,
            None => return Ok(()),
        };
        let host = self.host.clone();
        tokio::task::spawn_blocking(move || session.disconnect(None, "dispatch finished", None))
            .await
            .map_err(|e| CloseError::Failed {
                host: host.clone(),
                reason: e.to_string(),
            })?
            .map_err(|source| CloseError::Libssh2 { host, source })
    }
}

fn execute(session: &ssh2::Session, script: &str) -> Result<TaskOutput, ExecError> {
    let mut channel = session.channel_session().map_err(ExecError::Libssh2)?;
    channel.exec(script).map_err(ExecError::Libssh2)?;
    let mut stdout = Vec::new();
    channel.read_to_end(&mut stdout)?;
    let mut stderr = Vec::new();
    channel.stderr().read_to_end(&mut stderr)?;
    channel.wait_close().map_err(ExecError::Libssh2)?;

    let signal = channel.exit_signal().map_err(ExecError::Libssh2)?;
    let code = match signal.exit_signal {
        Some(_) => None,
        None => Some(channel.exit_status().map_err(ExecError::Libssh2)?),
    };
    classify(code, &stdout, &stderr)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn host_with(configure: impl FnOnce(&mut ConnectionParams)) -> HostEntry {
        let mut params = ConnectionParams::new("10.0.0.1", "root");
        configure(&mut params);
        HostEntry::new("db1", params)
    }

    #[test]
    fn test_password_only_host_uses_password_auth() {
        let host = host_with(|p| p.password = Some("secret".to_string()));
        assert_eq!(
            auth_methods(&host).unwrap(),
            vec![AuthMethod::Password("secret".to_string())]
        );
    }

    #[test]
    fn test_key_is_tried_before_password() {
        let mut key = tempfile::NamedTempFile::new().unwrap();
        key.write_all(b"not really a key").unwrap();
        let key_path = key.path().to_path_buf();
        let host = host_with(|p| {
            p.private_key = Some(key_path.display().to_string());
            p.passphrase = Some("open sesame".to_string());
            p.password = Some("secret".to_string());
        });
        assert_eq!(
            auth_methods(&host).unwrap(),
            vec![
                AuthMethod::PublicKey {
                    path: key_path,
                    passphrase: Some("open sesame".to_string()),
                },
                AuthMethod::Password("secret".to_string()),
            ]
        );
    }

    #[test]
    fn test_passphrase_without_key_falls_back_to_agent() {
        let host = host_with(|p| p.passphrase = Some("open sesame".to_string()));
        assert_eq!(auth_methods(&host).unwrap(), vec![AuthMethod::Agent]);
    }

    #[test]
    fn test_missing_key_file_is_rejected() {
        let host = host_with(|p| {
            p.private_key = Some("/nonexistent/id_ed25519".to_string());
            p.password = Some("secret".to_string());
        });
        assert!(matches!(
            auth_methods(&host),
            Err(ConnectError::Credentials { .. })
        ));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let printed = format!(
            "{:?}",
            vec![
                AuthMethod::Password("hunter2".to_string()),
                AuthMethod::PublicKey {
                    path: PathBuf::from("/k"),
                    passphrase: Some("open sesame".to_string()),
                },
            ]
        );
        assert!(!printed.contains("hunter2"));
        assert!(!printed.contains("open sesame"));
    }
}
