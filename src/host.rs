//! SSH Hosts.
//!
//! One SSH connection is created for one `HostEntry`. Each connection runs its tasks in its own
//! tokio task, in parallel with other connections.

use std::fmt;
use std::path::PathBuf;

use colored::*;
use colourado::Color;
use serde::Deserialize;

fn default_port() -> u16 {
    22
}

/// How to reach and authenticate with one host.
#[derive(Clone, Deserialize)]
pub struct ConnectionParams {
    /// Address (hostname or IP) to connect to.
    #[serde(rename = "host")]
    pub address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: Option<String>,
    /// Path to a private key file. May start with `~/`.
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default)]
    pub passphrase: Option<String>,
}

impl ConnectionParams {
    pub fn new(address: &str, user: &str) -> Self {
        Self {
            address: address.to_string(),
            port: default_port(),
            user: user.to_string(),
            password: None,
            private_key: None,
            passphrase: None,
        }
    }
}

// Secrets stay out of logs.
impl fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionParams")
            .field("address", &self.address)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("private_key", &self.private_key)
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// A named host in the playbook.
#[derive(Debug, Clone)]
pub struct HostEntry {
    /// Unique name that jobs use to target this host.
    pub name: String,
    pub connection: ConnectionParams,
}

impl HostEntry {
    pub fn new(name: &str, connection: ConnectionParams) -> Self {
        Self {
            name: name.to_string(),
            connection,
        }
    }

    /// For pretty-printing the host name.
    /// Surrounds with brackets and colors it with the given color.
    pub fn prettify(&self, color: Color) -> ColoredString {
        let r = (color.red * 255.0) as u8;
        let g = (color.green * 255.0) as u8;
        let b = (color.blue * 255.0) as u8;
        format!("{}", self).truecolor(r, g, b)
    }
}

impl fmt::Display for HostEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{}]", self.name)
    }
}

/// Expands a leading `~` or `~/` to the current user's home directory.
///
/// Other paths are returned unchanged. `~user` forms are not supported.
pub fn expand_tilde(path: &str) -> Result<PathBuf, String> {
    let rest = match path.strip_prefix('~') {
        Some(rest) => rest,
        None => return Ok(PathBuf::from(path)),
    };
    if !rest.is_empty() && !rest.starts_with('/') {
        return Err(format!("unsupported home directory form in '{}'", path));
    }
    let home = dirs::home_dir().ok_or_else(|| "failed to get user home directory".to_string())?;
    match rest.trim_start_matches('/') {
        "" => Ok(home),
        tail => Ok(home.join(tail)),
    }
}
