//! Dispatch: A Playbook-Driven Multi-Host SSH Task Runner.

// Serde helper module.
mod serde;
// Command line arguments and configuration.
pub mod config;
// How to parse and represent hosts.
pub mod host;
// How to represent jobs and match them to hosts.
pub mod job;
// Playbook loading.
pub mod playbook;
// Bounded concurrency.
pub mod gate;
// SSH session wrapper.
pub mod session;
// libssh2 sessions for inline passwords and passphrases.
pub mod direct;
// Connect, execute, tear down.
pub mod scheduler;
// Events and their printer.
pub mod report;
// Error handling.
pub mod error;

pub use config::{Config, Mode};
pub use error::{CloseError, ConfigError, ConnectError, DispatchError, ExecError};
pub use gate::{AdmissionGate, GatePermit};
pub use host::{ConnectionParams, HostEntry};
pub use job::{resolve, Job, TaskDef};
pub use playbook::Playbook;
pub use report::{Event, FailureKind, Phase, Printer, Reporter, TaskOutcome};
pub use scheduler::{DispatchOptions, Dispatcher, HostStatus, HostSummary, RunSummary};
pub use session::{Connector, Session, SshConnector, TaskOutput, Transport};
