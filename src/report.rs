//! Run report: the event stream a dispatch run produces, and the printer that shows it.
//!
//! Events from one host's worker arrive in the order that worker produced them. Events of
//! different hosts interleave arbitrarily.

use std::collections::HashMap;
use std::fmt;
use std::io::{self, Write};

use colored::*;
use colourado::{ColorPalette, PaletteType};
use itertools::zip;

use crate::error::ExecError;
use crate::playbook::Playbook;
use crate::session::TaskOutput;

/// Dispatcher state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Connecting,
    Executing,
    TearingDown,
    Done,
    Aborted,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Executing => "executing",
            Self::TearingDown => "tearing down",
            Self::Done => "done",
            Self::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// How a task failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The command ran to completion and exited non-zero.
    NonZeroExit(i32),
    /// The command ended without an exit status (EOF, signal, severed connection).
    Abnormal,
    /// Session-level error before the command could finish.
    Session,
    TimedOut,
    Cancelled,
}

impl From<&ExecError> for FailureKind {
    fn from(error: &ExecError) -> Self {
        match error {
            ExecError::NonZeroExit { code, .. } => Self::NonZeroExit(*code),
            ExecError::Terminated { .. } | ExecError::Disconnected | ExecError::Io(_) => {
                Self::Abnormal
            }
            ExecError::Ssh(_) | ExecError::Libssh2(_) | ExecError::Closed => Self::Session,
            ExecError::TimedOut(_) => Self::TimedOut,
            ExecError::Cancelled => Self::Cancelled,
        }
    }
}

/// Result of one executed task. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOutcome {
    pub host: String,
    pub task: String,
    pub success: bool,
    /// Captured stdout.
    pub output: String,
    pub error: Option<String>,
    pub failure: Option<FailureKind>,
}

impl TaskOutcome {
    pub fn new(host: &str, task: &str, result: &Result<TaskOutput, ExecError>) -> Self {
        match result {
            Ok(output) => Self {
                host: host.to_string(),
                task: task.to_string(),
                success: true,
                output: output.stdout.clone(),
                error: None,
                failure: None,
            },
            Err(error) => Self {
                host: host.to_string(),
                task: task.to_string(),
                success: false,
                output: error.stdout().to_string(),
                error: Some(error.to_string()),
                failure: Some(error.into()),
            },
        }
    }
}

/// Something observable that happened during a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Phase(Phase),
    Connected { host: String },
    TaskStarted { host: String, task: String },
    TaskCompleted(TaskOutcome),
    Closed { host: String },
    CloseFailed { host: String, error: String },
    RunAborted { reason: String },
    RunFinished,
}

/// Sending half of the event stream. Cheap to clone; never blocks.
#[derive(Debug, Clone)]
pub struct Reporter {
    tx: flume::Sender<Event>,
}

impl Reporter {
    pub fn channel() -> (Self, flume::Receiver<Event>) {
        let (tx, rx) = flume::unbounded();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: Event) {
        // Nobody listening is fine.
        let _ = self.tx.send(event);
    }

    pub fn phase(&self, phase: Phase) {
        self.emit(Event::Phase(phase));
    }
}

/// Prints events for a terminal, one colored prefix per host.
pub struct Printer {
    prefixes: HashMap<String, ColoredString>,
    /// Show captured output of successful tasks.
    debug: bool,
}

impl Printer {
    pub fn new(playbook: &Playbook, debug: bool) -> Self {
        let mut prefixes = HashMap::with_capacity(playbook.hosts.len());
        if !playbook.hosts.is_empty() {
            let colors =
                ColorPalette::new(playbook.hosts.len() as u32, PaletteType::Pastel, false).colors;
            for (host, color) in zip(&playbook.hosts, colors) {
                prefixes.insert(host.name.clone(), host.prettify(color));
            }
        }
        Self { prefixes, debug }
    }

    fn prefix(&self, host: &str) -> ColoredString {
        self.prefixes
            .get(host)
            .cloned()
            .unwrap_or_else(|| format!("[{}]", host).normal())
    }

    /// Prints every event until all `Reporter`s are dropped.
    pub async fn drain(self, events: flume::Receiver<Event>) {
        while let Ok(event) = events.recv_async().await {
            self.print(&event);
        }
    }

    pub fn print(&self, event: &Event) {
        match event {
            Event::Phase(Phase::Connecting) => eprintln!("{} Connecting to hosts", tag()),
            Event::Phase(Phase::Executing) => eprintln!("{} Running jobs", tag()),
            Event::Phase(Phase::TearingDown) => eprintln!("{} Closing connections", tag()),
            Event::Phase(_) => {}
            Event::Connected { host } => eprintln!("{} Connected to host.", self.prefix(host)),
            Event::TaskStarted { host, task } => {
                println!("{} === {} ===", self.prefix(host), task)
            }
            Event::TaskCompleted(outcome) => self.print_outcome(outcome),
            Event::Closed { host } => eprintln!("{} Terminated connection.", self.prefix(host)),
            Event::CloseFailed { host, error } => {
                eprintln!("{} {}", self.prefix(host), error.yellow())
            }
            Event::RunAborted { reason } => eprintln!("{} Aborting: {}", tag(), reason.red()),
            Event::RunFinished => eprintln!("{} All hosts finished", tag()),
        }
    }

    fn print_outcome(&self, outcome: &TaskOutcome) {
        // Lock so that multi-line output stays together.
        let stdout = std::io::stdout();
        let _ = self.write_outcome(&mut stdout.lock(), outcome);
    }

    /// Writes a finished task, every line carrying the host prefix.
    pub fn write_outcome<W: Write>(&self, out: &mut W, outcome: &TaskOutcome) -> io::Result<()> {
        let prefix = self.prefix(&outcome.host);
        if self.debug || !outcome.success {
            for line in lines(&outcome.output) {
                writeln!(out, "{} {}", prefix, line)?;
            }
        }
        let error = match &outcome.error {
            None => return writeln!(out, "{} === done ({}) ===", prefix, outcome.task),
            Some(error) => error,
        };
        writeln!(out, "{} === failed ({}) ===", prefix, outcome.task)?;
        for line in lines(error) {
            writeln!(out, "{} {}", prefix, line.red())?;
        }
        if outcome.failure != Some(FailureKind::Cancelled) {
            writeln!(out, "{} Skipping remaining tasks.", prefix)?;
        }
        Ok(())
    }
}

fn tag() -> ColoredString {
    "[dispatch]".bold()
}

/// Splits captured output on `\r` and `\n`, dropping empty pieces.
///
/// Progress bars redraw with a bare `\r`, and each redraw reads as its own line.
pub fn lines(output: &str) -> impl Iterator<Item = &str> {
    let bytes = output.as_bytes();
    let mut start = 0;
    memchr::memchr2_iter(b'\r', b'\n', bytes)
        .chain(std::iter::once(bytes.len()))
        .filter_map(move |end| {
            // Delimiters are ASCII, so every cut lands on a char boundary.
            let piece = &output[start..end];
            start = end + 1;
            (!piece.is_empty()).then_some(piece)
        })
}

/// Prints each host's resolved task list without connecting.
pub fn print_plan(playbook: &Playbook) {
    let printer = Printer::new(playbook, false);
    for host in &playbook.hosts {
        let prefix = printer.prefix(&host.name);
        println!(
            "{} {}@{}:{}",
            prefix, host.connection.user, host.connection.address, host.connection.port
        );
        let mut any = false;
        for job in crate::job::matching_jobs(&host.name, &playbook.jobs) {
            for task in &job.tasks {
                any = true;
                println!("{}   {} / {}: {}", prefix, job.name, task.name, task.script);
            }
        }
        if !any {
            println!("{}   (no matching jobs)", prefix);
        }
    }
}
