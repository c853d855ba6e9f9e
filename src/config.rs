//! Configuration for Dispatch.
//!
//! Holds clap structs for command line arguments and flags.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::scheduler::DispatchOptions;

#[derive(Parser, Debug)]
#[command(version, author, about)]
pub struct Config {
    /// Run the playbook (run) or only print each host's resolved tasks (plan)
    #[arg(value_enum, default_value = "run")]
    pub mode: Mode,

    /// Playbook file describing hosts and jobs
    #[arg(long, short, default_value = "./playbook.yaml")]
    pub playbook: PathBuf,

    /// How many hosts may run tasks or close connections at the same time
    #[arg(long, short, alias = "threads", default_value_t = 10, value_parser = clap::value_parser!(u32).range(1..))]
    pub routines: u32,

    /// Print captured output of successful tasks
    #[arg(long, short)]
    pub debug: bool,

    /// Give up connecting to a host after this many seconds
    #[arg(long)]
    pub connect_timeout: Option<u64>,

    /// Give up on a single task after this many seconds
    #[arg(long)]
    pub task_timeout: Option<u64>,

    /// Record keys of unknown hosts in known_hosts instead of refusing to connect
    #[arg(long)]
    pub accept_new_host_keys: bool,

    /// Exit with a non-zero status when any task fails
    #[arg(long)]
    pub strict: bool,
}

#[derive(Debug, PartialEq, Clone, ValueEnum)]
pub enum Mode {
    Run,
    Plan,
}

impl Config {
    pub fn dispatch_options(&self) -> DispatchOptions {
        DispatchOptions {
            max_concurrency: self.routines as usize,
            connect_timeout: self.connect_timeout.map(Duration::from_secs),
            task_timeout: self.task_timeout.map(Duration::from_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::try_parse_from(["dispatch"]).unwrap();
        assert_eq!(config.mode, Mode::Run);
        assert_eq!(config.playbook, PathBuf::from("./playbook.yaml"));
        assert_eq!(config.routines, 10);
        assert!(!config.debug);
        let options = config.dispatch_options();
        assert_eq!(options.max_concurrency, 10);
        assert_eq!(options.task_timeout, None);
    }

    #[test]
    fn test_flags() {
        let config = Config::try_parse_from([
            "dispatch",
            "plan",
            "--playbook",
            "site.yaml",
            "-r",
            "3",
            "--debug",
            "--task-timeout",
            "30",
        ])
        .unwrap();
        assert_eq!(config.mode, Mode::Plan);
        assert_eq!(config.playbook, PathBuf::from("site.yaml"));
        let options = config.dispatch_options();
        assert_eq!(options.max_concurrency, 3);
        assert_eq!(options.task_timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_zero_routines_rejected() {
        assert!(Config::try_parse_from(["dispatch", "--routines", "0"]).is_err());
    }
}
