use std::process::ExitCode;

use clap::Parser;
use colored::*;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use dispatch_ssh::report::print_plan;
use dispatch_ssh::{
    Config, DispatchError, Dispatcher, HostStatus, Mode, Playbook, Printer, Reporter, RunSummary,
    SshConnector,
};

/// Installs a `fmt` subscriber. `RUST_LOG` wins over the default level.
fn init_tracing(debug: bool) {
    let default = if debug { "dispatch_ssh=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

async fn run(cli: &Config) -> Result<ExitCode, DispatchError> {
    let playbook = Playbook::load(&cli.playbook)?;

    if cli.mode == Mode::Plan {
        print_plan(&playbook);
        return Ok(ExitCode::SUCCESS);
    }

    if !playbook.name.is_empty() {
        eprintln!("[dispatch] Running playbook '{}'", playbook.name);
    }

    let (reporter, events) = Reporter::channel();
    let printer = tokio::spawn(Printer::new(&playbook, cli.debug).drain(events));

    // Ctrl-c stops hosts before their next task; connections are still closed.
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("[dispatch] Ctrl-c detected. Not starting any more tasks.");
                cancel.cancel();
            }
        });
    }

    let options = cli.dispatch_options();
    let connector = SshConnector::new()
        .accept_new_host_keys(cli.accept_new_host_keys)
        .connect_timeout(options.connect_timeout);
    let dispatcher = Dispatcher::new(connector, options).with_cancellation(cancel);
    let result = dispatcher.run(&playbook, &reporter).await;

    // Let the printer see the end of the stream.
    drop(reporter);
    if let Err(e) = printer.await {
        warn!("Printer task failed: {}", e);
    }

    let summary = result?;
    print_summary(&summary);
    if cli.strict && !summary.all_succeeded() {
        return Ok(ExitCode::from(2));
    }
    Ok(ExitCode::SUCCESS)
}

fn print_summary(summary: &RunSummary) {
    for host in &summary.hosts {
        let status = match &host.status {
            HostStatus::Completed => "ok".green(),
            HostStatus::Failed { task } => format!("failed at '{}'", task).red(),
            HostStatus::Cancelled => "cancelled".yellow(),
            HostStatus::Crashed => "crashed".red(),
        };
        eprintln!(
            "[dispatch] [{}] {}/{} tasks, {}",
            host.host, host.succeeded, host.planned, status
        );
    }
    if summary.close_failures > 0 {
        eprintln!(
            "[dispatch] {} connection(s) did not close cleanly",
            summary.close_failures
        );
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Config::parse();
    init_tracing(cli.debug);

    match run(&cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("[dispatch] {}", e.to_string().red());
            ExitCode::FAILURE
        }
    }
}
