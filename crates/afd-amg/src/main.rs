//! amg - AFD message generator supervisor
//!
//! Usage:
//!   amg -w /path/to/afd [--dir-check /usr/bin/dir_check]

use std::path::PathBuf;
use std::process::ExitCode;

use afd_amg::dir_check::DirCheckCommand;
use afd_amg::{crash, AmgOptions, StopReason};
use afd_config::logging::{init_amg_logging, LogLevel};
use afd_config::WorkDir;
use clap::Parser;
use tracing::{error, info, warn};

/// AFD message generator: owns the FSA and HOST_CONFIG and runs dir_check.
#[derive(Parser)]
#[command(name = "amg")]
#[command(version, about, long_about = None)]
struct Cli {
    /// AFD working directory
    #[arg(short = 'w', long = "work-dir", env = "AFD_WORK_DIR")]
    work_dir: PathBuf,

    /// dir_check program to run; without it AMG only maintains the tables
    #[arg(long = "dir-check", value_name = "PROGRAM")]
    dir_check: Option<PathBuf>,

    /// Log debug messages
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let work = WorkDir::new(&cli.work_dir);

    let level = if cli.debug {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    let sink = init_amg_logging(level, &work.fifo_dir());
    if let Err(e) = crash::install(sink.raw_fd()) {
        warn!(error = %e, "Failed to install crash handlers");
    }

    info!(path = %work.root().display(), "Starting AMG");

    let mut options = AmgOptions::new(work.clone());
    if let Some(program) = cli.dir_check {
        options = options.with_dir_check(DirCheckCommand::for_work_dir(program, &work));
    }

    match afd_amg::run(options).await {
        Ok(StopReason::Shutdown) => ExitCode::SUCCESS,
        Ok(StopReason::Signal(signo)) => {
            info!(signo, "Exiting on signal");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "AMG terminated");
            ExitCode::from(e.exit_code())
        }
    }
}
