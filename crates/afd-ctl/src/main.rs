//! # afdctl
//!
//! Operator command line for an AFD work directory: talk to a running AMG
//! through its FIFOs and inspect the tables it shares.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use afd_amg::host_list;
use afd_amg::pmatch::{pmatch, MatchResult};
use afd_config::logging::{init_logging, LogLevel};
use afd_config::{log_ctl_debug, log_ctl_info};
use afd_config::{AmgConfig, WorkDir};
use afd_ipc::client::{self, DEFAULT_REPLY_TIMEOUT};
use afd_ipc::{make_fifo, DbUpdateRequest, FifoError, Verbosity, CONTROL_FIFOS, SHUTDOWN};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

mod dupcheck;
mod fsa;
mod ip_db;

/// AFD operator tool
#[derive(Parser)]
#[command(name = "afdctl")]
#[command(version, about, long_about = None)]
struct Cli {
    /// AFD working directory
    #[arg(short = 'w', long = "work-dir", env = "AFD_WORK_DIR", global = true)]
    work_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the directory layout and control FIFOs
    Init,

    /// Ask AMG to reread HOST_CONFIG
    RereadHostConfig {
        /// Repeat for more detail (-v, -vv)
        #[arg(short, action = clap::ArgAction::Count)]
        verbose: u8,

        /// Seconds to wait for the reply
        #[arg(long, default_value_t = DEFAULT_REPLY_TIMEOUT.as_secs())]
        timeout: u64,
    },

    /// Ask AMG to reread DIR_CONFIG
    RereadDirConfig {
        #[arg(short, action = clap::ArgAction::Count)]
        verbose: u8,

        #[arg(long, default_value_t = DEFAULT_REPLY_TIMEOUT.as_secs())]
        timeout: u64,
    },

    /// Ask AMG to write HOST_CONFIG from the live FSA
    UpdateHostConfig,

    /// Stop AMG
    Shutdown,

    /// Print the host table
    Fsa {
        #[arg(long)]
        json: bool,
    },

    /// Parse HOST_CONFIG and print what AMG would load
    HostConfig {
        #[arg(long)]
        json: bool,
    },

    /// Inspect or edit the IP database
    IpDb {
        #[command(subcommand)]
        command: ip_db::IpDbCommands,
    },

    /// Inspect the duplicate-check store of a job
    Dupcheck(dupcheck::DupcheckArgs),

    /// Test a file name filter
    Pmatch {
        filter: String,
        name: String,
    },

    /// Print the effective AFD_CONFIG
    Config {
        #[arg(long)]
        json: bool,
    },
}

fn verbosity(count: u8) -> Verbosity {
    match count {
        0 => Verbosity::Quiet,
        1 => Verbosity::Verbose1,
        _ => Verbosity::Verbose2,
    }
}

fn work_dir(cli_dir: Option<PathBuf>) -> Result<WorkDir> {
    match cli_dir {
        Some(dir) => Ok(WorkDir::new(dir)),
        None => WorkDir::from_env().context("No work directory, use -w or set AFD_WORK_DIR"),
    }
}

fn cmd_init(work: &WorkDir) -> Result<()> {
    work.create_layout()
        .with_context(|| format!("Failed to create {}", work.root().display()))?;
    for name in CONTROL_FIFOS {
        make_fifo(&work.fifo(name))?;
        log_ctl_debug!(fifo = name, "Created control FIFO");
    }
    println!("Initialised {}", work.root().display());
    Ok(())
}

fn cmd_reread(fifo_dir: &Path, dir_config: bool, verbose: u8, timeout: u64) -> Result<ExitCode> {
    let verbosity = verbosity(verbose);
    log_ctl_debug!(dir_config, ?verbosity, "Sending reread request");
    let reply = client::reread(
        fifo_dir,
        dir_config,
        verbosity,
        Duration::from_secs(timeout),
    )?;
    println!("{}", reply);

    if verbosity != Verbosity::Quiet {
        let debug_file = fifo_dir.join(format!(
            "{}{}",
            afd_ipc::DB_UPDATE_REPLY_DEBUG_FILE,
            std::process::id()
        ));
        if let Ok(text) = std::fs::read_to_string(&debug_file) {
            print!("{}", text);
        }
        let _ = std::fs::remove_file(&debug_file);
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_host_config(work: &WorkDir, json: bool) -> Result<()> {
    let config = AmgConfig::load(work)?;
    let parsed = host_list::read(&work.host_config(), &config.host_defaults)
        .with_context(|| format!("Failed to read {}", work.host_config().display()))?;
    if json {
        println!("{}", serde_json::to_string_pretty(&parsed.entries)?);
        return Ok(());
    }
    for entry in &parsed.entries {
        println!("{}", entry.to_line());
    }
    println!(
        "{} hosts, {} warnings",
        parsed.entries.iter().filter(|e| !e.group).count(),
        parsed.warnings
    );
    Ok(())
}

fn cmd_pmatch(filter: &str, name: &str) -> ExitCode {
    match pmatch(filter, name, None) {
        MatchResult::Match => {
            println!("match");
            ExitCode::SUCCESS
        }
        MatchResult::NoMatch => {
            println!("no match");
            ExitCode::from(1)
        }
        MatchResult::Excluded => {
            println!("excluded");
            ExitCode::from(2)
        }
    }
}

fn cmd_config(work: &WorkDir, json: bool) -> Result<()> {
    let config = AmgConfig::load(work)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&config)?);
    } else {
        println!("{:#?}", config);
    }
    if config.warnings > 0 {
        eprintln!("{} warning(s) while reading AFD_CONFIG", config.warnings);
    }
    Ok(())
}

fn run(cli: Cli) -> Result<ExitCode> {
    let work = || work_dir(cli.work_dir.clone());
    match cli.command {
        Commands::Init => cmd_init(&work()?)?,
        Commands::RereadHostConfig { verbose, timeout } => {
            return cmd_reread(&work()?.fifo_dir(), false, verbose, timeout)
        }
        Commands::RereadDirConfig { verbose, timeout } => {
            return cmd_reread(&work()?.fifo_dir(), true, verbose, timeout)
        }
        Commands::UpdateHostConfig => {
            client::send_db_update(&work()?.fifo_dir(), DbUpdateRequest::HostConfigUpdate)?;
            println!("Requested HOST_CONFIG update");
        }
        Commands::Shutdown => {
            client::send_amg_command(&work()?.fifo_dir(), SHUTDOWN)?;
            log_ctl_info!("Sent SHUTDOWN to AMG");
            println!("Requested AMG shutdown");
        }
        Commands::Fsa { json } => fsa::run(&work()?.fifo_dir(), json)?,
        Commands::HostConfig { json } => cmd_host_config(&work()?, json)?,
        Commands::IpDb { command } => ip_db::run(&work()?.fifo_dir(), command)?,
        Commands::Dupcheck(args) => dupcheck::run(&work()?, args)?,
        Commands::Pmatch { filter, name } => return Ok(cmd_pmatch(&filter, &name)),
        Commands::Config { json } => cmd_config(&work()?, json)?,
    }
    Ok(ExitCode::SUCCESS)
}

fn main() -> ExitCode {
    #[cfg(unix)]
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }

    init_logging(LogLevel::Warn);

    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            if let Some(FifoError::NotRunning(_)) = e.downcast_ref::<FifoError>() {
                eprintln!("Error: AMG is not running");
                return ExitCode::from(3);
            }
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
