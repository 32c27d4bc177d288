//! # Duplicate check store
//!
//! Inspect the per-job CRC stores under `files/crc` and run files through
//! them by hand.

use std::path::PathBuf;

use afd_amg::dupcheck::{self, have_hw_crc32, DupCheck, DupCheckRequest, RemoveOutcome};
use afd_config::WorkDir;
use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use serde::Serialize;

#[derive(Args, Debug)]
pub struct DupcheckArgs {
    #[command(subcommand)]
    command: DupcheckCommands,
}

#[derive(Subcommand, Debug)]
enum DupcheckCommands {
    /// Print the fingerprints stored for a job
    List {
        /// Job id in hex
        #[arg(value_parser = parse_hex)]
        job: u32,

        #[arg(long)]
        json: bool,
    },
    /// Check a file and record it, as AMG's workers do
    Check {
        #[command(flatten)]
        file: FileArgs,

        /// Seconds a fingerprint stays valid
        #[arg(long, default_value_t = 86400)]
        timeout: i64,
    },
    /// Drop a file's fingerprint from the store
    Remove {
        #[command(flatten)]
        file: FileArgs,
    },
}

#[derive(Args, Debug)]
struct FileArgs {
    path: PathBuf,

    /// Job id in hex
    #[arg(long, value_parser = parse_hex)]
    job: u32,

    /// Dup-check flag word in hex
    #[arg(long, value_parser = parse_hex)]
    flag: u32,
}

#[derive(Serialize)]
struct Fingerprint {
    crc: String,
    flag: String,
    timeout: i64,
}

fn parse_hex(s: &str) -> Result<u32, String> {
    let digits = s.trim_start_matches("0x");
    u32::from_str_radix(digits, 16).map_err(|e| format!("{}: {}", s, e))
}

impl FileArgs {
    fn request(&self, timeout: i64) -> Result<DupCheckRequest<'_>> {
        let size = std::fs::metadata(&self.path)
            .with_context(|| format!("Failed to stat {}", self.path.display()))?
            .len();
        Ok(DupCheckRequest {
            fullname: &self.path,
            filename: None,
            size,
            job_id: self.job,
            timeout,
            flag: self.flag,
            lock: true,
        })
    }
}

pub fn run(work: &WorkDir, args: DupcheckArgs) -> Result<()> {
    let crc_dir = work.crc_dir();
    match args.command {
        DupcheckCommands::List { job, json } => {
            let records = dupcheck::list(&crc_dir, job)
                .with_context(|| format!("No dup-check store for job {:x}", job))?;
            let rows: Vec<Fingerprint> = records
                .iter()
                .map(|r| Fingerprint {
                    crc: format!("{:08x}", r.crc),
                    flag: format!("{:x}", r.flag),
                    timeout: r.timeout,
                })
                .collect();
            if json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                for row in &rows {
                    let until = chrono::DateTime::from_timestamp(row.timeout, 0)
                        .map(|t| {
                            t.with_timezone(&chrono::Local)
                                .format("%Y-%m-%d %H:%M:%S")
                                .to_string()
                        })
                        .unwrap_or_else(|| row.timeout.to_string());
                    println!("{}  {:>8}  {}", row.crc, row.flag, until);
                }
            }
        }
        DupcheckCommands::Check { file, timeout } => {
            let req = file.request(timeout)?;
            let mut dc = DupCheck::new(&crc_dir).with_hw_crc32(have_hw_crc32());
            if dc.is_dup(&req)? {
                println!("duplicate");
            } else {
                println!("new");
            }
        }
        DupcheckCommands::Remove { file } => {
            let req = file.request(0)?;
            let mut dc = DupCheck::new(&crc_dir).with_hw_crc32(have_hw_crc32());
            match dc.is_dup_rm(&req)? {
                RemoveOutcome::Removed => println!("removed"),
                RemoveOutcome::NotFound => {
                    anyhow::bail!("{} is not in the store", file.path.display())
                }
            }
        }
    }
    Ok(())
}
