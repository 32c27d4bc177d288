//! # Host table view
//!
//! Read-only dump of the live FSA, the way an operator dialog would show it.

use std::path::Path;

use afd_amg::fsa::Fsa;
use afd_ipc::HostSnapshot;
use anyhow::{Context, Result};

pub fn run(fifo_dir: &Path, json: bool) -> Result<()> {
    let fsa = Fsa::attach_passive(fifo_dir, true, "afdctl").context("Failed to attach FSA")?;
    let snapshots: Vec<HostSnapshot> = fsa
        .hosts()
        .iter()
        .take(fsa.num_hosts())
        .map(|h| h.snapshot())
        .collect();
    let header = *fsa.header();
    let id = fsa.id();
    fsa.detach()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshots)?);
        return Ok(());
    }

    println!();
    println!(
        "  FSA generation {} ({} hosts, HOST_CONFIG counter {})",
        id,
        snapshots.len(),
        header.host_config_counter
    );
    println!();
    println!(
        "  {:<10} {:<24} {:<7} {:>6} {:>6} {:>6} {:>8}  {}",
        "ALIAS", "HOSTNAME", "TOGGLE", "ACTIVE", "ALLOW", "ERRORS", "QUEUED", "PROTOCOLS"
    );
    for host in &snapshots {
        if host.group {
            println!("  {:<10} (group)", host.alias);
            continue;
        }
        let hostname = if host.toggle.is_empty() {
            host.real_hostname[0].clone()
        } else {
            format!("{}|{}", host.real_hostname[0], host.real_hostname[1])
        };
        println!(
            "  {:<10} {:<24} {:<7} {:>6} {:>6} {:>6} {:>8}  {}",
            host.alias,
            hostname,
            host.toggle,
            host.active_transfers,
            host.allowed_transfers,
            host.error_counter,
            host.jobs_queued,
            host.protocols.join(",")
        );
    }
    Ok(())
}
