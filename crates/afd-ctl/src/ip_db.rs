//! # IP database
//!
//! List and edit the host name to address cache shared through `fifo/ip_db`.

use std::io;
use std::path::Path;

use afd_amg::ip_db::IpDb;
use anyhow::{Context, Result};
use clap::Subcommand;

#[derive(Subcommand, Debug)]
pub enum IpDbCommands {
    /// Print every entry
    List {
        #[arg(long)]
        json: bool,
    },
    /// Print the address stored for a host
    Show { host: String },
    /// Store an address
    Add { host: String, ip: String },
    /// Forget a host
    Remove { host: String },
    /// Resolve a host through the system resolver
    Resolve {
        host: String,
        /// Record the result in the database
        #[arg(long)]
        store: bool,
    },
}

pub fn run(fifo_dir: &Path, command: IpDbCommands) -> Result<()> {
    let mut db = IpDb::attach(fifo_dir)
        .with_context(|| format!("Failed to attach IP database in {}", fifo_dir.display()))?;

    match command {
        IpDbCommands::List { json } => {
            if json {
                println!("{}", serde_json::to_string_pretty(&db.entries()?)?);
            } else {
                db.print(&mut io::stdout().lock(), None)?;
            }
        }
        IpDbCommands::Show { host } => match db.lookup(&host)? {
            Some(ip) => println!("{}", ip),
            None => anyhow::bail!("{} is not in the IP database", host),
        },
        IpDbCommands::Add { host, ip } => {
            if db.add(&host, &ip)? {
                println!("Stored {} for {}", ip, host);
            } else {
                println!("Not stored, {} is its own address", host);
            }
        }
        IpDbCommands::Remove { host } => {
            if !db.remove(&host)? {
                anyhow::bail!("{} is not in the IP database", host);
            }
            println!("Removed {}", host);
        }
        IpDbCommands::Resolve { host, store } => {
            let addr = db.resolve(&host, store)?;
            println!("{}", addr);
        }
    }
    db.detach()?;
    Ok(())
}
