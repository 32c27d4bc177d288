//! # afd-amg
//!
//! The AMG supervisor of an AFD installation and the shared-memory tables
//! it owns.
//!
//! ## Architecture
//!
//! AMG publishes the host table (FSA) that FD and the transfer workers map,
//! keeps `etc/HOST_CONFIG` in step with it, and runs dir_check. Everything
//! other processes see lives in files under `<work>/fifo`:
//! - `fsa.id` and `fsa_status.<id>`: generations of the host table
//! - `afd.status`, `afd.active`: process states and pids
//! - `ip_db`, `any.counter`: shared resolver cache and job counter
//!
//! ## Communication
//!
//! Edit dialogs and `afdctl` talk to AMG through FIFOs:
//! - `amg_cmd.fifo`: shutdown
//! - `db_update.fifo`: reread and update requests, answered on
//!   `db_update_reply.fifo<pid>`

pub mod afd_status;
pub mod counter;
pub mod crash;
pub mod dir_check;
pub mod dir_config;
pub mod dupcheck;
pub mod extra_workdir;
pub mod fsa;
pub mod host_list;
pub mod ip_db;
pub mod lock;
pub mod pmatch;
pub mod shm;
pub mod supervisor;

pub use supervisor::{run, AmgOptions, StopReason, Supervisor, SupervisorError};
