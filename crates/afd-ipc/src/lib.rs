//! # afd-ipc
//!
//! Everything two AFD processes must agree on byte for byte: the layouts of
//! the memory-mapped tables under `<work>/fifo/`, the names of the files and
//! FIFOs living there, and the command/reply protocol spoken over the FIFOs.

pub mod client;
pub mod layout;
pub mod protocol;

use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::sys::stat::Mode;

pub use layout::*;
pub use protocol::*;

// Files below <work>/fifo
pub const FSA_ID_FILE: &str = "fsa.id";
pub const FSA_STAT_FILE: &str = "fsa_status";
pub const AFD_STATUS_FILE: &str = "afd.status";
pub const AFD_ACTIVE_FILE: &str = "afd.active";
pub const AFD_LOCK_FILE: &str = "afd.lock";
pub const COUNTER_FILE: &str = "any.counter";
pub const IP_DB_FILE: &str = "ip_db";

// FIFOs below <work>/fifo
pub const AMG_CMD_FIFO: &str = "amg_cmd.fifo";
pub const FD_CMD_FIFO: &str = "fd_cmd.fifo";
pub const DC_CMD_FIFO: &str = "dc_cmd.fifo";
pub const DC_RESP_FIFO: &str = "dc_resp.fifo";
pub const DB_UPDATE_FIFO: &str = "db_update.fifo";
pub const DB_UPDATE_REPLY_FIFO: &str = "db_update_reply.fifo";
pub const DB_UPDATE_REPLY_DEBUG_FILE: &str = "db_update_reply_debug";
pub const IP_FIN_FIFO: &str = "ip_fin.fifo";
pub const SYSTEM_LOG_FIFO: &str = "system_log.fifo";
pub const EVENT_LOG_FIFO: &str = "event_log.fifo";
pub const PRODUCTION_LOG_FIFO: &str = "production_log.fifo";

/// FIFOs AMG creates at startup when missing.
pub const CONTROL_FIFOS: &[&str] = &[
    AMG_CMD_FIFO,
    FD_CMD_FIFO,
    DC_CMD_FIFO,
    DC_RESP_FIFO,
    DB_UPDATE_FIFO,
    IP_FIN_FIFO,
    SYSTEM_LOG_FIFO,
    EVENT_LOG_FIFO,
    PRODUCTION_LOG_FIFO,
];

/// Mode for FIFOs and mapped files.
pub const FILE_MODE: u32 = 0o600;

#[derive(Debug, thiserror::Error)]
pub enum FifoError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Nobody is reading {0}, is AMG running?")]
    NotRunning(PathBuf),
    #[error("No reply within {0:?}")]
    Timeout(Duration),
    #[error("Reply truncated after {0} bytes")]
    ShortReply(usize),
}

/// Create a FIFO with [`FILE_MODE`]; an existing one is fine.
pub fn make_fifo(path: &Path) -> std::io::Result<()> {
    match nix::unistd::mkfifo(path, Mode::from_bits_truncate(FILE_MODE)) {
        Ok(()) | Err(nix::errno::Errno::EEXIST) => Ok(()),
        Err(e) => Err(std::io::Error::from(e)),
    }
}

/// Path of the FSA generation file for `id`.
pub fn fsa_stat_file(fifo_dir: &Path, id: i32) -> PathBuf {
    fifo_dir.join(format!("{}.{}", FSA_STAT_FILE, id))
}

/// Path of the afd_status file; the suffix is the struct size in hex so a
/// process built against a different layout never maps it by accident.
pub fn afd_status_file(fifo_dir: &Path) -> PathBuf {
    fifo_dir.join(format!(
        "{}.{:x}",
        AFD_STATUS_FILE,
        AFD_WORD_OFFSET + AFD_STATUS_SIZE
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::FileTypeExt;
    use tempfile::tempdir;

    #[test]
    fn test_make_fifo_is_idempotent() {
        let temp = tempdir().unwrap();
        let path = temp.path().join(DB_UPDATE_FIFO);
        make_fifo(&path).unwrap();
        make_fifo(&path).unwrap();
        assert!(std::fs::metadata(&path).unwrap().file_type().is_fifo());
    }

    #[test]
    fn test_generation_paths() {
        let dir = Path::new("/work/fifo");
        assert_eq!(fsa_stat_file(dir, 3), PathBuf::from("/work/fifo/fsa_status.3"));
        assert!(afd_status_file(dir)
            .to_string_lossy()
            .starts_with("/work/fifo/afd.status."));
    }
}
