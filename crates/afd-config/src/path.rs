//! Work-directory layout.
//!
//! Every AFD process derives its paths from a single work root
//! (`$AFD_WORK_DIR`). Keeping the joins here means AMG, FD and the tools
//! cannot disagree about where a FIFO or a mapped table lives.

use std::io;
use std::path::{Path, PathBuf};

use afd_ipc as ipc;

/// Environment variable naming the work root.
pub const WORK_DIR_ENV: &str = "AFD_WORK_DIR";

pub const FIFO_DIR: &str = "fifo";
pub const ETC_DIR: &str = "etc";
pub const FILES_DIR: &str = "files";
pub const ARCHIVE_DIR: &str = "archive";
pub const LOG_DIR: &str = "log";
pub const POOL_DIR: &str = "pool";
pub const OUTGOING_DIR: &str = "outgoing";
pub const TIME_DIR: &str = "time";
pub const CRC_DIR: &str = "crc";
pub const STORE_DIR: &str = "store";
pub const ONETIME_DIR: &str = "onetime";

pub const HOST_CONFIG_FILE: &str = "HOST_CONFIG";
pub const AFD_CONFIG_FILE: &str = "AFD_CONFIG";
pub const AFD_NAME_FILE: &str = "afd.name";
pub const ALIAS_NAMES_FILE: &str = "alias_names";
pub const DEFAULT_DIR_CONFIG_FILE: &str = "DIR_CONFIG";

/// Mode for directories AMG creates.
pub const DIR_MODE: u32 = 0o755;

/// Resolved work root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkDir {
    root: PathBuf,
}

impl WorkDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Work root from `$AFD_WORK_DIR`.
    pub fn from_env() -> Option<Self> {
        std::env::var_os(WORK_DIR_ENV).map(|v| Self::new(PathBuf::from(v)))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn fifo_dir(&self) -> PathBuf {
        self.root.join(FIFO_DIR)
    }

    pub fn etc_dir(&self) -> PathBuf {
        self.root.join(ETC_DIR)
    }

    pub fn files_dir(&self) -> PathBuf {
        self.root.join(FILES_DIR)
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.root.join(ARCHIVE_DIR)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join(LOG_DIR)
    }

    pub fn pool_dir(&self) -> PathBuf {
        self.files_dir().join(POOL_DIR)
    }

    pub fn outgoing_dir(&self) -> PathBuf {
        self.files_dir().join(OUTGOING_DIR)
    }

    pub fn time_dir(&self) -> PathBuf {
        self.files_dir().join(TIME_DIR)
    }

    pub fn crc_dir(&self) -> PathBuf {
        self.files_dir().join(CRC_DIR)
    }

    pub fn store_dir(&self) -> PathBuf {
        self.files_dir().join(STORE_DIR)
    }

    pub fn onetime_spool_dir(&self) -> PathBuf {
        self.files_dir().join(ONETIME_DIR)
    }

    pub fn onetime_config_dir(&self) -> PathBuf {
        self.etc_dir().join(ONETIME_DIR)
    }

    pub fn host_config(&self) -> PathBuf {
        self.etc_dir().join(HOST_CONFIG_FILE)
    }

    pub fn afd_config(&self) -> PathBuf {
        self.etc_dir().join(AFD_CONFIG_FILE)
    }

    pub fn afd_name(&self) -> PathBuf {
        self.etc_dir().join(AFD_NAME_FILE)
    }

    pub fn fifo(&self, name: &str) -> PathBuf {
        self.fifo_dir().join(name)
    }

    pub fn fsa_id_file(&self) -> PathBuf {
        self.fifo(ipc::FSA_ID_FILE)
    }

    pub fn counter_file(&self) -> PathBuf {
        self.fifo(ipc::COUNTER_FILE)
    }

    pub fn ip_db_file(&self) -> PathBuf {
        self.fifo(ipc::IP_DB_FILE)
    }

    /// Resolve a DIR_CONFIG name: absolute names stay, relative ones live in `etc/`.
    pub fn resolve_etc(&self, name: &str) -> PathBuf {
        let p = Path::new(name);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.etc_dir().join(p)
        }
    }

    /// Create the skeleton every AFD process expects.
    pub fn create_layout(&self) -> io::Result<()> {
        for dir in [
            self.fifo_dir(),
            self.etc_dir(),
            self.log_dir(),
            self.archive_dir(),
            self.pool_dir(),
            self.outgoing_dir(),
            self.time_dir(),
            self.crc_dir(),
            self.store_dir(),
        ] {
            create_dir_mode(&dir, DIR_MODE)?;
        }
        Ok(())
    }

    /// Name of this AFD from `etc/afd.name`, falling back to the hostname.
    pub fn afd_name_or_host(&self) -> String {
        std::fs::read_to_string(self.afd_name())
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .or_else(|| {
                nix::unistd::gethostname()
                    .ok()
                    .map(|h| h.to_string_lossy().into_owned())
            })
            .unwrap_or_else(|| "afd".to_string())
    }
}

/// `mkdir -p` with an explicit mode on every component created.
pub fn create_dir_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(mode)
        .create(path)
}

/// Expand `~` and `~user` prefixes.
///
/// Returns `None` when the user is unknown.
pub fn expand_tilde(path: &str) -> Option<PathBuf> {
    let rest = path.strip_prefix('~')?;
    let (user, tail) = match rest.find('/') {
        Some(idx) => (&rest[..idx], rest[idx + 1..].trim_start_matches('/')),
        None => (rest, ""),
    };
    let home = if user.is_empty() {
        dirs::home_dir()?
    } else {
        nix::unistd::User::from_name(user).ok()??.dir
    };
    Some(if tail.is_empty() { home } else { home.join(tail) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_layout_paths() {
        let work = WorkDir::new("/var/afd");
        assert_eq!(work.fifo_dir(), PathBuf::from("/var/afd/fifo"));
        assert_eq!(work.host_config(), PathBuf::from("/var/afd/etc/HOST_CONFIG"));
        assert_eq!(work.pool_dir(), PathBuf::from("/var/afd/files/pool"));
        assert_eq!(work.crc_dir(), PathBuf::from("/var/afd/files/crc"));
        assert_eq!(
            work.resolve_etc("DIR_CONFIG.ftp"),
            PathBuf::from("/var/afd/etc/DIR_CONFIG.ftp")
        );
        assert_eq!(work.resolve_etc("/abs/DC"), PathBuf::from("/abs/DC"));
    }

    #[test]
    fn test_create_layout() {
        let temp = tempdir().unwrap();
        let work = WorkDir::new(temp.path());
        work.create_layout().unwrap();
        assert!(work.fifo_dir().is_dir());
        assert!(work.outgoing_dir().is_dir());
        assert!(work.crc_dir().is_dir());
        // Idempotent
        work.create_layout().unwrap();
    }

    #[test]
    fn test_expand_tilde() {
        assert_eq!(expand_tilde("/no/tilde"), None);
        assert!(expand_tilde("~no_such_user_for_afd_tests/x").is_none());
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde("~/spool"), Some(home.join("spool")));
        }
    }
}
