//! Test environment abstraction for isolated testing.
//!
//! Provides `TestEnvironment` to manage:
//! - An isolated AFD work directory with the standard layout
//! - Helpers to drop configuration files into `etc/`
//!
//! # Usage
//!
//! ```ignore
//! use afd_config::testing::TestEnvironment;
//!
//! #[tokio::test]
//! async fn test_something() {
//!     let env = TestEnvironment::new().unwrap();
//!     env.write_host_config("h1:1.2.3.4::::3:10:300:4096:10:-1:120:0:0:1:0:0:0:0:0:0:0\n");
//!     // AMG is NOT auto-started - tests control lifecycle
//! }
//! ```

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use tempfile::TempDir;

use crate::WorkDir;

/// Atomic counter for unique test IDs
static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Isolated work directory, removed on drop
pub struct TestEnvironment {
    _temp_dir: TempDir,
    pub work: WorkDir,
    /// Unique test ID
    pub test_id: u32,
}

impl TestEnvironment {
    /// Create a new isolated work directory with the standard layout
    pub fn new() -> anyhow::Result<Self> {
        let test_id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_dir = TempDir::new()?;
        let work = WorkDir::new(temp_dir.path().join("afd"));
        work.create_layout()?;
        Ok(Self {
            _temp_dir: temp_dir,
            work,
            test_id,
        })
    }

    pub fn root(&self) -> &Path {
        self.work.root()
    }

    /// Scratch directory outside the work root (extra work dirs, sources)
    pub fn scratch(&self, name: &str) -> anyhow::Result<PathBuf> {
        let dir = self._temp_dir.path().join(name);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    pub fn write_host_config(&self, text: &str) -> anyhow::Result<PathBuf> {
        self.write_etc(crate::path::HOST_CONFIG_FILE, text)
    }

    pub fn write_afd_config(&self, text: &str) -> anyhow::Result<PathBuf> {
        self.write_etc(crate::path::AFD_CONFIG_FILE, text)
    }

    pub fn write_dir_config(&self, text: &str) -> anyhow::Result<PathBuf> {
        self.write_etc(crate::path::DEFAULT_DIR_CONFIG_FILE, text)
    }

    /// Write `etc/<name>`
    pub fn write_etc(&self, name: &str, text: &str) -> anyhow::Result<PathBuf> {
        let path = self.work.etc_dir().join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, text)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_isolation() {
        let env1 = TestEnvironment::new().unwrap();
        let env2 = TestEnvironment::new().unwrap();

        assert_ne!(env1.test_id, env2.test_id);
        assert_ne!(env1.root(), env2.root());
        assert!(env1.work.fifo_dir().is_dir());
        assert!(env1.work.pool_dir().is_dir());
    }

    #[test]
    fn test_write_etc_files() {
        let env = TestEnvironment::new().unwrap();
        let path = env.write_afd_config("AMG_DIR_RESCAN_TIME 2\n").unwrap();
        assert_eq!(path, env.work.afd_config());
        let cfg = crate::AmgConfig::load(&env.work).unwrap();
        assert_eq!(cfg.rescan_time, 2);
    }

    #[test]
    fn test_cleanup_on_drop() {
        let root = {
            let env = TestEnvironment::new().unwrap();
            env.root().to_path_buf()
        };
        assert!(!root.exists());
    }
}
