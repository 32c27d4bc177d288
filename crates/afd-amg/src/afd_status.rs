//! The two small files every AFD process shares besides the FSA: the
//! afd_status region and the afd_active pid table.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use afd_ipc::{
    afd_status_file, set_cstr, AfdStatus, AfdWordHeader, AFD_STATUS_SIZE,
    AFD_STATUS_STRUCT_VERSION, AFD_WORD_OFFSET, NO_OF_PROCESS, STRUCT_VERSION_OFFSET,
};
use tracing::debug;

use crate::shm::{MapMode, MappedTable, ShmError};

/// Poll interval while waiting for afd_status to appear.
pub const ATTACH_STEP: Duration = Duration::from_millis(80);

#[derive(Debug, thiserror::Error)]
pub enum AfdStatusError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Mapped table error: {0}")]
    Shm(#[from] ShmError),
    #[error("{path}: afd_status version {found}, expected {expected}")]
    Version {
        path: PathBuf,
        found: u8,
        expected: u8,
    },
    #[error("{0} did not appear within {1:?}")]
    Timeout(PathBuf, Duration),
    #[error("Process number {0} out of range")]
    BadProcess(usize),
}

#[derive(Debug)]
pub struct AfdStatusMap {
    table: MappedTable,
}

impl AfdStatusMap {
    /// Create the region, or take over an existing one of the same version.
    pub fn create(fifo_dir: &Path) -> Result<Self, AfdStatusError> {
        let path = afd_status_file(fifo_dir);
        let mut table =
            MappedTable::attach(&path, AFD_WORD_OFFSET + AFD_STATUS_SIZE, MapMode::ReadWrite)?;
        let version = table.bytes()[STRUCT_VERSION_OFFSET];
        if version == 0 {
            *table.header_mut()? = AfdWordHeader::new(0, AFD_STATUS_STRUCT_VERSION);
            let mut map = Self { table };
            let status = map.status_mut()?;
            status.start_time = chrono::Utc::now().timestamp();
            let host = nix::unistd::gethostname()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_default();
            set_cstr(&mut status.hostname, &host);
            debug!(path = %path.display(), "Created afd_status");
            return Ok(map);
        }
        let map = Self { table };
        map.check_version()?;
        Ok(map)
    }

    /// Attach an existing region, waiting up to `timeout` for it to appear.
    pub fn attach(fifo_dir: &Path, timeout: Duration) -> Result<Self, AfdStatusError> {
        let path = afd_status_file(fifo_dir);
        let loops = (timeout.as_millis() / ATTACH_STEP.as_millis()).max(1);
        let mut tries = 0;
        let table = loop {
            match MappedTable::open(&path, MapMode::ReadWrite) {
                Ok(t) => break t,
                Err(ShmError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                    tries += 1;
                    if tries >= loops {
                        return Err(AfdStatusError::Timeout(path, timeout));
                    }
                    std::thread::sleep(ATTACH_STEP);
                }
                Err(e) => return Err(e.into()),
            }
        };
        let map = Self { table };
        map.check_version()?;
        Ok(map)
    }

    fn check_version(&self) -> Result<(), AfdStatusError> {
        let found = self.table.bytes()[STRUCT_VERSION_OFFSET];
        if found != AFD_STATUS_STRUCT_VERSION {
            return Err(AfdStatusError::Version {
                path: self.table.path().to_path_buf(),
                found,
                expected: AFD_STATUS_STRUCT_VERSION,
            });
        }
        let needed = AFD_WORD_OFFSET + AFD_STATUS_SIZE;
        if self.table.len() < needed {
            return Err(ShmError::Size {
                path: self.table.path().to_path_buf(),
                size: self.table.len(),
                needed,
            }
            .into());
        }
        Ok(())
    }

    pub fn status(&self) -> &AfdStatus {
        // SAFETY: size checked on attach; offset 16 is 8-byte aligned.
        unsafe { &*(self.table.bytes().as_ptr().add(AFD_WORD_OFFSET) as *const AfdStatus) }
    }

    pub fn status_mut(&mut self) -> Result<&mut AfdStatus, AfdStatusError> {
        let bytes = self.table.bytes_mut()?;
        // SAFETY: as for `status`, and the mapping is writable.
        Ok(unsafe { &mut *(bytes.as_mut_ptr().add(AFD_WORD_OFFSET) as *mut AfdStatus) })
    }

    fn amg_jobs_atomic(&self) -> &AtomicU32 {
        let status = self.status();
        // SAFETY: `amg_jobs` is an aligned u32 inside a shared writable
        // mapping that FD updates concurrently.
        unsafe { &*(&status.amg_jobs as *const u32 as *const AtomicU32) }
    }

    pub fn amg_jobs(&self) -> u32 {
        self.amg_jobs_atomic().load(Ordering::Acquire)
    }

    pub fn set_amg_jobs(&self, bits: u32) {
        self.amg_jobs_atomic().fetch_or(bits, Ordering::AcqRel);
    }

    pub fn clear_amg_jobs(&self, bits: u32) {
        self.amg_jobs_atomic().fetch_and(!bits, Ordering::AcqRel);
    }

    pub fn set_amg(&mut self, state: i8) -> Result<(), AfdStatusError> {
        self.status_mut()?.amg = state;
        Ok(())
    }

    pub fn set_dir_check(&mut self, state: i8) -> Result<(), AfdStatusError> {
        self.status_mut()?.dir_check = state;
        Ok(())
    }

    pub fn fd_state(&self) -> i8 {
        // SAFETY: single aligned byte written by FD.
        unsafe { std::ptr::read_volatile(&self.status().fd) }
    }

    pub fn path(&self) -> &Path {
        self.table.path()
    }

    pub fn detach(self) -> Result<(), AfdStatusError> {
        self.table.detach()?;
        Ok(())
    }
}

/// `fifo/afd.active`: one pid per process number, slot 0 for init.
#[derive(Debug)]
pub struct AfdActive {
    file: File,
}

const PID_SIZE: u64 = std::mem::size_of::<i32>() as u64;

impl AfdActive {
    pub fn open(fifo_dir: &Path) -> Result<Self, AfdStatusError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(afd_ipc::FILE_MODE)
            .open(fifo_dir.join(afd_ipc::AFD_ACTIVE_FILE))?;
        let size = (NO_OF_PROCESS as u64 + 1) * PID_SIZE;
        if file.metadata()?.len() < size {
            file.set_len(size)?;
        }
        Ok(Self { file })
    }

    fn offset(process: usize) -> Result<u64, AfdStatusError> {
        if process >= NO_OF_PROCESS {
            return Err(AfdStatusError::BadProcess(process));
        }
        Ok((process as u64 + 1) * PID_SIZE)
    }

    /// Pid recorded for `process`, 0 when none.
    pub fn pid(&self, process: usize) -> Result<i32, AfdStatusError> {
        let mut buf = [0u8; 4];
        self.file.read_exact_at(&mut buf, Self::offset(process)?)?;
        Ok(i32::from_ne_bytes(buf))
    }

    pub fn set_pid(&self, process: usize, pid: i32) -> Result<(), AfdStatusError> {
        self.file
            .write_all_at(&pid.to_ne_bytes(), Self::offset(process)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use afd_ipc::{DC_NO, FD_WAITING, PROC_ON, REREADING_DIR_CONFIG};
    use tempfile::tempdir;

    #[test]
    fn test_create_then_attach() {
        let temp = tempdir().unwrap();
        let mut created = AfdStatusMap::create(temp.path()).unwrap();
        assert!(created.status().start_time > 0);
        created.set_amg(PROC_ON).unwrap();

        let other = AfdStatusMap::attach(temp.path(), Duration::from_secs(1)).unwrap();
        assert_eq!(other.status().amg, PROC_ON);

        created.set_amg_jobs(REREADING_DIR_CONFIG | FD_WAITING);
        other.clear_amg_jobs(FD_WAITING);
        assert_eq!(created.amg_jobs(), REREADING_DIR_CONFIG);

        // Recreating keeps what is there.
        let again = AfdStatusMap::create(temp.path()).unwrap();
        assert_eq!(again.status().amg, PROC_ON);
    }

    #[test]
    fn test_attach_times_out() {
        let temp = tempdir().unwrap();
        let err = AfdStatusMap::attach(temp.path(), Duration::from_millis(100)).unwrap_err();
        assert!(matches!(err, AfdStatusError::Timeout(..)));
    }

    #[test]
    fn test_version_mismatch() {
        let temp = tempdir().unwrap();
        let map = AfdStatusMap::create(temp.path()).unwrap();
        let path = map.path().to_path_buf();
        drop(map);
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[STRUCT_VERSION_OFFSET] = AFD_STATUS_STRUCT_VERSION + 1;
        std::fs::write(&path, bytes).unwrap();
        assert!(matches!(
            AfdStatusMap::attach(temp.path(), Duration::from_secs(1)),
            Err(AfdStatusError::Version { .. })
        ));
    }

    #[test]
    fn test_active_slots() {
        let temp = tempdir().unwrap();
        let active = AfdActive::open(temp.path()).unwrap();
        assert_eq!(active.pid(DC_NO).unwrap(), 0);
        active.set_pid(DC_NO, 4242).unwrap();
        assert_eq!(AfdActive::open(temp.path()).unwrap().pid(DC_NO).unwrap(), 4242);

        let raw = std::fs::read(temp.path().join(afd_ipc::AFD_ACTIVE_FILE)).unwrap();
        let at = (DC_NO + 1) * 4;
        assert_eq!(i32::from_ne_bytes(raw[at..at + 4].try_into().unwrap()), 4242);
        assert!(active.pid(NO_OF_PROCESS).is_err());
    }
}
