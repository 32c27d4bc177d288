//! fcntl byte-range locks.
//!
//! These are the only locks that FD, the dialogs and the workers also
//! honour, so everything cross-process goes through them: byte 0 of the
//! FSA id file, byte 0 of the counter, byte 1 of the IP database and one
//! byte per process in the lock file.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Read,
    Write,
}

fn set_lock(fd: RawFd, l_type: libc::c_int, offset: i64, wait: bool) -> nix::Result<()> {
    // SAFETY: flock is plain data; zero is a valid bit pattern for every field.
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = l_type as _;
    fl.l_whence = libc::SEEK_SET as _;
    fl.l_start = offset as _;
    fl.l_len = 1;

    loop {
        let arg = if wait {
            FcntlArg::F_SETLKW(&fl)
        } else {
            FcntlArg::F_SETLK(&fl)
        };
        match fcntl(fd, arg) {
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e),
        }
    }
}

fn l_type(kind: LockKind) -> libc::c_int {
    match kind {
        LockKind::Read => libc::F_RDLCK as libc::c_int,
        LockKind::Write => libc::F_WRLCK as libc::c_int,
    }
}

/// One locked byte; unlocked on drop.
#[derive(Debug)]
pub struct RegionLock<'a> {
    file: &'a File,
    offset: i64,
}

impl<'a> RegionLock<'a> {
    /// Block until the byte at `offset` is locked.
    pub fn wait(file: &'a File, offset: i64, kind: LockKind) -> io::Result<Self> {
        set_lock(file.as_raw_fd(), l_type(kind), offset, true)?;
        Ok(Self { file, offset })
    }

    /// Lock without waiting; `Ok(None)` when somebody else holds it.
    pub fn try_lock(file: &'a File, offset: i64, kind: LockKind) -> io::Result<Option<Self>> {
        match set_lock(file.as_raw_fd(), l_type(kind), offset, false) {
            Ok(()) => Ok(Some(Self { file, offset })),
            Err(Errno::EAGAIN) | Err(Errno::EACCES) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Pid of another process holding a write lock on `offset`, if any.
    /// Locks held by the calling process are never reported.
    pub fn holder(file: &File, offset: i64) -> io::Result<Option<libc::pid_t>> {
        // SAFETY: flock is plain data; zero is a valid bit pattern for every field.
        let mut fl: libc::flock = unsafe { std::mem::zeroed() };
        fl.l_type = libc::F_WRLCK as _;
        fl.l_whence = libc::SEEK_SET as _;
        fl.l_start = offset as _;
        fl.l_len = 1;
        fcntl(file.as_raw_fd(), FcntlArg::F_GETLK(&mut fl))?;
        if fl.l_type as libc::c_int == libc::F_UNLCK as libc::c_int {
            Ok(None)
        } else {
            Ok(Some(fl.l_pid))
        }
    }
}

impl Drop for RegionLock<'_> {
    fn drop(&mut self) {
        if let Err(e) = set_lock(
            self.file.as_raw_fd(),
            libc::F_UNLCK as libc::c_int,
            self.offset,
            false,
        ) {
            tracing::error!(offset = self.offset, error = %e, "Failed to release byte-range lock");
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessLockError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Another instance already holds process slot {0}")]
    AlreadyRunning(usize),
}

/// Exclusive lock on one process slot of `AFD_LOCK_FILE`, held for the
/// life of the process. Closing the file releases it.
#[derive(Debug)]
pub struct ProcessLock {
    _file: File,
    slot: usize,
}

impl ProcessLock {
    pub fn acquire(fifo_dir: &Path, slot: usize) -> Result<Self, ProcessLockError> {
        let path = fifo_dir.join(afd_ipc::AFD_LOCK_FILE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(afd_ipc::FILE_MODE)
            .open(&path)?;
        Self::lock_slot(file, slot)
    }

    /// Take `slot` on an already open lock file.
    pub fn lock_slot(file: File, slot: usize) -> Result<Self, ProcessLockError> {
        match set_lock(file.as_raw_fd(), l_type(LockKind::Write), slot as i64, false) {
            Ok(()) => Ok(Self { _file: file, slot }),
            Err(Errno::EAGAIN) | Err(Errno::EACCES) => Err(ProcessLockError::AlreadyRunning(slot)),
            Err(e) => Err(io::Error::from(e).into()),
        }
    }

    pub fn slot(&self) -> usize {
        self.slot
    }
}

/// Run `f` in a forked child and return its exit code. fcntl locks are
/// per process, so only another process can observe them.
#[cfg(test)]
pub(crate) fn run_in_child(f: impl FnOnce() -> i32) -> i32 {
    use nix::sys::wait::{waitpid, WaitStatus};
    use nix::unistd::{fork, ForkResult};

    // SAFETY: the child only issues syscalls and leaves with _exit.
    match unsafe { fork() }.unwrap() {
        ForkResult::Child => {
            let code = f();
            unsafe { libc::_exit(code) }
        }
        ForkResult::Parent { child } => match waitpid(child, None).unwrap() {
            WaitStatus::Exited(_, code) => code,
            other => panic!("child did not exit normally: {:?}", other),
        },
    }
}

/// A forked child holding one write-locked byte.
#[cfg(test)]
pub(crate) struct LockHolder(nix::unistd::Pid);

#[cfg(test)]
impl LockHolder {
    pub(crate) fn reap(self) {
        nix::sys::wait::waitpid(self.0, None).unwrap();
    }
}

/// Fork a child that write-locks `offset` of `path`, keeps it for `hold`
/// and exits. Returns once the lock is in place.
#[cfg(test)]
pub(crate) fn hold_lock_in_child(path: &Path, offset: i64, hold: std::time::Duration) -> LockHolder {
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;

    use nix::unistd::{fork, ForkResult};

    let file = File::options().read(true).write(true).open(path).unwrap();
    let (mut ready_rx, mut ready_tx) = UnixStream::pair().unwrap();
    // SAFETY: the child only issues syscalls and leaves with _exit.
    match unsafe { fork() }.unwrap() {
        ForkResult::Child => {
            let code = match set_lock(file.as_raw_fd(), l_type(LockKind::Write), offset, true) {
                Ok(()) => {
                    let _ = ready_tx.write_all(&[1]);
                    std::thread::sleep(hold);
                    0
                }
                Err(_) => 1,
            };
            unsafe { libc::_exit(code) }
        }
        ForkResult::Parent { child } => {
            drop(ready_tx);
            let mut byte = [0u8; 1];
            ready_rx.read_exact(&mut byte).unwrap();
            LockHolder(child)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_region_lock_roundtrip() {
        let temp = tempdir().unwrap();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(temp.path().join("id"))
            .unwrap();
        {
            let _guard = RegionLock::wait(&file, 0, LockKind::Write).unwrap();
            // fcntl locks are per process; the same process may relock.
            let again = RegionLock::try_lock(&file, 0, LockKind::Read).unwrap();
            assert!(again.is_some());
        }
        let read = RegionLock::wait(&file, 1, LockKind::Read).unwrap();
        drop(read);
    }

    #[test]
    fn test_process_lock_slot() {
        let temp = tempdir().unwrap();
        let lock = ProcessLock::acquire(temp.path(), afd_ipc::AMG_NO).unwrap();
        assert_eq!(lock.slot(), 0);
        assert!(temp.path().join(afd_ipc::AFD_LOCK_FILE).exists());
    }

    #[test]
    fn test_process_lock_refuses_second_instance() {
        let temp = tempdir().unwrap();
        let lock = ProcessLock::acquire(temp.path(), afd_ipc::AMG_NO).unwrap();
        // Opened once and kept: closing any descriptor of the lock file
        // would drop the slot held above.
        let path = temp.path().join(afd_ipc::AFD_LOCK_FILE);
        let file = File::options().read(true).write(true).open(&path).unwrap();
        let try_slot = |slot: usize| {
            run_in_child(|| match file.try_clone().map(|f| ProcessLock::lock_slot(f, slot)) {
                Ok(Ok(_)) => 0,
                Ok(Err(ProcessLockError::AlreadyRunning(s))) if s == slot => 2,
                _ => 1,
            })
        };

        assert_eq!(try_slot(afd_ipc::AMG_NO), 2, "second instance got the AMG slot");
        assert_eq!(try_slot(afd_ipc::AMG_NO + 1), 0);

        drop(lock);
        assert_eq!(try_slot(afd_ipc::AMG_NO), 0, "slot kept after the holder went away");
    }

    #[test]
    fn test_holder_reports_other_process_only() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("id");
        let file = File::options().read(true).write(true).create(true).open(&path).unwrap();
        let _guard = RegionLock::wait(&file, 0, LockKind::Write).unwrap();
        assert_eq!(RegionLock::holder(&file, 0).unwrap(), None);

        let parent = std::process::id() as libc::pid_t;
        let code = run_in_child(|| match RegionLock::holder(&file, 0) {
            Ok(Some(pid)) if pid == parent => 0,
            _ => 1,
        });
        assert_eq!(code, 0);
        let code = run_in_child(|| match RegionLock::holder(&file, 5) {
            Ok(None) => 0,
            _ => 1,
        });
        assert_eq!(code, 0);
    }
}
