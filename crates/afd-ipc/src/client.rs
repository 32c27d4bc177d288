//! Client side of the FIFO control bus, as used by edit dialogs and `afdctl`.

use crate::protocol::{
    DbUpdateRequest, DirConfigReply, HostConfigReply, UpdateReply, Verbosity,
};
use crate::{FifoError, AMG_CMD_FIFO, DB_UPDATE_FIFO, DB_UPDATE_REPLY_FIFO};
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::debug;

/// Default time to wait for AMG to answer a reread.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(60);

/// Open a FIFO for writing without blocking; fails with `NotRunning` when
/// nobody holds the read end.
pub fn open_fifo_writer(path: &Path) -> Result<File, FifoError> {
    OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
        .map_err(|e| match e.raw_os_error() {
            Some(libc::ENXIO) | Some(libc::ENOENT) => FifoError::NotRunning(path.to_path_buf()),
            _ => FifoError::Io(e),
        })
}

/// Write one command byte to a FIFO.
pub fn send_command(fifo: &Path, code: u8) -> Result<(), FifoError> {
    let mut file = open_fifo_writer(fifo)?;
    file.write_all(&[code])?;
    Ok(())
}

/// Ask AMG to shut down.
pub fn send_amg_command(fifo_dir: &Path, code: u8) -> Result<(), FifoError> {
    send_command(&fifo_dir.join(AMG_CMD_FIFO), code)
}

/// Path of the reply FIFO for `pid`.
pub fn reply_fifo_path(fifo_dir: &Path, pid: i32) -> PathBuf {
    fifo_dir.join(format!("{}{}", DB_UPDATE_REPLY_FIFO, pid))
}

/// Reply FIFO that removes itself when dropped.
struct ReplyFifo {
    path: PathBuf,
    file: File,
}

impl ReplyFifo {
    fn create(path: PathBuf) -> Result<Self, FifoError> {
        crate::make_fifo(&path)?;
        // Read/write so the open neither blocks nor sees EOF before AMG writes.
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&path)?;
        Ok(Self { path, file })
    }

    fn read_exact_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> Result<(), FifoError> {
        let deadline = Instant::now() + timeout;
        let mut filled = 0;
        while filled < buf.len() {
            match self.file.read(&mut buf[filled..]) {
                Ok(0) => return Err(FifoError::ShortReply(filled)),
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(FifoError::Timeout(timeout));
                    }
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

impl Drop for ReplyFifo {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Send a request that needs no reply.
pub fn send_db_update(fifo_dir: &Path, request: DbUpdateRequest) -> Result<(), FifoError> {
    let mut fifo = open_fifo_writer(&fifo_dir.join(DB_UPDATE_FIFO))?;
    fifo.write_all(&request.to_bytes())?;
    Ok(())
}

/// Ask AMG to reread HOST_CONFIG and wait for the 8-byte reply.
pub fn reread_host_config(
    fifo_dir: &Path,
    verbosity: Verbosity,
    timeout: Duration,
) -> Result<HostConfigReply, FifoError> {
    let pid = std::process::id() as i32;
    let mut reply = ReplyFifo::create(reply_fifo_path(fifo_dir, pid))?;
    send_db_update(
        fifo_dir,
        DbUpdateRequest::RereadHostConfig {
            reply_pid: pid,
            verbosity,
        },
    )?;
    debug!(pid, "Waiting for HOST_CONFIG reply");
    let mut buf = [0u8; HostConfigReply::SIZE];
    reply.read_exact_timeout(&mut buf, timeout)?;
    Ok(HostConfigReply::from_bytes(&buf))
}

/// Ask AMG to reread DIR_CONFIG and wait for the 16-byte reply.
pub fn reread_dir_config(
    fifo_dir: &Path,
    verbosity: Verbosity,
    timeout: Duration,
) -> Result<DirConfigReply, FifoError> {
    let pid = std::process::id() as i32;
    let mut reply = ReplyFifo::create(reply_fifo_path(fifo_dir, pid))?;
    send_db_update(
        fifo_dir,
        DbUpdateRequest::RereadDirConfig {
            reply_pid: pid,
            verbosity,
        },
    )?;
    debug!(pid, "Waiting for DIR_CONFIG reply");
    let mut buf = [0u8; DirConfigReply::SIZE];
    reply.read_exact_timeout(&mut buf, timeout)?;
    Ok(DirConfigReply::from_bytes(&buf))
}

/// Convenience wrapper returning a displayable reply.
pub fn reread(
    fifo_dir: &Path,
    dir_config: bool,
    verbosity: Verbosity,
    timeout: Duration,
) -> Result<UpdateReply, FifoError> {
    if dir_config {
        reread_dir_config(fifo_dir, verbosity, timeout).map(UpdateReply::Dir)
    } else {
        reread_host_config(fifo_dir, verbosity, timeout).map(UpdateReply::Host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_send_without_reader_reports_not_running() {
        let temp = tempdir().unwrap();
        let fifo = temp.path().join(AMG_CMD_FIFO);
        crate::make_fifo(&fifo).unwrap();
        match send_command(&fifo, crate::protocol::SHUTDOWN) {
            Err(FifoError::NotRunning(p)) => assert_eq!(p, fifo),
            other => panic!("expected NotRunning, got {:?}", other),
        }
    }

    #[test]
    fn test_reply_timeout_removes_fifo() {
        let temp = tempdir().unwrap();
        let path = reply_fifo_path(temp.path(), 99);
        {
            let mut reply = ReplyFifo::create(path.clone()).unwrap();
            let mut buf = [0u8; 8];
            let err = reply
                .read_exact_timeout(&mut buf, Duration::from_millis(30))
                .unwrap_err();
            assert!(matches!(err, FifoError::Timeout(_)));
            assert!(path.exists());
        }
        assert!(!path.exists());
    }
}
