//! Shared job counter: one native-endian `i32` in a mapped file.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};

use memmap2::{MmapMut, MmapOptions};

use crate::lock::{LockKind, RegionLock};

const COUNTER_SIZE: usize = std::mem::size_of::<i32>();

#[derive(Debug, thiserror::Error)]
pub enum CounterError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid counter limit {0}")]
    InvalidMax(i32),
}

/// Handle on the counter file. Dropping it unmaps and closes.
pub struct Counter {
    path: PathBuf,
    file: File,
    map: MmapMut,
}

impl std::fmt::Debug for Counter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Counter")
            .field("path", &self.path)
            .field("value", &self.value())
            .finish()
    }
}

impl Counter {
    /// Open the counter, creating it with value 0 if missing.
    pub fn open(path: &Path) -> Result<Self, CounterError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(afd_ipc::FILE_MODE)
            .open(path)?;
        if file.metadata()?.len() < COUNTER_SIZE as u64 {
            file.set_len(COUNTER_SIZE as u64)?;
        }
        // SAFETY: the file is shared with other AFD processes; the value is
        // only touched through an aligned atomic.
        let map = unsafe { MmapOptions::new().len(COUNTER_SIZE).map_mut(&file)? };
        Ok(Self {
            path: path.to_path_buf(),
            file,
            map,
        })
    }

    /// Create or truncate the counter so it starts again at 0.
    pub fn create(path: &Path) -> Result<Self, CounterError> {
        let counter = Self::open(path)?;
        {
            let _lock = RegionLock::wait(&counter.file, 0, LockKind::Write)?;
            counter.cell().store(0, Ordering::Release);
        }
        Ok(counter)
    }

    fn cell(&self) -> &AtomicI32 {
        // SAFETY: the mapping is page aligned and at least 4 bytes long.
        unsafe { &*(self.map.as_ptr() as *const AtomicI32) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The value the next call to [`next`](Self::next) will hand out.
    pub fn value(&self) -> i32 {
        self.cell().load(Ordering::Acquire)
    }

    /// Hand out the next value in `0..max` under the byte-0 write lock.
    pub fn next(&self, max: i32) -> Result<i32, CounterError> {
        let _lock = RegionLock::wait(&self.file, 0, LockKind::Write)?;
        self.next_no_lock(max)
    }

    /// As [`next`](Self::next) for callers already holding the lock.
    pub fn next_no_lock(&self, max: i32) -> Result<i32, CounterError> {
        if max <= 0 {
            return Err(CounterError::InvalidMax(max));
        }
        let cell = self.cell();
        let mut current = cell.load(Ordering::Acquire);
        if current < 0 || current >= max {
            current = 0;
        }
        let following = match current.checked_add(1) {
            Some(v) if v < max => v,
            _ => 0,
        };
        cell.store(following, Ordering::Release);
        Ok(current)
    }

    pub fn close(self) -> Result<(), CounterError> {
        self.map.flush()?;
        Ok(())
    }
}
