//! Generation-numbered memory-mapped tables.
//!
//! Every table is a file under `<work>/fifo/` that starts with an
//! [`AfdWordHeader`] followed by an array of fixed-size records. The file
//! grows in steps of whole records; other processes keep their old
//! mapping until the header count turns negative and they reattach.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};

use afd_ipc::{AfdWordHeader, CrcRecord, HostRecord, IpRecord, AFD_WORD_OFFSET, FILE_MODE};
use memmap2::{Mmap, MmapMut, MmapOptions};
use tracing::{debug, error};

#[derive(Debug, thiserror::Error)]
pub enum ShmError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("{path}: size {size} is smaller than the required {needed} bytes")]
    Size {
        path: PathBuf,
        size: usize,
        needed: usize,
    },
    #[error("{0}: mapped read-only")]
    ReadOnly(PathBuf),
}

/// Plain-old-data types that may be viewed directly inside a mapping.
///
/// # Safety
/// Implementors must be `repr(C)`, contain no pointers, accept every bit
/// pattern, and need no more than 8-byte alignment.
pub unsafe trait Record: Copy {}

unsafe impl Record for HostRecord {}
unsafe impl Record for CrcRecord {}
unsafe impl Record for IpRecord {}
unsafe impl Record for i32 {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapMode {
    ReadWrite,
    ReadOnly,
}

enum Map {
    ReadWrite(MmapMut),
    ReadOnly(Mmap),
}

/// Bytes needed for `count` records rounded up to the next multiple of
/// `step`, header included.
pub fn stepped_size(count: usize, step: usize, record_size: usize) -> usize {
    let slots = (count / step + 1) * step;
    AFD_WORD_OFFSET + slots * record_size
}

/// A mapped table: the open descriptor plus its mapping.
pub struct MappedTable {
    path: PathBuf,
    file: File,
    map: Map,
}

impl std::fmt::Debug for MappedTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedTable")
            .field("path", &self.path)
            .field("len", &self.len())
            .field("writable", &self.is_writable())
            .finish()
    }
}

impl MappedTable {
    /// Open or create `path`, extend it to at least `min_size` and map it.
    pub fn attach(path: &Path, min_size: usize, mode: MapMode) -> Result<Self, ShmError> {
        let file = match mode {
            MapMode::ReadWrite => OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .mode(FILE_MODE)
                .open(path)?,
            MapMode::ReadOnly => File::open(path)?,
        };
        let len = file.metadata()?.len() as usize;
        if len < min_size {
            if mode == MapMode::ReadOnly {
                return Err(ShmError::Size {
                    path: path.to_path_buf(),
                    size: len,
                    needed: min_size,
                });
            }
            file.set_len(min_size as u64)?;
            debug!(path = %path.display(), old = len, new = min_size, "Extended mapped file");
        }
        Self::map(path, file, mode, None)
    }

    /// Map an existing file without creating or extending it.
    pub fn open(path: &Path, mode: MapMode) -> Result<Self, ShmError> {
        let file = match mode {
            MapMode::ReadWrite => OpenOptions::new().read(true).write(true).open(path)?,
            MapMode::ReadOnly => File::open(path)?,
        };
        Self::map(path, file, mode, None)
    }

    /// Map only the header of an existing file.
    pub fn open_header(path: &Path) -> Result<Self, ShmError> {
        let file = File::open(path)?;
        Self::map(path, file, MapMode::ReadOnly, Some(AFD_WORD_OFFSET))
    }

    fn map(path: &Path, file: File, mode: MapMode, len: Option<usize>) -> Result<Self, ShmError> {
        let size = file.metadata()?.len() as usize;
        if size < AFD_WORD_OFFSET {
            return Err(ShmError::Size {
                path: path.to_path_buf(),
                size,
                needed: AFD_WORD_OFFSET,
            });
        }
        let mut opts = MmapOptions::new();
        if let Some(len) = len {
            opts.len(len);
        }
        // SAFETY: other AFD processes map the same file; all
        // access goes through the layout types and the header protocol.
        let map = unsafe {
            match mode {
                MapMode::ReadWrite => Map::ReadWrite(opts.map_mut(&file)?),
                MapMode::ReadOnly => Map::ReadOnly(opts.map(&file)?),
            }
        };
        Ok(Self {
            path: path.to_path_buf(),
            file,
            map,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn len(&self) -> usize {
        self.bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_writable(&self) -> bool {
        matches!(self.map, Map::ReadWrite(_))
    }

    pub fn bytes(&self) -> &[u8] {
        match &self.map {
            Map::ReadWrite(m) => m,
            Map::ReadOnly(m) => m,
        }
    }

    pub fn bytes_mut(&mut self) -> Result<&mut [u8], ShmError> {
        match &mut self.map {
            Map::ReadWrite(m) => Ok(&mut m[..]),
            Map::ReadOnly(_) => Err(ShmError::ReadOnly(self.path.clone())),
        }
    }

    pub fn header(&self) -> &AfdWordHeader {
        // SAFETY: every mapping is at least AFD_WORD_OFFSET bytes and page aligned.
        unsafe { &*(self.bytes().as_ptr() as *const AfdWordHeader) }
    }

    pub fn header_mut(&mut self) -> Result<&mut AfdWordHeader, ShmError> {
        let bytes = self.bytes_mut()?;
        // SAFETY: as for `header`, and the mapping is writable.
        Ok(unsafe { &mut *(bytes.as_mut_ptr() as *mut AfdWordHeader) })
    }

    fn count_atomic(&self) -> &AtomicI32 {
        // SAFETY: offset 0 is a 4-byte aligned i32 that other processes
        // read and write concurrently.
        unsafe { &*(self.bytes().as_ptr() as *const AtomicI32) }
    }

    /// Record count at header offset 0.
    pub fn count(&self) -> i32 {
        self.count_atomic().load(Ordering::Acquire)
    }

    /// Store the record count. `-1` tells readers to reattach.
    pub fn set_count(&self, count: i32) -> Result<(), ShmError> {
        if !self.is_writable() {
            return Err(ShmError::ReadOnly(self.path.clone()));
        }
        self.count_atomic().store(count, Ordering::Release);
        Ok(())
    }

    fn check_room<T: Record>(&self, n: usize) -> Result<(), ShmError> {
        let needed = AFD_WORD_OFFSET + n * std::mem::size_of::<T>();
        if needed > self.len() {
            return Err(ShmError::Size {
                path: self.path.clone(),
                size: self.len(),
                needed,
            });
        }
        Ok(())
    }

    /// Number of `T` records that fit behind the header.
    pub fn capacity<T: Record>(&self) -> usize {
        self.len().saturating_sub(AFD_WORD_OFFSET) / std::mem::size_of::<T>()
    }

    /// The first `n` records.
    pub fn records<T: Record>(&self, n: usize) -> Result<&[T], ShmError> {
        self.check_room::<T>(n)?;
        // SAFETY: bounds checked above; offset 16 of a page-aligned map is
        // 8-byte aligned, which satisfies every Record.
        Ok(unsafe {
            std::slice::from_raw_parts(self.bytes().as_ptr().add(AFD_WORD_OFFSET) as *const T, n)
        })
    }

    pub fn records_mut<T: Record>(&mut self, n: usize) -> Result<&mut [T], ShmError> {
        self.check_room::<T>(n)?;
        let bytes = self.bytes_mut()?;
        // SAFETY: as for `records`, and the mapping is writable.
        Ok(unsafe {
            std::slice::from_raw_parts_mut(bytes.as_mut_ptr().add(AFD_WORD_OFFSET) as *mut T, n)
        })
    }

    /// Grow or shrink the file and remap. Bytes below the old size survive.
    pub fn resize(&mut self, new_size: usize) -> Result<(), ShmError> {
        let new_size = new_size.max(AFD_WORD_OFFSET);
        let map = match &self.map {
            Map::ReadWrite(m) => {
                m.flush()?;
                self.file.set_len(new_size as u64)?;
                // SAFETY: see `map`.
                Map::ReadWrite(unsafe { MmapMut::map_mut(&self.file)? })
            }
            Map::ReadOnly(_) => return Err(ShmError::ReadOnly(self.path.clone())),
        };
        self.map = map;
        debug!(path = %self.path.display(), size = new_size, "Resized mapped table");
        Ok(())
    }

    /// Pick up a size change made by another process.
    ///
    /// Maps the current file length through the descriptor already held,
    /// so fcntl locks on this file stay in place. Returns whether the
    /// mapping changed.
    pub fn remap(&mut self) -> Result<bool, ShmError> {
        let size = self.file.metadata()?.len() as usize;
        if size == self.len() {
            return Ok(false);
        }
        if size < AFD_WORD_OFFSET {
            return Err(ShmError::Size {
                path: self.path.clone(),
                size,
                needed: AFD_WORD_OFFSET,
            });
        }
        // SAFETY: see `map`.
        let map = unsafe {
            match &self.map {
                Map::ReadWrite(m) => {
                    m.flush()?;
                    Map::ReadWrite(MmapMut::map_mut(&self.file)?)
                }
                Map::ReadOnly(_) => Map::ReadOnly(Mmap::map(&self.file)?),
            }
        };
        self.map = map;
        debug!(path = %self.path.display(), size, "Remapped after foreign resize");
        Ok(true)
    }

    pub fn flush(&self) -> Result<(), ShmError> {
        if let Map::ReadWrite(m) = &self.map {
            m.flush()?;
        }
        Ok(())
    }

    /// msync, unmap and close.
    pub fn detach(self) -> Result<(), ShmError> {
        self.flush()
    }

    /// Shutdown variant of [`detach`](Self::detach): never fails, logs instead.
    pub fn unmap_data(self) {
        if let Err(e) = self.file.metadata() {
            error!(path = %self.path.display(), error = %e, "Failed to stat mapped file before unmapping");
        }
        if let Err(e) = self.flush() {
            error!(path = %self.path.display(), error = %e, "msync failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use afd_ipc::CRC_RECORD_SIZE;
    use tempfile::tempdir;

    #[test]
    fn test_stepped_size() {
        assert_eq!(stepped_size(0, 50, 16), 16 + 50 * 16);
        assert_eq!(stepped_size(49, 50, 16), 16 + 50 * 16);
        assert_eq!(stepped_size(50, 50, 16), 16 + 100 * 16);
    }

    #[test]
    fn test_attach_creates_and_sizes() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("table");
        let table = MappedTable::attach(&path, 64, MapMode::ReadWrite).unwrap();
        assert_eq!(table.len(), 64);
        assert_eq!(table.count(), 0);
        assert_eq!(table.capacity::<CrcRecord>(), (64 - 16) / CRC_RECORD_SIZE);
    }

    #[test]
    fn test_short_file_is_size_error() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("short");
        std::fs::write(&path, [0u8; 8]).unwrap();
        match MappedTable::open(&path, MapMode::ReadOnly) {
            Err(ShmError::Size { size, .. }) => assert_eq!(size, 8),
            other => panic!("expected size error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let temp = tempdir().unwrap();
        let err = MappedTable::open(&temp.path().join("nope"), MapMode::ReadOnly).unwrap_err();
        assert!(matches!(err, ShmError::Io(ref e) if e.kind() == io::ErrorKind::NotFound));
    }

    #[test]
    fn test_resize_preserves_data_and_old_readers() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("grow");
        let mut writer = MappedTable::attach(&path, stepped_size(0, 2, 16), MapMode::ReadWrite).unwrap();
        {
            let recs = writer.records_mut::<CrcRecord>(2).unwrap();
            recs[0] = CrcRecord { crc: 1, flag: 2, timeout: 3 };
            recs[1] = CrcRecord { crc: 4, flag: 5, timeout: 6 };
        }
        writer.set_count(2).unwrap();

        let reader = MappedTable::open(&path, MapMode::ReadOnly).unwrap();
        writer.resize(stepped_size(2, 2, 16)).unwrap();
        assert_eq!(writer.capacity::<CrcRecord>(), 4);
        assert_eq!(writer.records::<CrcRecord>(2).unwrap()[1].crc, 4);

        // The reader still sees its old view and the shared count.
        assert_eq!(reader.records::<CrcRecord>(1).unwrap()[0].timeout, 3);
        writer.set_count(-1).unwrap();
        assert_eq!(reader.count(), -1);
        writer.detach().unwrap();
        reader.unmap_data();
    }

    #[test]
    fn test_remap_follows_foreign_growth() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("remap");
        let mut a = MappedTable::attach(&path, stepped_size(0, 2, 16), MapMode::ReadWrite).unwrap();
        let mut b = MappedTable::open(&path, MapMode::ReadWrite).unwrap();
        assert!(!a.remap().unwrap());

        b.resize(stepped_size(2, 2, 16)).unwrap();
        b.records_mut::<CrcRecord>(4).unwrap()[3].crc = 77;
        b.flush().unwrap();

        assert_eq!(a.capacity::<CrcRecord>(), 2);
        assert!(a.remap().unwrap());
        assert_eq!(a.capacity::<CrcRecord>(), 4);
        assert_eq!(a.records::<CrcRecord>(4).unwrap()[3].crc, 77);
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("ro");
        MappedTable::attach(&path, 32, MapMode::ReadWrite).unwrap().detach().unwrap();
        let mut ro = MappedTable::open(&path, MapMode::ReadOnly).unwrap();
        assert!(matches!(ro.set_count(3), Err(ShmError::ReadOnly(_))));
        assert!(matches!(ro.header_mut(), Err(ShmError::ReadOnly(_))));
        assert!(ro.records::<CrcRecord>(5).is_err());
    }

    #[test]
    fn test_header_only_mapping() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("hdr");
        let mut t = MappedTable::attach(&path, 1024, MapMode::ReadWrite).unwrap();
        t.header_mut().unwrap().feature_flags = afd_ipc::DISABLE_ARCHIVE;
        t.detach().unwrap();
        let hdr = MappedTable::open_header(&path).unwrap();
        assert_eq!(hdr.len(), AFD_WORD_OFFSET);
        assert_eq!(hdr.header().feature_flags, afd_ipc::DISABLE_ARCHIVE);
    }
}
