//! Duplicate-check store.
//!
//! Each job keeps its own table `files/crc/<job-id-hex>` of fingerprints
//! with an expiry time. The header count is at offset 0, the next sweep
//! deadline at offset 4 and the struct version at offset 15.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

use afd_config::{log_dupcheck_debug, log_dupcheck_warn};
use afd_ipc::{
    CrcRecord, CRC_CLEANUP_OFFSET, CRC_RECORD_SIZE, CRC_STRUCT_VERSION, CRC_VERSION_OFFSET,
    DC_CRC32C, DC_DELETE, DC_FILENAME_AND_SIZE, DC_FILENAME_ONLY, DC_FILE_CONTENT,
    DC_FILE_CONT_NAME, DC_MURMUR3, DC_NAME_NO_SUFFIX, DC_STORE, DC_WARN, TIMEOUT_IS_FIXED,
};

use crate::lock::{LockKind, RegionLock};
use crate::shm::{stepped_size, MapMode, MappedTable, ShmError};

/// Records added per resize.
pub const CRC_STEP_SIZE: usize = 50;
pub const DUPCHECK_MIN_CHECK_TIME: i64 = 10;
pub const DUPCHECK_MAX_CHECK_TIME: i64 = 3600;

const READ_CHUNK: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum DupCheckError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Mapped table error: {0}")]
    Shm(#[from] ShmError),
    #[error("{path}: dup-check store version {found}, expected {expected}")]
    Version {
        path: PathBuf,
        found: u8,
        expected: u8,
    },
}

// ---------------------------------------------------------------------------
// Hash functions
// ---------------------------------------------------------------------------

const CRC32C_POLY: u32 = 0x82F6_3B78;

const fn crc32c_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ CRC32C_POLY
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static CRC32C_TABLE: [u32; 256] = crc32c_table();

/// Incremental CRC-32C (Castagnoli).
#[derive(Debug, Clone)]
pub struct Crc32c {
    state: u32,
    hardware: bool,
}

impl Crc32c {
    /// `hardware` selects the SSE 4.2 instruction when the CPU has it.
    pub fn new(hardware: bool) -> Self {
        Self {
            state: !0,
            hardware: hardware && have_hw_crc32(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        #[cfg(target_arch = "x86_64")]
        if self.hardware {
            // SAFETY: `hardware` is only set after sse4.2 was detected.
            self.state = unsafe { crc32c_sse42(self.state, data) };
            return;
        }
        self.state = crc32c_soft(self.state, data);
    }

    pub fn finalize(&self) -> u32 {
        !self.state
    }
}

fn crc32c_soft(mut crc: u32, data: &[u8]) -> u32 {
    for &b in data {
        crc = CRC32C_TABLE[((crc ^ u32::from(b)) & 0xff) as usize] ^ (crc >> 8);
    }
    crc
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "sse4.2")]
unsafe fn crc32c_sse42(crc: u32, data: &[u8]) -> u32 {
    use std::arch::x86_64::{_mm_crc32_u64, _mm_crc32_u8};

    let mut crc64 = u64::from(crc);
    let mut chunks = data.chunks_exact(8);
    for chunk in &mut chunks {
        let mut word = [0u8; 8];
        word.copy_from_slice(chunk);
        crc64 = _mm_crc32_u64(crc64, u64::from_le_bytes(word));
    }
    let mut crc = crc64 as u32;
    for &b in chunks.remainder() {
        crc = _mm_crc32_u8(crc, b);
    }
    crc
}

/// Whether the CPU offers a CRC-32C instruction.
pub fn have_hw_crc32() -> bool {
    #[cfg(target_arch = "x86_64")]
    {
        std::arch::is_x86_feature_detected!("sse4.2")
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        false
    }
}

/// Incremental MurmurHash3 x86_32, seed 0.
#[derive(Debug, Clone, Default)]
pub struct Murmur3 {
    h: u32,
    tail: [u8; 4],
    tail_len: usize,
    total: u64,
}

const M3_C1: u32 = 0xcc9e_2d51;
const M3_C2: u32 = 0x1b87_3593;

fn murmur3_scramble(k: u32) -> u32 {
    k.wrapping_mul(M3_C1).rotate_left(15).wrapping_mul(M3_C2)
}

impl Murmur3 {
    pub fn new() -> Self {
        Self::default()
    }

    fn block(&mut self, k: u32) {
        self.h ^= murmur3_scramble(k);
        self.h = self.h.rotate_left(13).wrapping_mul(5).wrapping_add(0xe654_6b64);
    }

    pub fn update(&mut self, mut data: &[u8]) {
        self.total += data.len() as u64;
        if self.tail_len > 0 {
            let take = (4 - self.tail_len).min(data.len());
            self.tail[self.tail_len..self.tail_len + take].copy_from_slice(&data[..take]);
            self.tail_len += take;
            data = &data[take..];
            if self.tail_len < 4 {
                return;
            }
            let k = u32::from_le_bytes(self.tail);
            self.block(k);
            self.tail_len = 0;
        }
        let mut chunks = data.chunks_exact(4);
        for chunk in &mut chunks {
            let mut word = [0u8; 4];
            word.copy_from_slice(chunk);
            self.block(u32::from_le_bytes(word));
        }
        let rest = chunks.remainder();
        self.tail[..rest.len()].copy_from_slice(rest);
        self.tail_len = rest.len();
    }

    pub fn finalize(&self) -> u32 {
        let mut h = self.h;
        if self.tail_len > 0 {
            let mut k = 0u32;
            for i in (0..self.tail_len).rev() {
                k = (k << 8) | u32::from(self.tail[i]);
            }
            h ^= murmur3_scramble(k);
        }
        h ^= self.total as u32;
        h ^= h >> 16;
        h = h.wrapping_mul(0x85eb_ca6b);
        h ^= h >> 13;
        h = h.wrapping_mul(0xc2b2_ae35);
        h ^ (h >> 16)
    }
}

enum Fingerprinter {
    Crc32(crc32fast::Hasher),
    Crc32c(Crc32c),
    Murmur3(Murmur3),
}

impl Fingerprinter {
    fn for_flag(flag: u32, hw_crc32: bool) -> Self {
        if flag & DC_CRC32C != 0 {
            Self::Crc32c(Crc32c::new(hw_crc32))
        } else if flag & DC_MURMUR3 != 0 {
            Self::Murmur3(Murmur3::new())
        } else {
            Self::Crc32(crc32fast::Hasher::new())
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Self::Crc32(h) => h.update(data),
            Self::Crc32c(h) => h.update(data),
            Self::Murmur3(h) => h.update(data),
        }
    }

    fn finalize(self) -> u32 {
        match self {
            Self::Crc32(h) => h.finalize(),
            Self::Crc32c(h) => h.finalize(),
            Self::Murmur3(h) => h.finalize(),
        }
    }
}

fn stream_file(path: &Path, hasher: &mut Fingerprinter) -> io::Result<()> {
    let mut reader = BufReader::with_capacity(READ_CHUNK, File::open(path)?);
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            return Ok(());
        }
        hasher.update(&buf[..n]);
    }
}

/// Fingerprint of one file according to the scope and algorithm bits of
/// `flag`. `filename` overrides the base name taken from `fullname`.
pub fn fingerprint(
    fullname: &Path,
    filename: Option<&str>,
    size: u64,
    flag: u32,
    hw_crc32: bool,
) -> Result<u32, DupCheckError> {
    let base = match filename {
        Some(name) => name.to_string(),
        None => fullname
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
    };
    let mut hasher = Fingerprinter::for_flag(flag, hw_crc32);

    if flag & DC_FILENAME_ONLY != 0 {
        hasher.update(base.as_bytes());
    } else if flag & DC_FILENAME_AND_SIZE != 0 {
        hasher.update(base.as_bytes());
        hasher.update(b" ");
        hasher.update(&(size as i64).to_le_bytes());
    } else if flag & DC_NAME_NO_SUFFIX != 0 {
        let stem = base.rfind('.').map_or(base.as_str(), |p| &base[..p]);
        hasher.update(stem.as_bytes());
    } else if flag & DC_FILE_CONTENT != 0 {
        stream_file(fullname, &mut hasher)?;
    } else if flag & DC_FILE_CONT_NAME != 0 {
        hasher.update(base.as_bytes());
        stream_file(fullname, &mut hasher)?;
    } else {
        hasher.update(base.as_bytes());
    }
    Ok(hasher.finalize())
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// One lookup against a job's store.
#[derive(Debug, Clone, Copy)]
pub struct DupCheckRequest<'a> {
    pub fullname: &'a Path,
    pub filename: Option<&'a str>,
    pub size: u64,
    pub job_id: u32,
    pub timeout: i64,
    pub flag: u32,
    /// Hold a write lock on byte 0 of the store for the call.
    pub lock: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    Removed,
    NotFound,
}

/// What [`handle_duplicate`] did with a duplicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DupAction {
    Deleted,
    Stored(PathBuf),
    Warned,
    Kept,
}

pub fn crc_file(crc_dir: &Path, job_id: u32) -> PathBuf {
    crc_dir.join(format!("{:x}", job_id))
}

fn deadline_after(now: i64, timeout: i64) -> i64 {
    let t = timeout.clamp(DUPCHECK_MIN_CHECK_TIME, DUPCHECK_MAX_CHECK_TIME);
    (now / t) * t + t
}

fn live_count(table: &MappedTable) -> usize {
    (table.count().max(0) as usize).min(table.capacity::<CrcRecord>())
}

fn cleanup_deadline(table: &MappedTable) -> i64 {
    let b = &table.bytes()[CRC_CLEANUP_OFFSET..CRC_CLEANUP_OFFSET + 4];
    i64::from(u32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
}

fn set_cleanup_deadline(table: &mut MappedTable, deadline: i64) -> Result<(), ShmError> {
    let bytes = table.bytes_mut()?;
    let value = u32::try_from(deadline).unwrap_or(u32::MAX);
    bytes[CRC_CLEANUP_OFFSET..CRC_CLEANUP_OFFSET + 4].copy_from_slice(&value.to_ne_bytes());
    Ok(())
}

/// Drop every entry with `timeout <= now`; returns how many went.
fn compact_expired(table: &mut MappedTable, now: i64) -> Result<usize, ShmError> {
    let count = live_count(table);
    let recs = table.records_mut::<CrcRecord>(count)?;
    let mut kept = 0;
    for i in 0..count {
        if recs[i].timeout > now {
            recs[kept] = recs[i];
            kept += 1;
        }
    }
    table.set_count(kept as i32)?;
    Ok(count - kept)
}

/// Second descriptor for the byte-0 lock, so the lock does not borrow the
/// table. Dropped only after the lock is released.
fn store_lock_file(table: &MappedTable, lock: bool) -> io::Result<Option<File>> {
    if lock {
        table.file().try_clone().map(Some)
    } else {
        Ok(None)
    }
}

fn lock_store(file: Option<&File>) -> io::Result<Option<RegionLock<'_>>> {
    file.map(|f| RegionLock::wait(f, 0, LockKind::Write)).transpose()
}

/// Per-process access to the dup-check stores of many jobs.
#[derive(Debug)]
pub struct DupCheck {
    crc_dir: PathBuf,
    hw_crc32: bool,
    stay_attached: bool,
    attached: Option<(u32, MappedTable)>,
}

impl DupCheck {
    pub fn new(crc_dir: &Path) -> Self {
        Self {
            crc_dir: crc_dir.to_path_buf(),
            hw_crc32: false,
            stay_attached: false,
            attached: None,
        }
    }

    pub fn with_hw_crc32(mut self, enabled: bool) -> Self {
        self.hw_crc32 = enabled && have_hw_crc32();
        self
    }

    /// Keep the last job's store mapped between calls.
    pub fn stay_attached(mut self, enabled: bool) -> Self {
        self.stay_attached = enabled;
        self
    }

    fn open_store(&self, job_id: u32, now: i64, timeout: i64) -> Result<MappedTable, DupCheckError> {
        let path = crc_file(&self.crc_dir, job_id);
        let mut table = MappedTable::attach(
            &path,
            stepped_size(0, CRC_STEP_SIZE, CRC_RECORD_SIZE),
            MapMode::ReadWrite,
        )?;
        let version = table.bytes()[CRC_VERSION_OFFSET];
        if version == 0 && table.count() == 0 {
            table.bytes_mut()?[CRC_VERSION_OFFSET] = CRC_STRUCT_VERSION;
            log_dupcheck_debug!(path = %path.display(), "Created dup-check store");
        } else if version != CRC_STRUCT_VERSION {
            return Err(DupCheckError::Version {
                path,
                found: version,
                expected: CRC_STRUCT_VERSION,
            });
        }
        if table.count() < 0 || table.count() as usize > table.capacity::<CrcRecord>() {
            log_dupcheck_warn!(
                path = %path.display(),
                count = table.count(),
                "Dup-check store count out of range, resetting"
            );
            table.set_count(0)?;
        }
        if cleanup_deadline(&table) == 0 {
            set_cleanup_deadline(&mut table, deadline_after(now, timeout))?;
        }
        Ok(table)
    }

    fn take_store(&mut self, job_id: u32, now: i64, timeout: i64) -> Result<MappedTable, DupCheckError> {
        match self.attached.take() {
            Some((id, table)) if id == job_id => Ok(table),
            Some((_, other)) => {
                other.detach()?;
                self.open_store(job_id, now, timeout)
            }
            None => self.open_store(job_id, now, timeout),
        }
    }

    fn put_back(&mut self, job_id: u32, table: MappedTable) -> Result<(), DupCheckError> {
        if self.stay_attached {
            self.attached = Some((job_id, table));
            Ok(())
        } else {
            table.detach().map_err(Into::into)
        }
    }

    /// Whether the file was seen within its timeout; records it if not.
    pub fn is_dup(&mut self, req: &DupCheckRequest<'_>) -> Result<bool, DupCheckError> {
        self.is_dup_at(req, chrono::Utc::now().timestamp())
    }

    pub fn is_dup_at(&mut self, req: &DupCheckRequest<'_>, now: i64) -> Result<bool, DupCheckError> {
        let crc = fingerprint(req.fullname, req.filename, req.size, req.flag, self.hw_crc32)?;
        if crc == 0 {
            log_dupcheck_debug!(file = %req.fullname.display(), "Fingerprint is 0, not checking");
            return Ok(false);
        }

        let mut table = self.take_store(req.job_id, now, req.timeout)?;
        let lock_file = store_lock_file(&table, req.lock)?;
        let _lock = lock_store(lock_file.as_ref())?;
        table.remap()?;

        if now > cleanup_deadline(&table) {
            let removed = compact_expired(&mut table, now)?;
            set_cleanup_deadline(&mut table, deadline_after(now, req.timeout))?;
            if removed > 0 {
                log_dupcheck_debug!(job_id = %format!("{:x}", req.job_id), removed, "Swept expired fingerprints");
            }
        }

        let count = live_count(&table);
        let mut is_dup = false;
        let mut found = false;
        {
            let recs = table.records_mut::<CrcRecord>(count)?;
            if let Some(rec) = recs.iter_mut().find(|r| r.crc == crc && r.flag == req.flag) {
                found = true;
                if rec.timeout > now {
                    is_dup = true;
                    if req.flag & TIMEOUT_IS_FIXED == 0 {
                        rec.timeout = now + req.timeout;
                    }
                } else {
                    rec.timeout = now + req.timeout;
                }
            }
        }
        compact_expired(&mut table, now)?;

        if !found {
            let count = live_count(&table);
            if count >= table.capacity::<CrcRecord>() {
                table.resize(stepped_size(count, CRC_STEP_SIZE, CRC_RECORD_SIZE))?;
            }
            table.records_mut::<CrcRecord>(count + 1)?[count] = CrcRecord {
                crc,
                flag: req.flag,
                timeout: now + req.timeout,
            };
            table.set_count(count as i32 + 1)?;
        }

        drop(_lock);
        self.put_back(req.job_id, table)?;
        Ok(is_dup)
    }

    /// Remove the first entry matching the file's fingerprint.
    pub fn is_dup_rm(&mut self, req: &DupCheckRequest<'_>) -> Result<RemoveOutcome, DupCheckError> {
        let crc = fingerprint(req.fullname, req.filename, req.size, req.flag, self.hw_crc32)?;
        if crc == 0 {
            return Ok(RemoveOutcome::NotFound);
        }
        let now = chrono::Utc::now().timestamp();
        let mut table = self.take_store(req.job_id, now, req.timeout)?;
        let lock_file = store_lock_file(&table, req.lock)?;
        let _lock = lock_store(lock_file.as_ref())?;
        table.remap()?;
        let count = live_count(&table);
        let outcome = {
            let recs = table.records_mut::<CrcRecord>(count)?;
            match recs.iter().position(|r| r.crc == crc && r.flag == req.flag) {
                Some(pos) => {
                    recs.copy_within(pos + 1..count, pos);
                    recs[count - 1] = CrcRecord::default();
                    RemoveOutcome::Removed
                }
                None => RemoveOutcome::NotFound,
            }
        };
        if outcome == RemoveOutcome::Removed {
            table.set_count(count as i32 - 1)?;
        }
        drop(_lock);
        self.put_back(req.job_id, table)?;
        Ok(outcome)
    }

    /// Release a store kept by [`stay_attached`](Self::stay_attached).
    pub fn isdup_detach(&mut self) -> Result<(), DupCheckError> {
        if let Some((_, table)) = self.attached.take() {
            table.detach()?;
        }
        Ok(())
    }
}

/// Snapshot of a job's store without modifying it.
pub fn list(crc_dir: &Path, job_id: u32) -> Result<Vec<CrcRecord>, DupCheckError> {
    let table = MappedTable::open(&crc_file(crc_dir, job_id), MapMode::ReadOnly)?;
    let count = live_count(&table);
    Ok(table.records::<CrcRecord>(count)?.to_vec())
}

/// Apply the duplicate policy bits of `flag` to `path`.
pub fn handle_duplicate(
    path: &Path,
    job_id: u32,
    flag: u32,
    store_dir: &Path,
) -> Result<DupAction, DupCheckError> {
    if flag & DC_DELETE != 0 {
        std::fs::remove_file(path)?;
        log_dupcheck_debug!(file = %path.display(), "Deleted duplicate");
        return Ok(DupAction::Deleted);
    }
    if flag & DC_STORE != 0 {
        let dir = store_dir.join(format!("{:x}", job_id));
        std::fs::create_dir_all(&dir)?;
        let name = path.file_name().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "duplicate has no file name")
        })?;
        let target = dir.join(name);
        if let Err(e) = std::fs::rename(path, &target) {
            if e.raw_os_error() != Some(libc::EXDEV) {
                return Err(e.into());
            }
            std::fs::copy(path, &target)?;
            std::fs::remove_file(path)?;
        }
        log_dupcheck_debug!(file = %path.display(), target = %target.display(), "Stored duplicate");
        return Ok(DupAction::Stored(target));
    }
    if flag & DC_WARN != 0 {
        log_dupcheck_warn!(file = %path.display(), job_id = %format!("{:x}", job_id), "Duplicate file");
        return Ok(DupAction::Warned);
    }
    Ok(DupAction::Kept)
}
