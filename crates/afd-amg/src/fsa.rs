//! Filetransfer Status Area.
//!
//! One file per generation (`fsa_status.<id>`) plus `fsa.id` naming the
//! current one. Readers read-lock byte 0 of the id file, read the id and
//! map that generation. The writer write-locks it, builds generation
//! `id + 1` completely, publishes the new id and only then marks the old
//! mapping stale by storing `-1` in its host count.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::time::Duration;

use afd_ipc::{
    fsa_stat_file, AfdWordHeader, HostRecord, AFD_WORD_OFFSET, FILE_MODE, FSA_ID_FILE,
    FSA_STRUCT_VERSION, HOST_CONFIG_STATUS_MASK, HOST_NOT_IN_DIR_CONFIG, HOST_RECORD_SIZE,
};
use tracing::{debug, info, warn};

use crate::lock::{LockKind, RegionLock};
use crate::shm::{MapMode, MappedTable, ShmError};

#[derive(Debug, thiserror::Error)]
pub enum FsaError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Shared memory error: {0}")]
    Shm(#[from] ShmError),
    #[error("Cannot open FSA id file {0}: {1}")]
    NoIdFile(PathBuf, io::Error),
    #[error("FSA generation {0} does not exist")]
    NoGeneration(PathBuf),
    #[error("FSA struct version {found} does not match {expected}")]
    Version { found: u8, expected: u8 },
    #[error("FSA still being replaced after {0} attempts")]
    Stale(u32),
    #[error("Refusing to create an FSA without hosts")]
    NoHosts,
}

/// Retry discipline while attaching.
#[derive(Debug, Clone)]
pub struct AttachPolicy {
    pub enoent_retries: u32,
    pub enoent_sleep: Duration,
    pub stale_retries: u32,
    pub stale_sleep: Duration,
}

impl Default for AttachPolicy {
    fn default() -> Self {
        Self {
            enoent_retries: 9,
            enoent_sleep: Duration::from_secs(1),
            stale_retries: 200,
            stale_sleep: Duration::from_millis(400),
        }
    }
}

/// Header fields AMG sets when it builds a generation.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsaFlags {
    pub feature_flags: u8,
    pub ignore_first_errors: u8,
}

/// An attached FSA generation.
#[derive(Debug)]
pub struct Fsa {
    fifo_dir: PathBuf,
    id: i32,
    table: MappedTable,
}

fn read_id(file: &File) -> io::Result<i32> {
    let mut raw = [0u8; 4];
    file.read_exact_at(&mut raw, 0)?;
    Ok(i32::from_ne_bytes(raw))
}

fn open_id_file(fifo_dir: &Path, write: bool) -> Result<File, FsaError> {
    let path = fifo_dir.join(FSA_ID_FILE);
    let res = if write {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(FILE_MODE)
            .open(&path)
    } else {
        File::open(&path)
    };
    res.map_err(|e| FsaError::NoIdFile(path, e))
}

/// Copy the runtime state FD and the workers keep in a record.
fn carry_runtime(dst: &mut HostRecord, src: &HostRecord) {
    dst.last_connection = src.last_connection;
    dst.last_retry_time = src.last_retry_time;
    dst.first_error_time = src.first_error_time;
    dst.total_file_size = src.total_file_size;
    dst.bytes_send = src.bytes_send;
    dst.error_counter = src.error_counter;
    dst.total_errors = src.total_errors;
    dst.active_transfers = src.active_transfers;
    dst.jobs_queued = src.jobs_queued;
    dst.total_file_counter = src.total_file_counter;
    dst.file_counter_done = src.file_counter_done;
    dst.connections = src.connections;
    dst.original_toggle_pos = src.original_toggle_pos;
    dst.auto_toggle = src.auto_toggle;
    if dst.host_toggle_str[0] != 0 && src.host_toggle != 0 {
        dst.host_toggle = src.host_toggle;
    }
    let runtime_bits = src.host_status & !(HOST_CONFIG_STATUS_MASK | HOST_NOT_IN_DIR_CONFIG);
    dst.host_status |= runtime_bits;
}

impl Fsa {
    /// Attach read/write. `who` only shows up in the logs.
    pub fn attach(fifo_dir: &Path, who: &str) -> Result<Self, FsaError> {
        Self::attach_with(fifo_dir, who, MapMode::ReadWrite, &AttachPolicy::default())
    }

    /// Attach read-only.
    pub fn attach_passive(fifo_dir: &Path, silent: bool, who: &str) -> Result<Self, FsaError> {
        let res = Self::attach_with(fifo_dir, who, MapMode::ReadOnly, &AttachPolicy::default());
        if let (Err(e), false) = (&res, silent) {
            warn!(who, error = %e, "Failed to attach to FSA");
        }
        res
    }

    pub fn attach_with(
        fifo_dir: &Path,
        who: &str,
        mode: MapMode,
        policy: &AttachPolicy,
    ) -> Result<Self, FsaError> {
        let mut enoent = 0;
        let mut stale = 0;
        loop {
            let (id, table) = {
                let id_file = open_id_file(fifo_dir, false)?;
                let _lock = RegionLock::wait(&id_file, 0, LockKind::Read)?;
                let id = read_id(&id_file)?;
                let path = fsa_stat_file(fifo_dir, id);
                match MappedTable::open(&path, mode) {
                    Ok(table) => (id, table),
                    Err(ShmError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                        if enoent >= policy.enoent_retries {
                            return Err(FsaError::NoGeneration(path));
                        }
                        enoent += 1;
                        debug!(who, id, attempt = enoent, "FSA generation not there yet");
                        drop(_lock);
                        std::thread::sleep(policy.enoent_sleep);
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                }
            };

            let found = table.header().struct_version;
            if found != FSA_STRUCT_VERSION {
                return Err(FsaError::Version {
                    found,
                    expected: FSA_STRUCT_VERSION,
                });
            }

            let count = table.count();
            if count > 0 {
                let needed = AFD_WORD_OFFSET + count as usize * HOST_RECORD_SIZE;
                if table.len() < needed {
                    return Err(ShmError::Size {
                        path: table.path().to_path_buf(),
                        size: table.len(),
                        needed,
                    }
                    .into());
                }
                debug!(who, id, hosts = count, "Attached to FSA");
                return Ok(Self {
                    fifo_dir: fifo_dir.to_path_buf(),
                    id,
                    table,
                });
            }

            stale += 1;
            if stale >= policy.stale_retries {
                return Err(FsaError::Stale(stale));
            }
            drop(table);
            std::thread::sleep(policy.stale_sleep);
        }
    }

    /// Header of the current generation only.
    pub fn attach_features(fifo_dir: &Path, who: &str) -> Result<AfdWordHeader, FsaError> {
        let id_file = open_id_file(fifo_dir, false)?;
        let _lock = RegionLock::wait(&id_file, 0, LockKind::Read)?;
        let id = read_id(&id_file)?;
        let table = MappedTable::open_header(&fsa_stat_file(fifo_dir, id))?;
        let header = *table.header();
        if header.struct_version != FSA_STRUCT_VERSION {
            return Err(FsaError::Version {
                found: header.struct_version,
                expected: FSA_STRUCT_VERSION,
            });
        }
        debug!(who, id, "Read FSA features");
        Ok(header)
    }

    /// Whether the published id differs from `old_id`.
    pub fn check_id_changed(fifo_dir: &Path, old_id: i32) -> Result<bool, FsaError> {
        let id_file = open_id_file(fifo_dir, false)?;
        let _lock = RegionLock::wait(&id_file, 0, LockKind::Read)?;
        Ok(read_id(&id_file)? != old_id)
    }

    /// Current id, or `None` when no FSA was ever created.
    pub fn current_id(fifo_dir: &Path) -> Result<Option<i32>, FsaError> {
        match open_id_file(fifo_dir, false) {
            Ok(f) => {
                let _lock = RegionLock::wait(&f, 0, LockKind::Read)?;
                Ok(Some(read_id(&f)?))
            }
            Err(FsaError::NoIdFile(_, e)) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Build and publish the next generation.
    ///
    /// Runtime counters of hosts whose alias already existed are carried
    /// over from the previous generation, which is then marked stale,
    /// unmapped and removed.
    pub fn create(
        fifo_dir: &Path,
        hosts: &[HostRecord],
        flags: FsaFlags,
        previous: Option<Fsa>,
    ) -> Result<Fsa, FsaError> {
        if hosts.is_empty() {
            return Err(FsaError::NoHosts);
        }

        let id_file = open_id_file(fifo_dir, true)?;
        let lock = RegionLock::wait(&id_file, 0, LockKind::Write)?;
        let old_id = if id_file.metadata()?.len() >= 4 {
            Some(read_id(&id_file)?)
        } else {
            None
        };
        let new_id = old_id.map_or(1, |id| id.wrapping_add(1).max(1));

        let old = match (previous, old_id) {
            (Some(fsa), _) => Some(fsa),
            (None, Some(id)) => match MappedTable::open(&fsa_stat_file(fifo_dir, id), MapMode::ReadWrite) {
                Ok(table) if table.header().struct_version == FSA_STRUCT_VERSION => Some(Fsa {
                    fifo_dir: fifo_dir.to_path_buf(),
                    id,
                    table,
                }),
                Ok(_) => {
                    warn!(id, "Previous FSA has a different struct version, not carrying state");
                    None
                }
                Err(_) => None,
            },
            (None, None) => None,
        };

        let new_path = fsa_stat_file(fifo_dir, new_id);
        match std::fs::remove_file(&new_path) {
            Ok(()) => warn!(path = %new_path.display(), "Removed leftover FSA generation file"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let size = AFD_WORD_OFFSET + hosts.len() * HOST_RECORD_SIZE;
        let mut table = MappedTable::attach(&new_path, size, MapMode::ReadWrite)?;
        {
            let header = table.header_mut()?;
            *header = AfdWordHeader::new(0, FSA_STRUCT_VERSION);
            header.feature_flags = flags.feature_flags;
            header.ignore_first_errors = flags.ignore_first_errors;
            header.host_config_counter = old
                .as_ref()
                .map_or(0, |o| o.header().host_config_counter);
        }
        {
            let records = table.records_mut::<HostRecord>(hosts.len())?;
            records.copy_from_slice(hosts);
            if let Some(old) = &old {
                for rec in records.iter_mut() {
                    if let Some(pos) = old.position(&rec.alias()) {
                        carry_runtime(rec, &old.hosts()[pos]);
                    }
                }
            }
        }
        table.set_count(hosts.len() as i32)?;
        table.flush()?;

        id_file.write_all_at(&new_id.to_ne_bytes(), 0)?;
        id_file.sync_all()?;
        drop(lock);

        if let Some(old) = old {
            let old_path = old.table.path().to_path_buf();
            old.table.set_count(-1)?;
            old.detach()?;
            if let Err(e) = std::fs::remove_file(&old_path) {
                warn!(path = %old_path.display(), error = %e, "Failed to remove old FSA generation");
            }
        }

        info!(id = new_id, hosts = hosts.len(), "Created FSA generation");
        Ok(Fsa {
            fifo_dir: fifo_dir.to_path_buf(),
            id: new_id,
            table,
        })
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn path(&self) -> &Path {
        self.table.path()
    }

    /// Host count; negative once a newer generation replaced this one.
    pub fn raw_count(&self) -> i32 {
        self.table.count()
    }

    pub fn is_stale(&self) -> bool {
        self.table.count() < 0
    }

    pub fn num_hosts(&self) -> usize {
        self.table.count().max(0) as usize
    }

    pub fn header(&self) -> &AfdWordHeader {
        self.table.header()
    }

    pub fn header_mut(&mut self) -> Result<&mut AfdWordHeader, FsaError> {
        Ok(self.table.header_mut()?)
    }

    pub fn feature_flags(&self) -> u8 {
        self.header().feature_flags
    }

    /// Records of this generation. A stale generation is still readable
    /// through the size it was attached with.
    pub fn hosts(&self) -> &[HostRecord] {
        let n = self.table.capacity::<HostRecord>();
        self.table.records(n).unwrap_or(&[])
    }

    pub fn hosts_mut(&mut self) -> Result<&mut [HostRecord], FsaError> {
        let n = self.table.capacity::<HostRecord>();
        Ok(self.table.records_mut(n)?)
    }

    pub fn position(&self, alias: &str) -> Option<usize> {
        self.hosts().iter().position(|h| h.alias() == alias)
    }

    pub fn bump_host_config_counter(&mut self) -> Result<u8, FsaError> {
        let header = self.header_mut()?;
        header.host_config_counter = header.host_config_counter.wrapping_add(1);
        Ok(header.host_config_counter)
    }

    /// Reattach when a newer generation has been published.
    pub fn reattach_if_stale(&mut self, who: &str) -> Result<bool, FsaError> {
        if !self.is_stale() {
            return Ok(false);
        }
        let mode = if self.table.is_writable() {
            MapMode::ReadWrite
        } else {
            MapMode::ReadOnly
        };
        let fresh = Fsa::attach_with(&self.fifo_dir, who, mode, &AttachPolicy::default())?;
        let old = std::mem::replace(self, fresh);
        old.detach()?;
        Ok(true)
    }

    pub fn detach(self) -> Result<(), FsaError> {
        Ok(self.table.detach()?)
    }

    pub fn flush(&self) -> Result<(), FsaError> {
        Ok(self.table.flush()?)
    }
}
