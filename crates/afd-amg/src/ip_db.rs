//! Cache of resolved host addresses shared by all transfer workers.
//!
//! New entries only ever go to the tail. Every access holds the write lock
//! on byte 1 of the file, so the table behaves like a cross-process mutex
//! without blocking processes that merely attach or detach.

use std::fs::File;
use std::io::{self, Write};
use std::net::{IpAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};

use afd_ipc::{IpRecord, IP_DB_STRUCT_VERSION, IP_RECORD_SIZE, STRUCT_VERSION_OFFSET};
use chrono::TimeZone;
use serde::Serialize;
use tracing::debug;

use crate::lock::{LockKind, RegionLock};
use crate::shm::{stepped_size, MapMode, MappedTable, ShmError};

pub const IP_DB_STEP_SIZE: usize = 20;
const IP_DB_LOCK_OFFSET: i64 = 1;

#[derive(Debug, thiserror::Error)]
pub enum IpDbError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Mapped table error: {0}")]
    Shm(#[from] ShmError),
    #[error("{path}: IP database version {found}, expected {expected}")]
    Version {
        path: PathBuf,
        found: u8,
        expected: u8,
    },
    #[error("{0} did not resolve to any address")]
    Unresolved(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IpEntry {
    pub host: String,
    pub ip: String,
    pub last_mod_time: i64,
}

impl From<&IpRecord> for IpEntry {
    fn from(rec: &IpRecord) -> Self {
        Self {
            host: rec.host(),
            ip: rec.ip(),
            last_mod_time: rec.last_mod_time,
        }
    }
}

#[derive(Debug)]
pub struct IpDb {
    path: PathBuf,
    lock_file: File,
    table: MappedTable,
}

impl IpDb {
    /// Attach `fifo/ip_db`, creating it when missing.
    pub fn attach(fifo_dir: &Path) -> Result<Self, IpDbError> {
        let path = fifo_dir.join(afd_ipc::IP_DB_FILE);
        let table = MappedTable::attach(
            &path,
            stepped_size(0, IP_DB_STEP_SIZE, IP_RECORD_SIZE),
            MapMode::ReadWrite,
        )?;
        let lock_file = table.file().try_clone()?;
        let mut db = Self {
            path,
            lock_file,
            table,
        };
        {
            let lock_file = db.lock_file.try_clone()?;
            let _lock = RegionLock::wait(&lock_file, IP_DB_LOCK_OFFSET, LockKind::Write)?;
            db.check_version()?;
        }
        Ok(db)
    }

    fn check_version(&mut self) -> Result<(), IpDbError> {
        let version = self.table.bytes()[STRUCT_VERSION_OFFSET];
        if version == 0 && self.table.count() == 0 {
            let header = self.table.header_mut()?;
            *header = afd_ipc::AfdWordHeader::new(0, IP_DB_STRUCT_VERSION);
            debug!(path = %self.path.display(), "Initialised IP database");
            return Ok(());
        }
        if version != IP_DB_STRUCT_VERSION {
            return Err(IpDbError::Version {
                path: self.path.clone(),
                found: version,
                expected: IP_DB_STRUCT_VERSION,
            });
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Follow a resize done by another process. Must not reopen the file:
    /// closing any descriptor of it would drop the byte-1 lock.
    fn refresh(&mut self) -> Result<(), IpDbError> {
        self.table.remap()?;
        Ok(())
    }

    fn count(&self) -> usize {
        (self.table.count().max(0) as usize).min(self.table.capacity::<IpRecord>())
    }

    fn locked<R>(&mut self, f: impl FnOnce(&mut Self) -> Result<R, IpDbError>) -> Result<R, IpDbError> {
        let lock_file = self.lock_file.try_clone()?;
        let _lock = RegionLock::wait(&lock_file, IP_DB_LOCK_OFFSET, LockKind::Write)?;
        self.refresh()?;
        f(self)
    }

    fn position(&self, host: &str) -> Result<Option<usize>, IpDbError> {
        let count = self.count();
        Ok(self
            .table
            .records::<IpRecord>(count)?
            .iter()
            .position(|r| r.host() == host))
    }

    pub fn lookup(&mut self, host: &str) -> Result<Option<String>, IpDbError> {
        self.locked(|db| {
            let count = db.count();
            Ok(db
                .table
                .records::<IpRecord>(count)?
                .iter()
                .find(|r| r.host() == host)
                .map(|r| r.ip()))
        })
    }

    /// Store `ip` for `host`. An existing entry is updated in place; a host
    /// that is its own address is not stored.
    pub fn add(&mut self, host: &str, ip: &str) -> Result<bool, IpDbError> {
        if host == ip {
            return Ok(false);
        }
        let now = chrono::Utc::now().timestamp();
        self.locked(|db| {
            let count = db.count();
            if let Some(pos) = db.position(host)? {
                let rec = &mut db.table.records_mut::<IpRecord>(count)?[pos];
                afd_ipc::set_cstr(&mut rec.ip_str, ip);
                rec.last_mod_time = now;
                return Ok(true);
            }
            if count >= db.table.capacity::<IpRecord>() {
                db.table
                    .resize(stepped_size(count, IP_DB_STEP_SIZE, IP_RECORD_SIZE))?;
            }
            db.table.records_mut::<IpRecord>(count + 1)?[count] = IpRecord::new(host, ip, now);
            db.table.set_count(count as i32 + 1)?;
            debug!(host, ip, "Added host to IP database");
            Ok(true)
        })
    }

    pub fn remove(&mut self, host: &str) -> Result<bool, IpDbError> {
        self.locked(|db| {
            let count = db.count();
            let Some(pos) = db.position(host)? else {
                return Ok(false);
            };
            let recs = db.table.records_mut::<IpRecord>(count)?;
            recs.copy_within(pos + 1..count, pos);
            db.table.set_count(count as i32 - 1)?;
            if count - 1 + IP_DB_STEP_SIZE < db.table.capacity::<IpRecord>() {
                db.table
                    .resize(stepped_size(count - 1, IP_DB_STEP_SIZE, IP_RECORD_SIZE))?;
            }
            Ok(true)
        })
    }

    pub fn entries(&mut self) -> Result<Vec<IpEntry>, IpDbError> {
        self.locked(|db| {
            let count = db.count();
            Ok(db
                .table
                .records::<IpRecord>(count)?
                .iter()
                .map(IpEntry::from)
                .collect())
        })
    }

    pub fn current_hosts(&mut self) -> Result<Vec<String>, IpDbError> {
        Ok(self.entries()?.into_iter().map(|e| e.host).collect())
    }

    /// One line per entry, or only `host` when given.
    pub fn print(&mut self, out: &mut impl Write, host: Option<&str>) -> Result<(), IpDbError> {
        for entry in self.entries()? {
            if host.is_some_and(|h| h != entry.host) {
                continue;
            }
            let when = chrono::Local
                .timestamp_opt(entry.last_mod_time, 0)
                .single()
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| entry.last_mod_time.to_string());
            writeln!(out, "{:<30} {:<40} {}", entry.host, entry.ip, when)?;
        }
        Ok(())
    }

    /// Resolve `host` through the system resolver; with `store_ip` the
    /// address is recorded as well.
    pub fn resolve(&mut self, host: &str, store_ip: bool) -> Result<IpAddr, IpDbError> {
        let addr = (host, 0)
            .to_socket_addrs()?
            .next()
            .map(|sa| sa.ip())
            .ok_or_else(|| IpDbError::Unresolved(host.to_string()))?;
        if store_ip {
            self.add(host, &addr.to_string())?;
        }
        Ok(addr)
    }

    pub fn detach(self) -> Result<(), IpDbError> {
        self.table.detach()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::run_in_child;
    use tempfile::tempdir;

    #[test]
    fn test_add_lookup_remove() {
        let temp = tempdir().unwrap();
        let mut db = IpDb::attach(temp.path()).unwrap();
        assert!(db.add("alpha", "10.0.0.1").unwrap());
        assert!(db.add("beta", "10.0.0.2").unwrap());
        assert_eq!(db.lookup("alpha").unwrap().as_deref(), Some("10.0.0.1"));
        assert_eq!(db.lookup("gamma").unwrap(), None);

        assert!(db.remove("alpha").unwrap());
        assert!(!db.remove("alpha").unwrap());
        assert_eq!(db.current_hosts().unwrap(), vec!["beta".to_string()]);
    }

    #[test]
    fn test_self_address_is_not_stored() {
        let temp = tempdir().unwrap();
        let mut db = IpDb::attach(temp.path()).unwrap();
        assert!(!db.add("10.1.1.1", "10.1.1.1").unwrap());
        assert!(db.current_hosts().unwrap().is_empty());
    }

    #[test]
    fn test_update_in_place() {
        let temp = tempdir().unwrap();
        let mut db = IpDb::attach(temp.path()).unwrap();
        db.add("alpha", "10.0.0.1").unwrap();
        db.add("beta", "10.0.0.2").unwrap();
        db.add("alpha", "10.0.0.9").unwrap();
        let entries = db.entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].host, "alpha");
        assert_eq!(entries[0].ip, "10.0.0.9");
        assert!(entries[0].last_mod_time > 0);
    }

    #[test]
    fn test_growth_seen_by_second_handle() {
        let temp = tempdir().unwrap();
        let mut writer = IpDb::attach(temp.path()).unwrap();
        let mut reader = IpDb::attach(temp.path()).unwrap();
        for i in 0..(IP_DB_STEP_SIZE * 2) {
            writer.add(&format!("host{}", i), &format!("10.0.1.{}", i)).unwrap();
        }
        assert_eq!(reader.current_hosts().unwrap().len(), IP_DB_STEP_SIZE * 2);
        assert_eq!(reader.lookup("host39").unwrap().as_deref(), Some("10.0.1.39"));
    }

    #[test]
    fn test_lock_survives_remap_after_foreign_growth() {
        let temp = tempdir().unwrap();
        let mut db1 = IpDb::attach(temp.path()).unwrap();
        let mut db2 = IpDb::attach(temp.path()).unwrap();
        db1.add("first", "10.0.2.1").unwrap();
        for i in 0..=IP_DB_STEP_SIZE {
            db2.add(&format!("host{}", i), &format!("10.0.3.{}", i)).unwrap();
        }

        let observer = File::open(db1.path()).unwrap();
        let held = db1
            .locked(|db| {
                assert_eq!(db.table.capacity::<IpRecord>(), IP_DB_STEP_SIZE * 2);
                Ok(run_in_child(|| {
                    match RegionLock::holder(&observer, IP_DB_LOCK_OFFSET) {
                        Ok(Some(_)) => 0,
                        _ => 1,
                    }
                }))
            })
            .unwrap();
        assert_eq!(held, 0, "byte-1 lock not visible to another process");
        assert_eq!(db1.current_hosts().unwrap().len(), IP_DB_STEP_SIZE + 2);
    }

    #[test]
    fn test_print_and_resolve() {
        let temp = tempdir().unwrap();
        let mut db = IpDb::attach(temp.path()).unwrap();
        db.add("alpha", "10.0.0.1").unwrap();
        db.add("beta", "10.0.0.2").unwrap();
        let mut out = Vec::new();
        db.print(&mut out, Some("beta")).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("beta"));
        assert!(!text.contains("alpha"));

        let addr = db.resolve("127.0.0.1", true).unwrap();
        assert!(addr.is_loopback());
        // Literal addresses resolve to themselves and are not stored.
        assert_eq!(db.current_hosts().unwrap().len(), 2);
    }
}
