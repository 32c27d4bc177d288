//! Spool directories on more than one filesystem.
//!
//! Every root gets the usual `archive` and `files/{pool,outgoing,time}`
//! tree. The primary root then holds one symlink per filesystem, named by
//! device id in hex, in each of those four directories, so workers always
//! address `<primary>/files/outgoing/<dev-hex>/...` whichever filesystem
//! the data lives on.

use std::collections::HashSet;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use afd_config::path::{
    create_dir_mode, expand_tilde, ARCHIVE_DIR, DIR_MODE, FILES_DIR, OUTGOING_DIR, POOL_DIR,
    TIME_DIR,
};
use afd_config::{log_amg_info, log_amg_warn, WorkDir};
use tracing::debug;

/// One spool root and the device it lives on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtraWorkDir {
    pub root: PathBuf,
    pub dev: u64,
}

/// Directories below a root that take part in the link farm.
fn link_subdirs() -> [PathBuf; 4] {
    [
        PathBuf::from(ARCHIVE_DIR),
        Path::new(FILES_DIR).join(POOL_DIR),
        Path::new(FILES_DIR).join(OUTGOING_DIR),
        Path::new(FILES_DIR).join(TIME_DIR),
    ]
}

/// Primary root first, then every configured extra root. `~user` paths
/// are expanded and relative ones resolve below `<primary>/files`.
pub fn resolve_roots(work: &WorkDir, configured: &[String]) -> Vec<PathBuf> {
    let mut roots = vec![work.root().to_path_buf()];
    for entry in configured {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let path = if entry.starts_with('~') {
            match expand_tilde(entry) {
                Some(p) => p,
                None => {
                    log_amg_warn!(path = entry, "Cannot expand extra work dir, ignored");
                    continue;
                }
            }
        } else if Path::new(entry).is_absolute() {
            PathBuf::from(entry)
        } else {
            work.files_dir().join(entry)
        };
        if roots.contains(&path) {
            continue;
        }
        roots.push(path);
    }
    roots
}

fn device_of(path: &Path) -> io::Result<u64> {
    Ok(std::fs::metadata(path)?.dev())
}

/// Build the directory trees and the link farm using the real device ids.
pub fn setup(work: &WorkDir, configured: &[String]) -> io::Result<Vec<ExtraWorkDir>> {
    setup_with(&resolve_roots(work, configured), device_of)
}

/// As [`setup`], with the device lookup supplied by the caller.
pub fn setup_with(
    roots: &[PathBuf],
    dev_of: impl Fn(&Path) -> io::Result<u64>,
) -> io::Result<Vec<ExtraWorkDir>> {
    let Some(primary) = roots.first() else {
        return Ok(Vec::new());
    };

    let mut dirs = Vec::with_capacity(roots.len());
    for root in roots {
        create_dir_mode(&root.join(FILES_DIR), DIR_MODE)?;
        for sub in link_subdirs() {
            create_dir_mode(&root.join(sub), DIR_MODE)?;
        }
        let dev = dev_of(root)?;
        if let Some(other) = dirs.iter().find(|d: &&ExtraWorkDir| d.dev == dev) {
            log_amg_warn!(
                root = %root.display(),
                other = %other.root.display(),
                dev = %format!("{:x}", dev),
                "Extra work dir shares a filesystem with another root, ignored"
            );
            continue;
        }
        dirs.push(ExtraWorkDir {
            root: root.clone(),
            dev,
        });
    }

    for dir in &dirs {
        let name = format!("{:x}", dir.dev);
        for sub in link_subdirs() {
            ensure_link(&primary.join(&sub).join(&name), &dir.root.join(&sub))?;
        }
    }

    let known: Vec<u64> = dirs.iter().map(|d| d.dev).collect();
    let removed = delete_stale_extra_work_dir_links(primary, &known)?;
    if removed > 0 {
        log_amg_info!(removed, "Removed stale extra work dir links");
    }
    Ok(dirs)
}

fn ensure_link(link: &Path, target: &Path) -> io::Result<()> {
    match std::fs::symlink_metadata(link) {
        Ok(meta) if meta.file_type().is_symlink() => {
            let current = std::fs::canonicalize(link).ok();
            let expected = std::fs::canonicalize(target).ok();
            if current.is_some() && current == expected {
                return Ok(());
            }
            debug!(link = %link.display(), target = %target.display(), "Replacing work dir link");
            std::fs::remove_file(link)?;
        }
        Ok(_) => {
            log_amg_warn!(link = %link.display(), "Not a symbolic link, leaving it alone");
            return Ok(());
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    std::os::unix::fs::symlink(target, link)
}

/// Remove links whose hex name is not one of `known` from the link
/// directories of `primary`. Anything that is not a symlink stays.
pub fn delete_stale_extra_work_dir_links(primary: &Path, known: &[u64]) -> io::Result<usize> {
    let known: HashSet<u64> = known.iter().copied().collect();
    let mut removed = 0;
    for sub in link_subdirs() {
        let dir = primary.join(sub);
        let entries = match std::fs::read_dir(&dir) {
            Ok(e) => e,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_symlink() {
                continue;
            }
            let name = entry.file_name();
            let wanted = name
                .to_str()
                .and_then(|n| u64::from_str_radix(n, 16).ok())
                .is_some_and(|dev| known.contains(&dev));
            if !wanted {
                std::fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fake_devices(primary: PathBuf) -> impl Fn(&Path) -> io::Result<u64> {
        move |p: &Path| Ok(if p == primary { 100 } else { 200 })
    }

    #[test]
    fn test_two_filesystems() {
        let temp = tempdir().unwrap();
        let primary = temp.path().join("afd");
        let extra = temp.path().join("big");
        let roots = vec![primary.clone(), extra.clone()];

        // Leftovers from an earlier configuration.
        create_dir_mode(&primary.join("files/outgoing"), DIR_MODE).unwrap();
        std::os::unix::fs::symlink(&extra, primary.join("files/outgoing/1f")).unwrap();
        std::fs::write(primary.join("files/outgoing/readme"), b"x").unwrap();

        let dirs = setup_with(&roots, fake_devices(primary.clone())).unwrap();
        assert_eq!(dirs.len(), 2);

        let out = primary.join("files/outgoing");
        assert_eq!(
            std::fs::canonicalize(out.join("64")).unwrap(),
            std::fs::canonicalize(primary.join("files/outgoing")).unwrap()
        );
        assert_eq!(
            std::fs::canonicalize(out.join("c8")).unwrap(),
            std::fs::canonicalize(extra.join("files/outgoing")).unwrap()
        );
        assert!(std::fs::symlink_metadata(out.join("1f")).is_err());
        assert!(out.join("readme").is_file());
        assert!(extra.join("archive").is_dir());
        assert!(primary.join("archive/c8").exists());
        assert!(primary.join("files/time/c8").exists());
        assert!(primary.join("files/pool/64").exists());
    }

    #[test]
    fn test_wrong_link_target_is_replaced() {
        let temp = tempdir().unwrap();
        let primary = temp.path().join("afd");
        let extra = temp.path().join("big");
        create_dir_mode(&primary.join("files/pool"), DIR_MODE).unwrap();
        std::os::unix::fs::symlink(temp.path(), primary.join("files/pool/c8")).unwrap();

        setup_with(&[primary.clone(), extra.clone()], fake_devices(primary.clone())).unwrap();
        assert_eq!(
            std::fs::canonicalize(primary.join("files/pool/c8")).unwrap(),
            std::fs::canonicalize(extra.join("files/pool")).unwrap()
        );
    }

    #[test]
    fn test_resolve_roots() {
        let work = WorkDir::new("/srv/afd");
        let roots = resolve_roots(
            &work,
            &[
                "/data2".to_string(),
                "spool3".to_string(),
                "/data2".to_string(),
                "~no_such_user_here/x".to_string(),
            ],
        );
        assert_eq!(
            roots,
            vec![
                PathBuf::from("/srv/afd"),
                PathBuf::from("/data2"),
                PathBuf::from("/srv/afd/files/spool3"),
            ]
        );
    }

    #[test]
    fn test_real_devices_single_root() {
        let temp = tempdir().unwrap();
        let work = WorkDir::new(temp.path().join("afd"));
        let dirs = setup(&work, &[]).unwrap();
        assert_eq!(dirs.len(), 1);
        let link = work.outgoing_dir().join(format!("{:x}", dirs[0].dev));
        assert!(std::fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
    }
}
