//! DIR_CONFIG files: which ones exist, whether they changed, and what
//! hosts they send to.

use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use afd_config::{log_amg_warn, HostDefaults, WorkDir};
use afd_ipc::{protocol_from_scheme, MAX_HOSTNAME_LENGTH};
use tracing::debug;

use crate::host_list::HostEntry;
use crate::pmatch::{pmatch_with, Expansion};

/// Anything smaller cannot hold a single directory entry.
pub const MIN_DIR_CONFIG_SIZE: u64 = 12;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirConfigFile {
    pub path: PathBuf,
    pub mtime: SystemTime,
    pub size: u64,
}

/// The DIR_CONFIG files currently on disk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirConfigSet {
    pub files: Vec<DirConfigFile>,
    /// Some configured name is a glob, so files may appear later.
    pub has_globs: bool,
}

fn is_glob(name: &str) -> bool {
    name.contains(['*', '?', '['])
}

fn stat(path: &Path) -> io::Result<Option<DirConfigFile>> {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_file() => Ok(Some(DirConfigFile {
            path: path.to_path_buf(),
            mtime: meta.modified()?,
            size: meta.len(),
        })),
        Ok(_) => Ok(None),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

impl DirConfigSet {
    /// Resolve every configured name. Relative names live in `etc/`; a
    /// glob may only appear in the last path component.
    pub fn enumerate(work: &WorkDir, names: &[String]) -> io::Result<Self> {
        let mut set = DirConfigSet::default();
        let exp = Expansion::current();
        for name in names {
            let path = work.resolve_etc(name);
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            if !is_glob(&file_name) {
                match stat(&path)? {
                    Some(f) => set.push(f),
                    None => log_amg_warn!(path = %path.display(), "DIR_CONFIG file missing"),
                }
                continue;
            }

            set.has_globs = true;
            let dir = path.parent().unwrap_or_else(|| Path::new("."));
            let mut matched: Vec<PathBuf> = match std::fs::read_dir(dir) {
                Ok(entries) => entries
                    .filter_map(Result::ok)
                    .filter(|e| {
                        pmatch_with(&file_name, &e.file_name().to_string_lossy(), &exp).is_match()
                    })
                    .map(|e| e.path())
                    .collect(),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
                Err(e) => return Err(e),
            };
            matched.sort();
            for p in matched {
                if let Some(f) = stat(&p)? {
                    set.push(f);
                }
            }
        }
        Ok(set)
    }

    fn push(&mut self, file: DirConfigFile) {
        if !self.files.iter().any(|f| f.path == file.path) {
            self.files.push(file);
        }
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.files.iter().map(|f| f.path.clone()).collect()
    }

    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Files added, removed or modified relative to `old`.
    pub fn changed_since(&self, old: &DirConfigSet) -> bool {
        self.files != old.files
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// A host alias referenced by some recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostRef {
    pub alias: String,
    pub protocol: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirConfigEval {
    pub directories: usize,
    pub jobs: usize,
    /// In order of first reference.
    pub hosts: Vec<HostRef>,
    pub warnings: u32,
}

impl DirConfigEval {
    /// Whether there is anything for dir_check to do.
    pub fn has_data(&self) -> bool {
        self.directories > 0 && self.jobs > 0
    }

    fn add_host(&mut self, alias: &str, protocol: u32) {
        match self.hosts.iter_mut().find(|h| h.alias == alias) {
            Some(h) => h.protocol |= protocol,
            None => self.hosts.push(HostRef {
                alias: alias.to_string(),
                protocol,
            }),
        }
    }
}

/// Turns DIR_CONFIG files into the summary AMG needs.
pub trait DirConfigEvaluator {
    fn evaluate(&self, files: &[PathBuf]) -> io::Result<DirConfigEval>;
}

/// Evaluator for the plain text format:
///
/// ```text
/// [directory] /data/in
///    [files]
///    *.dat
///       [destination]
///          [recipient]
///          ftp://user:pw@host1/outgoing
///          [options]
///          archive 2
/// ```
#[derive(Debug, Default, Clone, Copy)]
pub struct TextDirConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    None,
    Files,
    Destination,
    Recipient,
    Options,
}

/// Split a recipient URL into scheme and host alias.
pub fn recipient_host(url: &str) -> Option<(&str, &str)> {
    let (scheme, rest) = url.split_once("://")?;
    let authority = rest.split('/').next().unwrap_or("");
    let host_part = match authority.rfind('@') {
        Some(at) => &authority[at + 1..],
        None => authority,
    };
    let host = host_part
        .split([':', ';'])
        .next()
        .unwrap_or("")
        .trim();
    if scheme.is_empty() || host.is_empty() {
        return None;
    }
    Some((scheme, host))
}

impl TextDirConfig {
    fn evaluate_text(&self, source: &Path, text: &str, eval: &mut DirConfigEval) {
        let mut section = Section::None;
        let mut in_directory = false;
        let mut dir_jobs = 0usize;
        let mut dir_line = 0usize;

        let close_directory = |eval: &mut DirConfigEval, jobs: usize, line: usize| {
            eval.directories += 1;
            if jobs == 0 {
                log_amg_warn!(file = %source.display(), line, "Directory without any recipient");
                eval.warnings += 1;
            }
        };

        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let lower = line.to_ascii_lowercase();
            if let Some(rest) = lower
                .strip_prefix("[directory]")
                .or_else(|| lower.strip_prefix("[dir]"))
            {
                if in_directory {
                    close_directory(eval, dir_jobs, dir_line);
                }
                if rest.trim().is_empty() {
                    log_amg_warn!(file = %source.display(), line = idx + 1, "Directory entry without a path");
                    eval.warnings += 1;
                    in_directory = false;
                } else {
                    in_directory = true;
                }
                dir_jobs = 0;
                dir_line = idx + 1;
                section = Section::None;
                continue;
            }
            section = match lower.as_str() {
                "[files]" => Section::Files,
                "[destination]" => Section::Destination,
                "[recipient]" => Section::Recipient,
                "[options]" => Section::Options,
                _ => {
                    if section == Section::Recipient && in_directory {
                        match recipient_host(line) {
                            Some((scheme, host)) => match protocol_from_scheme(scheme) {
                                Some(_) if host.len() > MAX_HOSTNAME_LENGTH => {
                                    log_amg_warn!(file = %source.display(), line = idx + 1, host, "Host alias too long");
                                    eval.warnings += 1;
                                }
                                Some(protocol) => {
                                    eval.add_host(host, protocol);
                                    eval.jobs += 1;
                                    dir_jobs += 1;
                                }
                                None => {
                                    log_amg_warn!(file = %source.display(), line = idx + 1, scheme, "Unknown scheme");
                                    eval.warnings += 1;
                                }
                            },
                            None => {
                                log_amg_warn!(file = %source.display(), line = idx + 1, "Cannot parse recipient");
                                eval.warnings += 1;
                            }
                        }
                    }
                    section
                }
            };
        }
        if in_directory {
            close_directory(eval, dir_jobs, dir_line);
        }
    }
}

impl DirConfigEvaluator for TextDirConfig {
    fn evaluate(&self, files: &[PathBuf]) -> io::Result<DirConfigEval> {
        let mut eval = DirConfigEval::default();
        for file in files {
            let text = std::fs::read_to_string(file)?;
            self.evaluate_text(file, &text, &mut eval);
        }
        debug!(
            directories = eval.directories,
            jobs = eval.jobs,
            hosts = eval.hosts.len(),
            "Evaluated DIR_CONFIG"
        );
        Ok(eval)
    }
}

/// Reconcile the host list with what DIR_CONFIG references.
///
/// Referenced hosts get their protocols; missing ones are appended with
/// `defaults`. Unreferenced hosts are dropped when `remove_unused` is set
/// and otherwise flagged; group headings are left alone.
pub fn apply_to_host_list(
    entries: &mut Vec<HostEntry>,
    eval: &DirConfigEval,
    defaults: &HostDefaults,
    remove_unused: bool,
) -> usize {
    let mut added = 0;
    for entry in entries.iter_mut().filter(|e| !e.group) {
        match eval.hosts.iter().find(|h| h.alias == entry.alias) {
            Some(h) => {
                entry.protocol = h.protocol;
                entry.in_dir_config = true;
            }
            None => {
                entry.protocol = 0;
                entry.in_dir_config = false;
            }
        }
    }
    if remove_unused {
        entries.retain(|e| e.group || e.in_dir_config);
    }
    for host in &eval.hosts {
        if !entries.iter().any(|e| e.alias == host.alias) {
            let mut entry = HostEntry::new(&host.alias, defaults);
            entry.protocol = host.protocol;
            entries.push(entry);
            added += 1;
        }
    }
    added
}

#[cfg(test)]
mod tests {
    use super::*;
    use afd_config::testing::TestEnvironment;
    use afd_ipc::{FTP_FLAG, LOC_FLAG, SFTP_FLAG};

    const SAMPLE: &str = "\
# incoming radar data
[directory] /data/radar
   [files]
   *.dat
      [destination]
         [recipient]
         ftp://user:p@ss@h1:2121/out
         sftp://user@h2/in;server=alt
         [options]
         archive 2

[dir] /data/empty
   [files]
   *

[directory] /data/local
      [destination]
         [recipient]
         file://afd@h1/srv/copy
         gopher://x/y
";

    #[test]
    fn test_recipient_host() {
        assert_eq!(recipient_host("ftp://u:p@h1:21/x"), Some(("ftp", "h1")));
        assert_eq!(recipient_host("sftp://h2/x"), Some(("sftp", "h2")));
        assert_eq!(recipient_host("ftp://u:p@w@h3/x"), Some(("ftp", "h3")));
        assert_eq!(recipient_host("nonsense"), None);
    }

    #[test]
    fn test_evaluate_sample() {
        let env = TestEnvironment::new().unwrap();
        let path = env.write_dir_config(SAMPLE).unwrap();
        let eval = TextDirConfig.evaluate(&[path]).unwrap();
        assert_eq!(eval.directories, 3);
        assert_eq!(eval.jobs, 3);
        assert_eq!(
            eval.hosts,
            vec![
                HostRef { alias: "h1".into(), protocol: FTP_FLAG | LOC_FLAG },
                HostRef { alias: "h2".into(), protocol: SFTP_FLAG },
            ]
        );
        // empty directory, unknown scheme
        assert_eq!(eval.warnings, 2);
        assert!(eval.has_data());
    }

    #[test]
    fn test_enumerate_with_globs() {
        let env = TestEnvironment::new().unwrap();
        env.write_etc("DIR_CONFIG.b", SAMPLE).unwrap();
        env.write_etc("DIR_CONFIG.a", SAMPLE).unwrap();
        env.write_etc("other", "x").unwrap();
        let names = vec!["DIR_CONFIG.*".to_string(), "missing".to_string()];
        let set = DirConfigSet::enumerate(&env.work, &names).unwrap();
        assert!(set.has_globs);
        let names: Vec<String> = set
            .files
            .iter()
            .map(|f| f.path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["DIR_CONFIG.a", "DIR_CONFIG.b"]);
        assert_eq!(set.total_size(), 2 * SAMPLE.len() as u64);

        let same = DirConfigSet::enumerate(&env.work, &["DIR_CONFIG.*".to_string()]).unwrap();
        assert!(!same.changed_since(&set));
        env.write_etc("DIR_CONFIG.c", SAMPLE).unwrap();
        let grown = DirConfigSet::enumerate(&env.work, &["DIR_CONFIG.*".to_string()]).unwrap();
        assert!(grown.changed_since(&set));
    }

    #[test]
    fn test_apply_to_host_list() {
        let d = HostDefaults::default();
        let mut list = vec![
            HostEntry::group("grp", &d),
            HostEntry::new("h1", &d),
            HostEntry::new("old", &d),
        ];
        let eval = DirConfigEval {
            directories: 1,
            jobs: 2,
            hosts: vec![
                HostRef { alias: "h1".into(), protocol: FTP_FLAG },
                HostRef { alias: "new".into(), protocol: SFTP_FLAG },
            ],
            warnings: 0,
        };

        let mut kept = list.clone();
        assert_eq!(apply_to_host_list(&mut kept, &eval, &d, false), 1);
        let aliases: Vec<&str> = kept.iter().map(|e| e.alias.as_str()).collect();
        assert_eq!(aliases, vec!["grp", "h1", "old", "new"]);
        assert!(!kept[2].in_dir_config);
        assert_eq!(kept[1].protocol, FTP_FLAG);
        assert_eq!(kept[3].protocol, SFTP_FLAG);

        apply_to_host_list(&mut list, &eval, &d, true);
        let aliases: Vec<&str> = list.iter().map(|e| e.alias.as_str()).collect();
        assert_eq!(aliases, vec!["grp", "h1", "new"]);
    }
}
