//! # afd-config
//!
//! Configuration for the AFD message generator.
//!
//! `etc/AFD_CONFIG` is a line based file of `KEY value` pairs (`KEY=value`
//! is accepted too, `#` starts a comment). Keys belonging to other AFD
//! processes are ignored here. Every value AMG cares about is range checked:
//! anything unparsable or out of range is reported with a WARN and replaced
//! by its default, so a bad line never stops the supervisor.

pub mod logging;
pub mod path;
pub mod testing;

use serde::Serialize;
use std::fmt::Display;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, warn};

pub use path::WorkDir;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{} is not set and no work directory was given", path::WORK_DIR_ENV)]
    NoWorkDir,
}

// Defaults
pub const DEFAULT_RESCAN_TIME: u32 = 5;
pub const MAX_RESCAN_TIME: u32 = 3600;
pub const DEFAULT_MAX_NO_OF_DIR_CHECKS: u32 = 10;
pub const MAX_NO_OF_DIR_CHECKS_LIMIT: u32 = 10240;
pub const DEFAULT_MAX_PROCESS_PER_DIR: u32 = 10;
pub const DEFAULT_CREATE_SOURCE_DIR_MODE: u32 = 0o755;
pub const DEFAULT_MAX_COPIED_FILE_SIZE_KB: u64 = 102_400;
pub const DEFAULT_MAX_COPIED_FILES: u32 = 100;
pub const DEFAULT_OLD_FILE_TIME_HOURS: u32 = 24;
pub const DEFAULT_NO_PARALLEL_JOBS: i32 = 3;
pub const MAX_NO_PARALLEL_JOBS: i32 = 9;
pub const DEFAULT_MAX_ERRORS: i32 = 10;
pub const DEFAULT_RETRY_INTERVAL: i32 = 120;
pub const DEFAULT_TRANSFER_BLOCKSIZE: i32 = 4096;
pub const MIN_TRANSFER_BLOCKSIZE: i32 = 256;
pub const MAX_TRANSFER_BLOCKSIZE: i32 = 1_048_576;
pub const DEFAULT_SUCCESSFUL_RETRIES: i32 = 10;
pub const DEFAULT_TRANSFER_TIMEOUT: i32 = 120;
pub const DEFAULT_MAX_SHUTDOWN_TIME: u32 = 60;
pub const MIN_SHUTDOWN_TIME: u32 = 10;
pub const MAX_SHUTDOWN_TIME: u32 = 3600;

// Delete-files flag bits
pub const UNKNOWN_FILES: u32 = 0x01;
pub const QUEUED_FILES: u32 = 0x02;
pub const OLD_LOCKED_FILES: u32 = 0x04;
pub const OLD_RLOCKED_FILES: u32 = 0x08;
pub const OLD_ILOCKED_FILES: u32 = 0x10;

/// Defaults applied to HOST_CONFIG fields that are missing or out of range,
/// and to hosts that only appear in DIR_CONFIG.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HostDefaults {
    pub allowed_transfers: i32,
    pub max_errors: i32,
    pub retry_interval: i32,
    pub transfer_blocksize: i32,
    pub successful_retries: i32,
    pub transfer_timeout: i32,
    pub error_offline: bool,
}

impl Default for HostDefaults {
    fn default() -> Self {
        Self {
            allowed_transfers: DEFAULT_NO_PARALLEL_JOBS,
            max_errors: DEFAULT_MAX_ERRORS,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            transfer_blocksize: DEFAULT_TRANSFER_BLOCKSIZE,
            successful_retries: DEFAULT_SUCCESSFUL_RETRIES,
            transfer_timeout: DEFAULT_TRANSFER_TIMEOUT,
            error_offline: false,
        }
    }
}

/// Effective AMG configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AmgConfig {
    pub amg_priority: Option<i32>,
    /// Seconds between main-loop timeouts.
    pub rescan_time: u32,
    pub max_no_of_dir_checks: u32,
    pub max_process_per_dir: u32,
    pub default_inotify_flag: u32,
    pub ignore_first_errors: u8,
    pub create_source_dir: bool,
    pub create_source_dir_mode: u32,
    pub remove_unused_hosts: bool,
    /// KiB
    pub max_copied_file_size: u64,
    pub max_copied_files: u32,
    /// Hours
    pub default_old_file_time: u32,
    pub additional_locked_files: Vec<String>,
    pub default_dir_info_time: i64,
    pub default_dir_warn_time: i64,
    pub default_delete_files_flag: u32,
    pub host_defaults: HostDefaults,
    pub dir_config_names: Vec<String>,
    /// Units of 100 ms.
    pub max_shutdown_time: u32,
    pub extra_work_dirs: Vec<String>,
    /// Number of WARNs emitted while parsing.
    #[serde(skip)]
    pub warnings: u32,
}

impl Default for AmgConfig {
    fn default() -> Self {
        Self {
            amg_priority: None,
            rescan_time: DEFAULT_RESCAN_TIME,
            max_no_of_dir_checks: DEFAULT_MAX_NO_OF_DIR_CHECKS,
            max_process_per_dir: DEFAULT_MAX_PROCESS_PER_DIR,
            default_inotify_flag: 0,
            ignore_first_errors: 0,
            create_source_dir: true,
            create_source_dir_mode: DEFAULT_CREATE_SOURCE_DIR_MODE,
            remove_unused_hosts: false,
            max_copied_file_size: DEFAULT_MAX_COPIED_FILE_SIZE_KB,
            max_copied_files: DEFAULT_MAX_COPIED_FILES,
            default_old_file_time: DEFAULT_OLD_FILE_TIME_HOURS,
            additional_locked_files: Vec::new(),
            default_dir_info_time: 0,
            default_dir_warn_time: 0,
            default_delete_files_flag: 0,
            host_defaults: HostDefaults::default(),
            dir_config_names: vec![path::DEFAULT_DIR_CONFIG_FILE.to_string()],
            max_shutdown_time: DEFAULT_MAX_SHUTDOWN_TIME,
            extra_work_dirs: Vec::new(),
            warnings: 0,
        }
    }
}

impl AmgConfig {
    /// Load `etc/AFD_CONFIG`; a missing file yields the defaults.
    pub fn load(work: &WorkDir) -> Result<Self, ConfigError> {
        Self::load_from(&work.afd_config())
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(text) => {
                debug!(path = %path.display(), "Loading AFD_CONFIG");
                Ok(Self::parse(&text))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No AFD_CONFIG, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Parse AFD_CONFIG text. Never fails; problems become WARNs.
    pub fn parse(text: &str) -> Self {
        let mut cfg = Self::default();
        let mut dir_configs = Vec::new();

        for raw in text.lines() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = split_key_value(line);
            let w = &mut cfg.warnings;
            match key {
                "AMG_PRIORITY" => cfg.amg_priority = Some(ranged(key, value, -20, 19, 0, w)),
                "AMG_DIR_RESCAN_TIME" => {
                    cfg.rescan_time = ranged(key, value, 1, MAX_RESCAN_TIME, DEFAULT_RESCAN_TIME, w)
                }
                "MAX_NO_OF_DIR_CHECKS" => {
                    cfg.max_no_of_dir_checks = ranged(
                        key,
                        value,
                        1,
                        MAX_NO_OF_DIR_CHECKS_LIMIT,
                        DEFAULT_MAX_NO_OF_DIR_CHECKS,
                        w,
                    )
                }
                "MAX_PROCESS_PER_DIR" => {
                    // Upper bound is checked once MAX_NO_OF_DIR_CHECKS is known.
                    cfg.max_process_per_dir = ranged(
                        key,
                        value,
                        1,
                        MAX_NO_OF_DIR_CHECKS_LIMIT,
                        DEFAULT_MAX_PROCESS_PER_DIR,
                        w,
                    )
                }
                "DEFAULT_INOTIFY_FLAG" => cfg.default_inotify_flag = ranged(key, value, 0, 15, 0, w),
                "IGNORE_FIRST_ERRORS" => cfg.ignore_first_errors = ranged(key, value, 0, 255, 0, w),
                "CREATE_SOURCE_DIR" => cfg.create_source_dir = yes_no(key, value, true, w),
                "CREATE_SOURCE_DIR_MODE" => cfg.create_source_dir_mode = octal_mode(key, value, w),
                "REMOVE_UNUSED_HOSTS" => cfg.remove_unused_hosts = yes_no(key, value, false, w),
                "MAX_COPIED_FILE_SIZE" => {
                    cfg.max_copied_file_size =
                        ranged(key, value, 1, u64::MAX / 1024, DEFAULT_MAX_COPIED_FILE_SIZE_KB, w)
                }
                "MAX_COPIED_FILES" => {
                    cfg.max_copied_files = ranged(key, value, 1, u32::MAX, DEFAULT_MAX_COPIED_FILES, w)
                }
                "DEFAULT_OLD_FILE_TIME" => {
                    cfg.default_old_file_time =
                        ranged(key, value, 1, u32::MAX, DEFAULT_OLD_FILE_TIME_HOURS, w)
                }
                "ADDITIONAL_LOCKED_FILES" => {
                    cfg.additional_locked_files = value
                        .split('|')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect()
                }
                "DEFAULT_DIR_INFO_TIME" => {
                    cfg.default_dir_info_time = ranged(key, value, 0, i64::MAX, 0, w)
                }
                "DEFAULT_DIR_WARN_TIME" => {
                    cfg.default_dir_warn_time = ranged(key, value, 0, i64::MAX, 0, w)
                }
                "DEFAULT_DELETE_FILES_FLAG" => {
                    cfg.default_delete_files_flag = delete_files_flag(value)
                }
                "DEFAULT_NO_PARALLEL_JOBS" => {
                    cfg.host_defaults.allowed_transfers =
                        ranged(key, value, 1, MAX_NO_PARALLEL_JOBS, DEFAULT_NO_PARALLEL_JOBS, w)
                }
                "DEFAULT_MAX_ERRORS" => {
                    cfg.host_defaults.max_errors =
                        ranged(key, value, 1, 65535, DEFAULT_MAX_ERRORS, w)
                }
                "DEFAULT_RETRY_INTERVAL" => {
                    cfg.host_defaults.retry_interval =
                        ranged(key, value, 1, 86400, DEFAULT_RETRY_INTERVAL, w)
                }
                "DEFAULT_TRANSFER_BLOCKSIZE" => {
                    cfg.host_defaults.transfer_blocksize = ranged(
                        key,
                        value,
                        MIN_TRANSFER_BLOCKSIZE,
                        MAX_TRANSFER_BLOCKSIZE,
                        DEFAULT_TRANSFER_BLOCKSIZE,
                        w,
                    )
                }
                "DEFAULT_SUCCESSFUL_RETRIES" => {
                    cfg.host_defaults.successful_retries =
                        ranged(key, value, 1, 65535, DEFAULT_SUCCESSFUL_RETRIES, w)
                }
                "DEFAULT_TRANSFER_TIMEOUT" => {
                    cfg.host_defaults.transfer_timeout =
                        ranged(key, value, 1, 86400, DEFAULT_TRANSFER_TIMEOUT, w)
                }
                "DEFAULT_ERROR_OFFLINE" => {
                    cfg.host_defaults.error_offline = yes_no(key, value, false, w)
                }
                "DIR_CONFIG_NAME" => {
                    if value.is_empty() {
                        warn!(key, "Empty value, ignored");
                        *w += 1;
                    } else {
                        dir_configs.push(value.to_string());
                    }
                }
                "MAX_SHUTDOWN_TIME" => {
                    cfg.max_shutdown_time = ranged(
                        key,
                        value,
                        MIN_SHUTDOWN_TIME,
                        MAX_SHUTDOWN_TIME,
                        DEFAULT_MAX_SHUTDOWN_TIME,
                        w,
                    )
                }
                "EXTRA_WORK_DIR" | "extra_work_dir" => {
                    if !value.is_empty() {
                        cfg.extra_work_dirs.push(value.to_string());
                    }
                }
                _ => {}
            }
        }

        if !dir_configs.is_empty() {
            cfg.dir_config_names = dir_configs;
        }
        if cfg.max_process_per_dir > cfg.max_no_of_dir_checks {
            warn!(
                max_process_per_dir = cfg.max_process_per_dir,
                max_no_of_dir_checks = cfg.max_no_of_dir_checks,
                "MAX_PROCESS_PER_DIR larger than MAX_NO_OF_DIR_CHECKS, using the latter"
            );
            cfg.warnings += 1;
            cfg.max_process_per_dir = cfg.max_no_of_dir_checks;
        }
        cfg
    }

    /// Largest file dir_check may copy, in bytes.
    pub fn max_copied_file_size_bytes(&self) -> u64 {
        self.max_copied_file_size.saturating_mul(1024)
    }

    pub fn scan_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(u64::from(self.rescan_time))
    }
}

fn split_key_value(line: &str) -> (&str, &str) {
    let end = line
        .find(|c: char| c.is_whitespace() || c == '=')
        .unwrap_or(line.len());
    let key = &line[..end];
    let rest = line[end..].trim_start();
    let rest = rest.strip_prefix('=').unwrap_or(rest);
    (key, rest.trim())
}

fn ranged<T>(key: &str, value: &str, min: T, max: T, default: T, warnings: &mut u32) -> T
where
    T: FromStr + PartialOrd + Display + Copy,
{
    match value.parse::<T>() {
        Ok(v) if v >= min && v <= max => v,
        Ok(v) => {
            warn!(key, value = %v, %min, %max, %default, "Value out of range, using default");
            *warnings += 1;
            default
        }
        Err(_) => {
            warn!(key, value, %default, "Unable to parse value, using default");
            *warnings += 1;
            default
        }
    }
}

fn yes_no(key: &str, value: &str, default: bool, warnings: &mut u32) -> bool {
    if value.eq_ignore_ascii_case("yes") {
        true
    } else if value.eq_ignore_ascii_case("no") {
        false
    } else {
        warn!(key, value, default, "Expected YES or NO, using default");
        *warnings += 1;
        default
    }
}

fn octal_mode(key: &str, value: &str, warnings: &mut u32) -> u32 {
    let valid = (3..=4).contains(&value.len()) && value.bytes().all(|b| (b'0'..=b'7').contains(&b));
    match valid.then(|| u32::from_str_radix(value, 8)) {
        Some(Ok(mode)) => mode,
        _ => {
            warn!(
                key,
                value,
                default = %format!("{:o}", DEFAULT_CREATE_SOURCE_DIR_MODE),
                "Expected 3 or 4 octal digits, using default"
            );
            *warnings += 1;
            DEFAULT_CREATE_SOURCE_DIR_MODE
        }
    }
}

fn delete_files_flag(value: &str) -> u32 {
    value
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|t| !t.is_empty())
        .fold(0, |flag, token| match token {
            "UNKNOWN" => flag | UNKNOWN_FILES,
            "QUEUED" => flag | QUEUED_FILES,
            "LOCKED" => flag | OLD_LOCKED_FILES,
            "RLOCKED" => flag | OLD_RLOCKED_FILES,
            "ILOCKED" => flag | OLD_ILOCKED_FILES,
            other => {
                debug!(token = other, "Unknown DEFAULT_DELETE_FILES_FLAG token ignored");
                flag
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AmgConfig::default();
        assert_eq!(config.rescan_time, 5);
        assert_eq!(config.dir_config_names, vec!["DIR_CONFIG"]);
        assert_eq!(config.host_defaults.transfer_blocksize, 4096);
        assert!(config.create_source_dir);
    }

    #[test]
    fn test_key_value_forms() {
        assert_eq!(split_key_value("AMG_DIR_RESCAN_TIME 10"), ("AMG_DIR_RESCAN_TIME", "10"));
        assert_eq!(split_key_value("AMG_DIR_RESCAN_TIME=10"), ("AMG_DIR_RESCAN_TIME", "10"));
        assert_eq!(split_key_value("AMG_DIR_RESCAN_TIME = 10"), ("AMG_DIR_RESCAN_TIME", "10"));
        assert_eq!(split_key_value("REMOVE_UNUSED_HOSTS"), ("REMOVE_UNUSED_HOSTS", ""));
    }

    #[test]
    fn test_out_of_range_falls_back() {
        let cfg = AmgConfig::parse("AMG_DIR_RESCAN_TIME 0\nDEFAULT_TRANSFER_BLOCKSIZE 17\n");
        assert_eq!(cfg.rescan_time, DEFAULT_RESCAN_TIME);
        assert_eq!(cfg.host_defaults.transfer_blocksize, DEFAULT_TRANSFER_BLOCKSIZE);
        assert_eq!(cfg.warnings, 2);
    }

    #[test]
    fn test_octal_mode() {
        let mut w = 0;
        assert_eq!(octal_mode("M", "750", &mut w), 0o750);
        assert_eq!(octal_mode("M", "2775", &mut w), 0o2775);
        assert_eq!(w, 0);
        assert_eq!(octal_mode("M", "789", &mut w), DEFAULT_CREATE_SOURCE_DIR_MODE);
        assert_eq!(octal_mode("M", "75", &mut w), DEFAULT_CREATE_SOURCE_DIR_MODE);
        assert_eq!(w, 2);
    }

    #[test]
    fn test_delete_files_tokens() {
        assert_eq!(
            delete_files_flag("UNKNOWN, QUEUED ILOCKED BOGUS"),
            UNKNOWN_FILES | QUEUED_FILES | OLD_ILOCKED_FILES
        );
    }

    #[test]
    fn test_process_per_dir_bounded() {
        let cfg = AmgConfig::parse("MAX_NO_OF_DIR_CHECKS 4\nMAX_PROCESS_PER_DIR 8\n");
        assert_eq!(cfg.max_process_per_dir, 4);
        assert_eq!(cfg.warnings, 1);
    }
}
