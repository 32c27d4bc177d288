//! Integration tests for afd-config
//!
//! These tests verify AFD_CONFIG loading with real file system operations.

use afd_config::testing::TestEnvironment;
use afd_config::{AmgConfig, WorkDir, OLD_LOCKED_FILES, QUEUED_FILES};

/// A realistic AFD_CONFIG with keys for other processes mixed in
#[test]
fn test_load_full_afd_config() {
    let env = TestEnvironment::new().unwrap();
    env.write_afd_config(
        r#"
# AMG section
AMG_DIR_RESCAN_TIME       10
MAX_NO_OF_DIR_CHECKS      20
MAX_PROCESS_PER_DIR       5
IGNORE_FIRST_ERRORS       3
CREATE_SOURCE_DIR         NO
CREATE_SOURCE_DIR_MODE    750
REMOVE_UNUSED_HOSTS       YES
MAX_COPIED_FILE_SIZE      2048
ADDITIONAL_LOCKED_FILES   *.tmp|.*
DEFAULT_DELETE_FILES_FLAG QUEUED,LOCKED
DEFAULT_NO_PARALLEL_JOBS  5
DEFAULT_ERROR_OFFLINE     YES
DIR_CONFIG_NAME           DIR_CONFIG.ftp
DIR_CONFIG_NAME=/srv/afd/DIR_CONFIG.*
EXTRA_WORK_DIR            /data2/afd
MAX_SHUTDOWN_TIME         120

# FD keys are not ours
MAX_CONNECTIONS           50
"#,
    )
    .unwrap();

    let cfg = AmgConfig::load(&env.work).unwrap();
    assert_eq!(cfg.rescan_time, 10);
    assert_eq!(cfg.max_no_of_dir_checks, 20);
    assert_eq!(cfg.max_process_per_dir, 5);
    assert_eq!(cfg.ignore_first_errors, 3);
    assert!(!cfg.create_source_dir);
    assert_eq!(cfg.create_source_dir_mode, 0o750);
    assert!(cfg.remove_unused_hosts);
    assert_eq!(cfg.max_copied_file_size_bytes(), 2048 * 1024);
    assert_eq!(cfg.additional_locked_files, vec!["*.tmp", ".*"]);
    assert_eq!(cfg.default_delete_files_flag, QUEUED_FILES | OLD_LOCKED_FILES);
    assert_eq!(cfg.host_defaults.allowed_transfers, 5);
    assert!(cfg.host_defaults.error_offline);
    assert_eq!(
        cfg.dir_config_names,
        vec!["DIR_CONFIG.ftp", "/srv/afd/DIR_CONFIG.*"]
    );
    assert_eq!(cfg.extra_work_dirs, vec!["/data2/afd"]);
    assert_eq!(cfg.max_shutdown_time, 120);
    assert_eq!(cfg.warnings, 0);
}

/// Bad values never abort loading
#[test]
fn test_invalid_values_use_defaults() {
    let env = TestEnvironment::new().unwrap();
    env.write_afd_config(
        "DEFAULT_NO_PARALLEL_JOBS 42\nMAX_SHUTDOWN_TIME 2\nCREATE_SOURCE_DIR maybe\nDEFAULT_RETRY_INTERVAL abc\n",
    )
    .unwrap();

    let cfg = AmgConfig::load(&env.work).unwrap();
    let defaults = AmgConfig::default();
    assert_eq!(cfg.host_defaults, defaults.host_defaults);
    assert_eq!(cfg.max_shutdown_time, defaults.max_shutdown_time);
    assert!(cfg.create_source_dir);
    assert_eq!(cfg.warnings, 4);
}

#[test]
fn test_missing_file_yields_defaults() {
    let env = TestEnvironment::new().unwrap();
    let cfg = AmgConfig::load(&env.work).unwrap();
    assert_eq!(cfg, AmgConfig::default());
}

#[test]
fn test_config_serializes_to_json() {
    let cfg = AmgConfig::parse("AMG_DIR_RESCAN_TIME 7\n");
    let json = serde_json::to_value(&cfg).unwrap();
    assert_eq!(json["rescan_time"], 7);
    assert_eq!(json["host_defaults"]["retry_interval"], 120);
    assert!(json.get("warnings").is_none());
}

#[test]
fn test_work_dir_relative_dir_config() {
    let work = WorkDir::new("/afd");
    let cfg = AmgConfig::default();
    assert_eq!(
        work.resolve_etc(&cfg.dir_config_names[0]),
        std::path::PathBuf::from("/afd/etc/DIR_CONFIG")
    );
}
