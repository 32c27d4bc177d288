//! Shared-memory layouts: SSOT for AMG (writer) and FD, dir_check, sf_* and
//! the dialogs (readers).
//!
//! Every mapped region starts with an [`AfdWordHeader`] of exactly
//! [`AFD_WORD_OFFSET`] bytes followed by an array of fixed-size records.
//! Any field change here MUST keep `#[repr(C)]` ABI stability and bump the
//! matching struct version, since processes built from older code still map
//! the same files.

use serde::Serialize;

/// Size of the generational header in front of every mapped table.
pub const AFD_WORD_OFFSET: usize = 16;

/// FSA struct version. Bump on incompatible changes.
pub const FSA_STRUCT_VERSION: u8 = 2;
/// afd_status struct version.
pub const AFD_STATUS_STRUCT_VERSION: u8 = 1;
/// Dup-check store struct version (stored in the last header byte).
pub const CRC_STRUCT_VERSION: u8 = 1;
/// IP database struct version.
pub const IP_DB_STRUCT_VERSION: u8 = 1;

pub const MAX_HOSTNAME_LENGTH: usize = 16;
pub const MAX_REAL_HOSTNAME_LENGTH: usize = 70;
pub const MAX_TOGGLE_STR_LENGTH: usize = 5;
pub const MAX_PROXY_NAME_LENGTH: usize = 80;
pub const MAX_IP_DB_NAME_LENGTH: usize = 65;
pub const MAX_IP_STR_LENGTH: usize = 46;

/// First byte of `real_hostname[0]` for group placeholders.
pub const GROUP_IDENTIFIER: u8 = 1;

// ---------------------------------------------------------------------------
// Feature flags (header byte 5)
// ---------------------------------------------------------------------------

pub const DISABLE_RETRIEVE: u8 = 0x01;
pub const DISABLE_ARCHIVE: u8 = 0x02;
pub const ENABLE_CREATE_TARGET_DIR: u8 = 0x04;
pub const DISABLE_HOST_WARN_TIME: u8 = 0x08;
pub const DISABLE_CREATE_SOURCE_DIR: u8 = 0x10;
pub const ENABLE_SIMULATE_SEND_MODE: u8 = 0x20;

// ---------------------------------------------------------------------------
// Host status bits
// ---------------------------------------------------------------------------

pub const PAUSE_QUEUE_STAT: u32 = 0x0001;
pub const AUTO_PAUSE_QUEUE_STAT: u32 = 0x0002;
pub const DANGER_PAUSE_QUEUE_STAT: u32 = 0x0004;
pub const STOP_TRANSFER_STAT: u32 = 0x0008;
pub const HOST_CONFIG_HOST_DISABLED: u32 = 0x0010;
pub const HOST_TWO_FLAG: u32 = 0x0020;
pub const DO_NOT_DELETE_DATA: u32 = 0x0040;
pub const HOST_ERROR_OFFLINE_STATIC: u32 = 0x0080;
pub const SIMULATE_SEND_MODE: u32 = 0x0100;
pub const HOST_NOT_IN_DIR_CONFIG: u32 = 0x0200;
pub const HOST_WARN_TIME_REACHED: u32 = 0x0400;
pub const ERROR_HOSTS_IN_GROUP: u32 = 0x0800;

/// Status bits that are persisted in HOST_CONFIG. The rest are runtime state
/// owned by FD and the workers.
pub const HOST_CONFIG_STATUS_MASK: u32 = PAUSE_QUEUE_STAT
    | STOP_TRANSFER_STAT
    | HOST_CONFIG_HOST_DISABLED
    | HOST_TWO_FLAG
    | DO_NOT_DELETE_DATA
    | HOST_ERROR_OFFLINE_STATIC
    | SIMULATE_SEND_MODE;

// ---------------------------------------------------------------------------
// Protocol set
// ---------------------------------------------------------------------------

pub const FTP_FLAG: u32 = 0x0001;
pub const FTPS_FLAG: u32 = 0x0002;
pub const SFTP_FLAG: u32 = 0x0004;
pub const HTTP_FLAG: u32 = 0x0008;
pub const HTTPS_FLAG: u32 = 0x0010;
pub const SMTP_FLAG: u32 = 0x0020;
pub const SMTPS_FLAG: u32 = 0x0040;
pub const LOC_FLAG: u32 = 0x0080;
pub const EXEC_FLAG: u32 = 0x0100;

/// Map a recipient URL scheme onto its protocol bit.
pub fn protocol_from_scheme(scheme: &str) -> Option<u32> {
    match scheme.to_ascii_lowercase().as_str() {
        "ftp" => Some(FTP_FLAG),
        "ftps" => Some(FTPS_FLAG),
        "sftp" => Some(SFTP_FLAG),
        "http" => Some(HTTP_FLAG),
        "https" => Some(HTTPS_FLAG),
        "smtp" | "mailto" => Some(SMTP_FLAG),
        "smtps" => Some(SMTPS_FLAG),
        "file" | "loc" => Some(LOC_FLAG),
        "exec" => Some(EXEC_FLAG),
        _ => None,
    }
}

/// Short names for a protocol set, in bit order.
pub fn protocol_names(protocol: u32) -> Vec<&'static str> {
    const NAMES: [(u32, &str); 9] = [
        (FTP_FLAG, "ftp"),
        (FTPS_FLAG, "ftps"),
        (SFTP_FLAG, "sftp"),
        (HTTP_FLAG, "http"),
        (HTTPS_FLAG, "https"),
        (SMTP_FLAG, "smtp"),
        (SMTPS_FLAG, "smtps"),
        (LOC_FLAG, "file"),
        (EXEC_FLAG, "exec"),
    ];
    NAMES
        .iter()
        .filter(|(bit, _)| protocol & bit != 0)
        .map(|(_, name)| *name)
        .collect()
}

// ---------------------------------------------------------------------------
// Protocol options
// ---------------------------------------------------------------------------

pub const FTP_PASSIVE_MODE: u32 = 0x0001;
pub const SET_IDLE_TIME: u32 = 0x0002;
pub const STAT_KEEPALIVE: u32 = 0x0004;
pub const FTP_FAST_MOVE: u32 = 0x0008;
pub const FTP_FAST_CD: u32 = 0x0010;
pub const FTP_IGNORE_BIN: u32 = 0x0020;
pub const FTP_EXTENDED_MODE: u32 = 0x0040;
pub const NO_AGEING_JOBS: u32 = 0x0080;
pub const USE_SEQUENCE_LOCKING: u32 = 0x0100;
pub const TCP_KEEPALIVE: u32 = 0x0200;
pub const SORT_FILE_NAMES: u32 = 0x0400;
pub const FTP_CCC_OPTION: u32 = 0x0800;

pub const FTP_SEND_UTF8_ON: u32 = 0x0001;
pub const KEEP_CONNECTED_DISCONNECT: u32 = 0x0002;
pub const FTP_DISABLE_MLST: u32 = 0x0004;

// ---------------------------------------------------------------------------
// Duplicate-check flag groups
// ---------------------------------------------------------------------------

pub const DC_FILENAME_ONLY: u32 = 0x0001;
pub const DC_FILE_CONTENT: u32 = 0x0002;
pub const DC_FILE_CONT_NAME: u32 = 0x0004;
pub const DC_NAME_NO_SUFFIX: u32 = 0x0008;
pub const DC_FILENAME_AND_SIZE: u32 = 0x0010;
pub const DC_CRC32: u32 = 0x0020;
pub const DC_CRC32C: u32 = 0x0040;
pub const DC_MURMUR3: u32 = 0x0080;
pub const DC_DELETE: u32 = 0x0100;
pub const DC_STORE: u32 = 0x0200;
pub const DC_WARN: u32 = 0x0400;
pub const TIMEOUT_IS_FIXED: u32 = 0x0800;
pub const USE_RECIPIENT_ID: u32 = 0x1000;

pub const DC_SCOPE_MASK: u32 =
    DC_FILENAME_ONLY | DC_FILE_CONTENT | DC_FILE_CONT_NAME | DC_NAME_NO_SUFFIX | DC_FILENAME_AND_SIZE;
pub const DC_ALGORITHM_MASK: u32 = DC_CRC32 | DC_CRC32C | DC_MURMUR3;
pub const DC_POLICY_MASK: u32 = DC_DELETE | DC_STORE | DC_WARN;

// ---------------------------------------------------------------------------
// Process table
// ---------------------------------------------------------------------------

pub const AMG_NO: usize = 0;
pub const FD_NO: usize = 1;
pub const SLOG_NO: usize = 2;
pub const ELOG_NO: usize = 3;
pub const TDBLOG_NO: usize = 4;
pub const RECEIVELOG_NO: usize = 5;
pub const TRANSLOG_NO: usize = 6;
pub const ARCHIVE_WATCH_NO: usize = 7;
pub const STAT_NO: usize = 8;
pub const DC_NO: usize = 9;
pub const AFDD_NO: usize = 10;
pub const PRODUCTION_LOG_NO: usize = 11;
pub const NO_OF_PROCESS: usize = 12;

pub const PROC_STOPPED: i8 = -1;
pub const PROC_OFF: i8 = 0;
pub const PROC_ON: i8 = 1;
pub const PROC_SHUTDOWN: i8 = 2;

// amg_jobs bits
pub const REREADING_DIR_CONFIG: u32 = 0x01;
pub const FD_WAITING: u32 = 0x02;
pub const WRITTING_JID_STRUCT: u32 = 0x04;
pub const CHECK_FILE_DIR_ACTIVE: u32 = 0x08;

pub const HOST_ONE: u8 = 1;
pub const HOST_TWO: u8 = 2;

// ---------------------------------------------------------------------------
// AfdWordHeader: first 16 bytes of every mapped table
// ---------------------------------------------------------------------------

/// Generational header.
///
/// Layout (16 bytes total):
/// ```text
/// offset  field                  size
/// ------  --------------------   ----
///  0      count                  4    (num_hosts; -1 = stale, reattach)
///  4      host_config_counter    1
///  5      feature_flags          1
///  6      ignore_first_errors    1
///  7      struct_version         1
///  8      pagesize               4
/// 12      reserved               4
/// ```
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AfdWordHeader {
    pub count: i32,
    pub host_config_counter: u8,
    pub feature_flags: u8,
    pub ignore_first_errors: u8,
    pub struct_version: u8,
    pub pagesize: i32,
    pub reserved: [u8; 4],
}

const _: () = assert!(std::mem::size_of::<AfdWordHeader>() == AFD_WORD_OFFSET);

/// Byte offset of `struct_version` inside the header.
pub const STRUCT_VERSION_OFFSET: usize = 7;

impl AfdWordHeader {
    pub fn new(count: i32, struct_version: u8) -> Self {
        Self {
            count,
            struct_version,
            pagesize: page_size() as i32,
            ..Default::default()
        }
    }
}

/// System page size, falling back to 4096 when sysconf refuses to answer.
pub fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

// ---------------------------------------------------------------------------
// HostRecord: one FSA entry
// ---------------------------------------------------------------------------

/// One destination host in the Filetransfer Status Area.
///
/// 8-byte fields first, then 4-byte, then bytes, so `repr(C)` adds no
/// interior padding. Configuration fields are written by AMG only; the
/// runtime counters are updated in place by FD and the transfer workers.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct HostRecord {
    pub last_connection: i64,
    pub last_retry_time: i64,
    pub first_error_time: i64,
    pub dup_check_timeout: i64,
    pub warn_time: i64,
    pub total_file_size: u64,
    pub bytes_send: u64,

    pub host_status: u32,
    pub protocol: u32,
    pub protocol_options: u32,
    pub protocol_options2: u32,
    pub dup_check_flag: u32,
    pub allowed_transfers: i32,
    pub max_errors: i32,
    pub retry_interval: i32,
    pub block_size: i32,
    pub successful_retries: i32,
    pub file_size_offset: i32,
    pub transfer_timeout: i32,
    pub transfer_rate_limit: i32,
    pub ttl: i32,
    pub socksnd_bufsize: u32,
    pub sockrcv_bufsize: u32,
    pub keep_connected: u32,
    pub error_counter: i32,
    pub total_errors: u32,
    pub active_transfers: i32,
    pub jobs_queued: u32,
    pub total_file_counter: u32,
    pub file_counter_done: u32,
    pub connections: u32,

    pub host_toggle: u8,
    pub original_toggle_pos: u8,
    pub auto_toggle: u8,
    pub number_of_no_bursts: u8,
    pub host_alias: [u8; MAX_HOSTNAME_LENGTH + 1],
    pub host_dsp_name: [u8; MAX_HOSTNAME_LENGTH + 2],
    pub real_hostname: [[u8; MAX_REAL_HOSTNAME_LENGTH]; 2],
    pub host_toggle_str: [u8; MAX_TOGGLE_STR_LENGTH],
    pub proxy_name: [u8; MAX_PROXY_NAME_LENGTH + 1],
}

pub const HOST_RECORD_SIZE: usize = std::mem::size_of::<HostRecord>();

const _: () = assert!(HOST_RECORD_SIZE % 8 == 0);

impl HostRecord {
    /// All-zero record.
    pub fn zeroed() -> Self {
        // SAFETY: plain integers and byte arrays; all-zero is a valid value.
        unsafe { std::mem::zeroed() }
    }

    pub fn alias(&self) -> String {
        cstr(&self.host_alias)
    }

    pub fn real_hostname(&self, idx: usize) -> String {
        cstr(&self.real_hostname[idx])
    }

    pub fn toggle_str(&self) -> String {
        cstr(&self.host_toggle_str)
    }

    pub fn proxy(&self) -> String {
        cstr(&self.proxy_name)
    }

    #[inline]
    pub fn is_group(&self) -> bool {
        self.real_hostname[0][0] == GROUP_IDENTIFIER
    }

    /// Hostname currently in use, following the toggle.
    pub fn active_hostname(&self) -> String {
        if self.host_toggle == HOST_TWO {
            self.real_hostname(1)
        } else {
            self.real_hostname(0)
        }
    }

    /// Owned copy suitable for serialisation.
    pub fn snapshot(&self) -> HostSnapshot {
        HostSnapshot {
            alias: self.alias(),
            group: self.is_group(),
            real_hostname: if self.is_group() {
                [String::new(), String::new()]
            } else {
                [self.real_hostname(0), self.real_hostname(1)]
            },
            toggle: self.toggle_str(),
            proxy: self.proxy(),
            protocols: protocol_names(self.protocol)
                .into_iter()
                .map(String::from)
                .collect(),
            host_status: self.host_status,
            allowed_transfers: self.allowed_transfers,
            max_errors: self.max_errors,
            retry_interval: self.retry_interval,
            block_size: self.block_size,
            transfer_timeout: self.transfer_timeout,
            error_counter: self.error_counter,
            active_transfers: self.active_transfers,
            jobs_queued: self.jobs_queued,
            file_counter_done: self.file_counter_done,
            bytes_send: self.bytes_send,
        }
    }
}

/// Serialisable view of a [`HostRecord`] for operator tooling.
#[derive(Debug, Clone, Serialize)]
pub struct HostSnapshot {
    pub alias: String,
    pub group: bool,
    pub real_hostname: [String; 2],
    pub toggle: String,
    pub proxy: String,
    pub protocols: Vec<String>,
    pub host_status: u32,
    pub allowed_transfers: i32,
    pub max_errors: i32,
    pub retry_interval: i32,
    pub block_size: i32,
    pub transfer_timeout: i32,
    pub error_counter: i32,
    pub active_transfers: i32,
    pub jobs_queued: u32,
    pub file_counter_done: u32,
    pub bytes_send: u64,
}

// ---------------------------------------------------------------------------
// AfdStatus: process states shared by every AFD process
// ---------------------------------------------------------------------------

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct AfdStatus {
    pub start_time: i64,
    pub amg_jobs: u32,
    pub sys_log_ec: u32,
    pub fd_fork_counter: u32,
    pub amg: i8,
    pub fd: i8,
    pub dir_check: i8,
    pub archive_watch: i8,
    pub hostname: [u8; MAX_REAL_HOSTNAME_LENGTH],
    pub _pad: [u8; 2],
}

pub const AFD_STATUS_SIZE: usize = std::mem::size_of::<AfdStatus>();

const _: () = assert!(AFD_STATUS_SIZE % 8 == 0);

// ---------------------------------------------------------------------------
// CrcRecord: one dup-check fingerprint
// ---------------------------------------------------------------------------

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CrcRecord {
    pub crc: u32,
    pub flag: u32,
    pub timeout: i64,
}

pub const CRC_RECORD_SIZE: usize = std::mem::size_of::<CrcRecord>();

const _: () = assert!(CRC_RECORD_SIZE == 16);

/// Byte offset of the next-cleanup deadline inside a dup-check header.
pub const CRC_CLEANUP_OFFSET: usize = 4;
/// Byte offset of the struct version inside a dup-check header.
pub const CRC_VERSION_OFFSET: usize = 15;

// ---------------------------------------------------------------------------
// IpRecord: one IP database entry
// ---------------------------------------------------------------------------

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct IpRecord {
    pub last_mod_time: i64,
    pub host_name: [u8; MAX_IP_DB_NAME_LENGTH],
    pub ip_str: [u8; MAX_IP_STR_LENGTH],
    pub _pad: [u8; 1],
}

pub const IP_RECORD_SIZE: usize = std::mem::size_of::<IpRecord>();

const _: () = assert!(IP_RECORD_SIZE == 120);

impl IpRecord {
    pub fn new(host: &str, ip: &str, now: i64) -> Self {
        let mut rec = Self {
            last_mod_time: now,
            host_name: [0; MAX_IP_DB_NAME_LENGTH],
            ip_str: [0; MAX_IP_STR_LENGTH],
            _pad: [0],
        };
        set_cstr(&mut rec.host_name, host);
        set_cstr(&mut rec.ip_str, ip);
        rec
    }

    pub fn host(&self) -> String {
        cstr(&self.host_name)
    }

    pub fn ip(&self) -> String {
        cstr(&self.ip_str)
    }
}

// ---------------------------------------------------------------------------
// Fixed-length string helpers
// ---------------------------------------------------------------------------

/// Copy `src` into `dst`, truncating so at least one trailing NUL remains.
pub fn set_cstr(dst: &mut [u8], src: &str) {
    dst.fill(0);
    let n = src.len().min(dst.len().saturating_sub(1));
    dst[..n].copy_from_slice(&src.as_bytes()[..n]);
}

/// Read a NUL-terminated string out of a fixed buffer.
pub fn cstr(src: &[u8]) -> String {
    let end = src.iter().position(|&b| b == 0).unwrap_or(src.len());
    String::from_utf8_lossy(&src[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_field_offsets() {
        let header = AfdWordHeader {
            count: -1,
            struct_version: 7,
            ..Default::default()
        };
        let bytes: [u8; AFD_WORD_OFFSET] = unsafe { std::mem::transmute(header) };
        assert_eq!(&bytes[0..4], &(-1i32).to_ne_bytes());
        assert_eq!(bytes[STRUCT_VERSION_OFFSET], 7);
    }

    #[test]
    fn test_cstr_truncates_and_terminates() {
        let mut buf = [0xffu8; 4];
        set_cstr(&mut buf, "abcdef");
        assert_eq!(&buf, b"abc\0");
        assert_eq!(cstr(&buf), "abc");
    }

    #[test]
    fn test_group_record() {
        let mut rec = HostRecord::zeroed();
        set_cstr(&mut rec.host_alias, "group1");
        rec.real_hostname[0][0] = GROUP_IDENTIFIER;
        assert!(rec.is_group());
        assert_eq!(rec.snapshot().real_hostname[0], "");
    }

    #[test]
    fn test_protocol_names() {
        assert_eq!(protocol_from_scheme("SFTP"), Some(SFTP_FLAG));
        assert_eq!(protocol_from_scheme("gopher"), None);
        assert_eq!(protocol_names(FTP_FLAG | EXEC_FLAG), vec!["ftp", "exec"]);
    }

    #[test]
    fn test_snapshot_serializes() {
        let mut rec = HostRecord::zeroed();
        set_cstr(&mut rec.host_alias, "h1");
        set_cstr(&mut rec.real_hostname[0], "1.2.3.4");
        rec.protocol = FTP_FLAG;
        let json = serde_json::to_string(&rec.snapshot()).unwrap();
        assert!(json.contains("\"alias\":\"h1\""));
        assert!(json.contains("\"ftp\""));
    }
}
