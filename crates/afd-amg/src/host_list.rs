//! HOST_CONFIG: the text form of the FSA.
//!
//! One colon separated line per host:
//!
//! ```text
//! alias:real1:real2:toggle:proxy:allowed:max_err:retry:blksize:succ_retries:
//! fso:timeout:no_bursts:status:proto_opts:rate_limit:ttl:socksnd:sockrcv:
//! [dup_timeout:dup_flag:]keep_connected:warn_time:proto_opts2
//! ```
//!
//! A line holding only an alias is a group placeholder. `\:` inside a
//! field stands for a literal colon.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::time::SystemTime;

use afd_config::HostDefaults;
use afd_ipc::{
    set_cstr, HostConfigResult, HostRecord, GROUP_IDENTIFIER, HOST_CONFIG_STATUS_MASK,
    HOST_NOT_IN_DIR_CONFIG, HOST_ONE,
    MAX_HOSTNAME_LENGTH, MAX_PROXY_NAME_LENGTH, MAX_REAL_HOSTNAME_LENGTH,
};
use serde::Serialize;
use tracing::warn;

use crate::fsa::Fsa;

/// Fields in a line without the dup-check pair.
pub const HOST_CONFIG_FIELDS: usize = 22;
/// Fields in a line with the dup-check pair.
pub const HOST_CONFIG_FIELDS_DUPCHECK: usize = 24;

const HOST_CONFIG_MODE: u32 = 0o644;

const PREAMBLE: &str = "\
#                Host configuration file for the AFD
#                ===================================
#
# Written by AMG whenever the configuration changes; edit it through the
# dialogs or with care. Each line describes one host:
#
#  AH:HN1:HN2:HT:PXY:AT:ME:RI:TB:SR:FSO:TT:NB:HS:SF:TRL:TTL:SSB:SRB:[DT:DF:]KC:WT:SF2
#  |   |   |   |   |  |  |  |  |  |   |  |  |  |  |   |   |   |   |  |  |  |  |   |
#  |   |   |   |   |  |  |  |  |  |   |  |  |  |  |   |   |   |   |  |  |  |  |   +-> Protocol options 2
#  |   |   |   |   |  |  |  |  |  |   |  |  |  |  |   |   |   |   |  |  |  |  +-----> Warn time
#  |   |   |   |   |  |  |  |  |  |   |  |  |  |  |   |   |   |   |  |  |  +--------> Keep connected
#  |   |   |   |   |  |  |  |  |  |   |  |  |  |  |   |   |   |   |  |  +-----------> Dupcheck flag (optional)
#  |   |   |   |   |  |  |  |  |  |   |  |  |  |  |   |   |   |   |  +--------------> Dupcheck timeout (optional)
#  |   |   |   |   |  |  |  |  |  |   |  |  |  |  |   |   |   |   +-----------------> Socket receive buffer
#  |   |   |   |   |  |  |  |  |  |   |  |  |  |  |   |   |   +---------------------> Socket send buffer
#  |   |   |   |   |  |  |  |  |  |   |  |  |  |  |   |   +-------------------------> TTL
#  |   |   |   |   |  |  |  |  |  |   |  |  |  |  |   +-----------------------------> Transfer rate limit (KB/s)
#  |   |   |   |   |  |  |  |  |  |   |  |  |  |  +---------------------------------> Protocol options
#  |   |   |   |   |  |  |  |  |  |   |  |  |  +------------------------------------> Host status
#  |   |   |   |   |  |  |  |  |  |   |  |  +---------------------------------------> Number of no bursts (unused)
#  |   |   |   |   |  |  |  |  |  |   |  +------------------------------------------> Transfer timeout
#  |   |   |   |   |  |  |  |  |  |   +---------------------------------------------> File size offset
#  |   |   |   |   |  |  |  |  |  +-------------------------------------------------> Successful retries
#  |   |   |   |   |  |  |  |  +----------------------------------------------------> Transfer block size
#  |   |   |   |   |  |  |  +-------------------------------------------------------> Retry interval
#  |   |   |   |   |  |  +----------------------------------------------------------> Max. errors
#  |   |   |   |   |  +-------------------------------------------------------------> Allowed transfers
#  |   |   |   |   +----------------------------------------------------------------> Proxy name
#  |   |   |   +--------------------------------------------------------------------> Host toggle {12} auto, [12] manual
#  |   |   +------------------------------------------------------------------------> Real hostname 2
#  |   +----------------------------------------------------------------------------> Real hostname 1
#  +--------------------------------------------------------------------------------> Alias hostname
#
# A line with only an alias is a group heading.

";

#[derive(Debug, thiserror::Error)]
pub enum HostConfigError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("HOST_CONFIG line {line}: {message}")]
    Parse { line: usize, message: String },
}

/// One HOST_CONFIG line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostEntry {
    pub alias: String,
    pub group: bool,
    pub real_hostname: [String; 2],
    pub host_toggle_str: String,
    pub proxy_name: String,
    pub allowed_transfers: i32,
    pub max_errors: i32,
    pub retry_interval: i32,
    pub transfer_blk_size: i32,
    pub successful_retries: i32,
    pub file_size_offset: i32,
    pub transfer_timeout: i32,
    pub number_of_no_bursts: u8,
    pub host_status: u32,
    pub protocol_options: u32,
    pub transfer_rate_limit: i32,
    pub ttl: i32,
    pub socksnd_bufsize: u32,
    pub sockrcv_bufsize: u32,
    pub dup_check_timeout: i64,
    pub dup_check_flag: u32,
    pub keep_connected: u32,
    pub warn_time: i64,
    pub protocol_options2: u32,
    /// Protocols referenced in DIR_CONFIG; not part of the text form.
    pub protocol: u32,
    /// Whether DIR_CONFIG references this host; not part of the text form.
    pub in_dir_config: bool,
}

/// Result of [`parse`].
#[derive(Debug, Default, Clone)]
pub struct ParsedHostConfig {
    pub entries: Vec<HostEntry>,
    pub warnings: u32,
}

impl HostEntry {
    /// A new host with the configured defaults.
    pub fn new(alias: &str, defaults: &HostDefaults) -> Self {
        Self {
            alias: alias.to_string(),
            group: false,
            real_hostname: [alias.to_string(), String::new()],
            host_toggle_str: String::new(),
            proxy_name: String::new(),
            allowed_transfers: defaults.allowed_transfers,
            max_errors: defaults.max_errors,
            retry_interval: defaults.retry_interval,
            transfer_blk_size: defaults.transfer_blocksize,
            successful_retries: defaults.successful_retries,
            file_size_offset: -1,
            transfer_timeout: defaults.transfer_timeout,
            number_of_no_bursts: 0,
            host_status: if defaults.error_offline {
                afd_ipc::HOST_ERROR_OFFLINE_STATIC
            } else {
                0
            },
            protocol_options: 0,
            transfer_rate_limit: 0,
            ttl: 0,
            socksnd_bufsize: 0,
            sockrcv_bufsize: 0,
            dup_check_timeout: 0,
            dup_check_flag: 0,
            keep_connected: 0,
            warn_time: 0,
            protocol_options2: 0,
            protocol: 0,
            in_dir_config: true,
        }
    }

    pub fn group(alias: &str, defaults: &HostDefaults) -> Self {
        Self {
            group: true,
            real_hostname: [String::new(), String::new()],
            ..Self::new(alias, defaults)
        }
    }

    /// Render as one HOST_CONFIG line, without the newline.
    pub fn to_line(&self) -> String {
        if self.group {
            return self.alias.clone();
        }
        let mut fields: Vec<String> = vec![
            self.alias.clone(),
            escape(&self.real_hostname[0]),
            escape(&self.real_hostname[1]),
            self.host_toggle_str.clone(),
            escape(&self.proxy_name),
            self.allowed_transfers.to_string(),
            self.max_errors.to_string(),
            self.retry_interval.to_string(),
            self.transfer_blk_size.to_string(),
            self.successful_retries.to_string(),
            self.file_size_offset.to_string(),
            self.transfer_timeout.to_string(),
            self.number_of_no_bursts.to_string(),
            self.host_status.to_string(),
            self.protocol_options.to_string(),
            self.transfer_rate_limit.to_string(),
            self.ttl.to_string(),
            self.socksnd_bufsize.to_string(),
            self.sockrcv_bufsize.to_string(),
        ];
        if self.dup_check_timeout != 0 || self.dup_check_flag != 0 {
            fields.push(self.dup_check_timeout.to_string());
            fields.push(self.dup_check_flag.to_string());
        }
        fields.push(self.keep_connected.to_string());
        fields.push(self.warn_time.to_string());
        fields.push(self.protocol_options2.to_string());
        fields.join(":")
    }

    /// Build the FSA record for this host.
    pub fn to_record(&self) -> HostRecord {
        let mut rec = HostRecord::zeroed();
        set_cstr(&mut rec.host_alias, &self.alias);
        if self.group {
            rec.real_hostname[0][0] = GROUP_IDENTIFIER;
        } else {
            set_cstr(&mut rec.real_hostname[0], &self.real_hostname[0]);
            set_cstr(&mut rec.real_hostname[1], &self.real_hostname[1]);
        }
        set_cstr(&mut rec.host_toggle_str, &self.host_toggle_str);
        set_cstr(&mut rec.proxy_name, &self.proxy_name);

        let mut dsp = self.alias.clone();
        if let Some(c) = self.host_toggle_str.chars().nth(usize::from(HOST_ONE)) {
            dsp.push(c);
        }
        set_cstr(&mut rec.host_dsp_name, &dsp);
        rec.host_toggle = HOST_ONE;
        rec.original_toggle_pos = 0;
        rec.auto_toggle = u8::from(self.host_toggle_str.starts_with('{'));

        rec.allowed_transfers = self.allowed_transfers;
        rec.max_errors = self.max_errors;
        rec.retry_interval = self.retry_interval;
        rec.block_size = self.transfer_blk_size;
        rec.successful_retries = self.successful_retries;
        rec.file_size_offset = self.file_size_offset;
        rec.transfer_timeout = self.transfer_timeout;
        rec.number_of_no_bursts = self.number_of_no_bursts;
        rec.host_status = self.host_status & HOST_CONFIG_STATUS_MASK;
        if !self.in_dir_config && !self.group {
            rec.host_status |= HOST_NOT_IN_DIR_CONFIG;
        }
        rec.protocol = self.protocol;
        rec.protocol_options = self.protocol_options;
        rec.protocol_options2 = self.protocol_options2;
        rec.transfer_rate_limit = self.transfer_rate_limit;
        rec.ttl = self.ttl;
        rec.socksnd_bufsize = self.socksnd_bufsize;
        rec.sockrcv_bufsize = self.sockrcv_bufsize;
        rec.dup_check_timeout = self.dup_check_timeout;
        rec.dup_check_flag = self.dup_check_flag;
        rec.keep_connected = self.keep_connected;
        rec.warn_time = self.warn_time;
        rec
    }

    /// Configuration part of an FSA record.
    pub fn from_record(rec: &HostRecord) -> Self {
        Self {
            alias: rec.alias(),
            group: rec.is_group(),
            real_hostname: if rec.is_group() {
                [String::new(), String::new()]
            } else {
                [rec.real_hostname(0), rec.real_hostname(1)]
            },
            host_toggle_str: rec.toggle_str(),
            proxy_name: rec.proxy(),
            allowed_transfers: rec.allowed_transfers,
            max_errors: rec.max_errors,
            retry_interval: rec.retry_interval,
            transfer_blk_size: rec.block_size,
            successful_retries: rec.successful_retries,
            file_size_offset: rec.file_size_offset,
            transfer_timeout: rec.transfer_timeout,
            number_of_no_bursts: rec.number_of_no_bursts,
            host_status: rec.host_status & HOST_CONFIG_STATUS_MASK,
            protocol_options: rec.protocol_options,
            transfer_rate_limit: rec.transfer_rate_limit,
            ttl: rec.ttl,
            socksnd_bufsize: rec.socksnd_bufsize,
            sockrcv_bufsize: rec.sockrcv_bufsize,
            dup_check_timeout: rec.dup_check_timeout,
            dup_check_flag: rec.dup_check_flag,
            keep_connected: rec.keep_connected,
            warn_time: rec.warn_time,
            protocol_options2: rec.protocol_options2,
            protocol: rec.protocol,
            in_dir_config: rec.host_status & HOST_NOT_IN_DIR_CONFIG == 0,
        }
    }

    /// Whether the text form of both entries is identical.
    pub fn same_config(&self, other: &HostEntry) -> bool {
        self.to_line() == other.to_line()
    }
}

fn escape(field: &str) -> String {
    field.replace(':', "\\:")
}

/// Split on `:` honouring `\:`.
fn split_fields(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&':') => {
                current.push(':');
                chars.next();
            }
            ':' => fields.push(std::mem::take(&mut current)),
            c => current.push(c),
        }
    }
    fields.push(current);
    fields
}

fn valid_toggle(toggle: &str) -> bool {
    let b = toggle.as_bytes();
    b.len() == 4
        && ((b[0] == b'{' && b[3] == b'}') || (b[0] == b'[' && b[3] == b']'))
        && b[1] != b[2]
        && b[1].is_ascii_graphic()
        && b[2].is_ascii_graphic()
}

struct FieldReader<'a> {
    line_no: usize,
    alias: &'a str,
    warnings: u32,
}

impl FieldReader<'_> {
    fn number<T>(&mut self, name: &str, value: &str, valid: impl Fn(T) -> bool, default: T) -> T
    where
        T: std::str::FromStr + Copy + std::fmt::Display,
    {
        let value = value.trim();
        if value.is_empty() {
            return default;
        }
        match value.parse::<T>() {
            Ok(v) if valid(v) => v,
            _ => {
                warn!(
                    line = self.line_no,
                    alias = self.alias,
                    field = name,
                    value,
                    %default,
                    "Invalid value in HOST_CONFIG, using default"
                );
                self.warnings += 1;
                default
            }
        }
    }

    fn text(&mut self, name: &str, value: &str, max: usize) -> String {
        if value.len() >= max {
            warn!(
                line = self.line_no,
                alias = self.alias,
                field = name,
                max = max - 1,
                "Value too long in HOST_CONFIG, truncated"
            );
            self.warnings += 1;
            let mut end = max - 1;
            while !value.is_char_boundary(end) {
                end -= 1;
            }
            value[..end].to_string()
        } else {
            value.to_string()
        }
    }
}

/// Parse HOST_CONFIG text.
///
/// Structural problems (wrong field count, duplicate or overlong alias)
/// are errors. Bad values fall back to `defaults` and are counted as
/// warnings.
pub fn parse(text: &str, defaults: &HostDefaults) -> Result<ParsedHostConfig, HostConfigError> {
    let mut out = ParsedHostConfig::default();
    let mut seen = std::collections::HashSet::new();

    for (idx, raw) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw.trim_end_matches('\r');
        if line.trim().is_empty() || line.starts_with('#') {
            continue;
        }
        let fields = split_fields(line);
        let alias = fields[0].trim();
        if alias.is_empty() {
            return Err(HostConfigError::Parse {
                line: line_no,
                message: "empty alias".to_string(),
            });
        }
        if alias.len() > MAX_HOSTNAME_LENGTH {
            return Err(HostConfigError::Parse {
                line: line_no,
                message: format!(
                    "alias {} longer than {} characters",
                    alias, MAX_HOSTNAME_LENGTH
                ),
            });
        }
        if !seen.insert(alias.to_string()) {
            return Err(HostConfigError::Parse {
                line: line_no,
                message: format!("duplicate alias {}", alias),
            });
        }

        if fields.len() == 1 {
            out.entries.push(HostEntry::group(alias, defaults));
            continue;
        }
        let with_dupcheck = match fields.len() {
            HOST_CONFIG_FIELDS => false,
            HOST_CONFIG_FIELDS_DUPCHECK => true,
            n => {
                return Err(HostConfigError::Parse {
                    line: line_no,
                    message: format!(
                        "{} fields, expected {} or {}",
                        n, HOST_CONFIG_FIELDS, HOST_CONFIG_FIELDS_DUPCHECK
                    ),
                })
            }
        };

        let mut r = FieldReader {
            line_no,
            alias,
            warnings: 0,
        };
        let mut entry = HostEntry::new(alias, defaults);

        let real1 = r.text("real hostname 1", fields[1].trim(), MAX_REAL_HOSTNAME_LENGTH);
        entry.real_hostname[0] = if real1.is_empty() {
            alias.to_string()
        } else {
            real1
        };
        entry.real_hostname[1] = r.text("real hostname 2", fields[2].trim(), MAX_REAL_HOSTNAME_LENGTH);

        let toggle = fields[3].trim();
        if !toggle.is_empty() {
            if valid_toggle(toggle) {
                entry.host_toggle_str = toggle.to_string();
            } else {
                warn!(line = line_no, alias, toggle, "Invalid host toggle, ignored");
                r.warnings += 1;
            }
        }
        entry.proxy_name = r.text("proxy", &fields[4], MAX_PROXY_NAME_LENGTH + 1);

        let max_jobs = afd_config::MAX_NO_PARALLEL_JOBS;
        entry.allowed_transfers = r.number(
            "allowed transfers",
            &fields[5],
            |v| (1..=max_jobs).contains(&v),
            defaults.allowed_transfers,
        );
        entry.max_errors = r.number("max errors", &fields[6], |v| (0..=65535).contains(&v), defaults.max_errors);
        entry.retry_interval = r.number(
            "retry interval",
            &fields[7],
            |v| (0..=86400).contains(&v),
            defaults.retry_interval,
        );
        entry.transfer_blk_size = r.number(
            "transfer block size",
            &fields[8],
            |v| (afd_config::MIN_TRANSFER_BLOCKSIZE..=afd_config::MAX_TRANSFER_BLOCKSIZE).contains(&v),
            defaults.transfer_blocksize,
        );
        entry.successful_retries = r.number(
            "successful retries",
            &fields[9],
            |v| (0..=65535).contains(&v),
            defaults.successful_retries,
        );
        entry.file_size_offset = r.number("file size offset", &fields[10], |v: i32| v >= -2, -1);
        entry.transfer_timeout = r.number(
            "transfer timeout",
            &fields[11],
            |v| (1..=86400).contains(&v),
            defaults.transfer_timeout,
        );
        entry.number_of_no_bursts = r.number("number of no bursts", &fields[12], |_| true, 0u8);
        entry.host_status =
            r.number("host status", &fields[13], |_| true, 0u32) & HOST_CONFIG_STATUS_MASK;
        entry.protocol_options = r.number("protocol options", &fields[14], |_| true, 0u32);
        entry.transfer_rate_limit = r.number("transfer rate limit", &fields[15], |v: i32| v >= 0, 0);
        entry.ttl = r.number("TTL", &fields[16], |v: i32| v >= 0, 0);
        entry.socksnd_bufsize = r.number("socket send buffer", &fields[17], |_| true, 0u32);
        entry.sockrcv_bufsize = r.number("socket receive buffer", &fields[18], |_| true, 0u32);

        let mut next = 19;
        if with_dupcheck {
            entry.dup_check_timeout = r.number("dupcheck timeout", &fields[19], |v: i64| v >= 0, 0);
            entry.dup_check_flag = r.number("dupcheck flag", &fields[20], |_| true, 0u32);
            next = 21;
        }
        entry.keep_connected = r.number("keep connected", &fields[next], |_| true, 0u32);
        entry.warn_time = r.number("warn time", &fields[next + 1], |v: i64| v >= 0, 0);
        entry.protocol_options2 = r.number("protocol options 2", &fields[next + 2], |_| true, 0u32);

        out.warnings += r.warnings;
        out.entries.push(entry);
    }
    Ok(out)
}

/// Read and parse a HOST_CONFIG file.
pub fn read(path: &Path, defaults: &HostDefaults) -> Result<ParsedHostConfig, HostConfigError> {
    let text = std::fs::read_to_string(path)?;
    parse(&text, defaults)
}

/// Write HOST_CONFIG atomically and return the new mtime.
///
/// The text goes to `.HOST_CONFIG` next to `path`, is fsynced and renamed
/// over the target, so readers see either the old or the new file.
pub fn write(path: &Path, entries: &[HostEntry]) -> Result<SystemTime, HostConfigError> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| afd_config::path::HOST_CONFIG_FILE.to_string());
    let tmp = path.with_file_name(format!(".{}", file_name));

    let mut text = String::with_capacity(PREAMBLE.len() + entries.len() * 64);
    text.push_str(PREAMBLE);
    for entry in entries {
        text.push_str(&entry.to_line());
        text.push('\n');
    }

    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(HOST_CONFIG_MODE)
            .open(&tmp)?;
        file.write_all(text.as_bytes())?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(std::fs::metadata(path)?.modified()?)
}

/// Overwrite the configuration of every alias present in both `list` and
/// the live FSA with what the FSA holds.
pub fn merge_from_fsa(list: &mut [HostEntry], fsa: &Fsa) -> usize {
    let mut merged = 0;
    for entry in list.iter_mut() {
        if let Some(pos) = fsa.position(&entry.alias) {
            let (protocol, in_dir_config) = (entry.protocol, entry.in_dir_config);
            *entry = HostEntry::from_record(&fsa.hosts()[pos]);
            if protocol != 0 {
                entry.protocol = protocol;
                entry.in_dir_config = in_dir_config;
            }
            merged += 1;
        }
    }
    merged
}

/// Host list as currently held by the FSA.
pub fn from_fsa(fsa: &Fsa) -> Vec<HostEntry> {
    fsa.hosts()[..fsa.num_hosts()]
        .iter()
        .map(HostEntry::from_record)
        .collect()
}

/// Classify the difference between two host lists.
pub fn compare(old: &[HostEntry], new: &[HostEntry]) -> HostConfigResult {
    let data_changed = old.len() != new.len()
        || new.iter().any(|n| {
            old.iter()
                .find(|o| o.alias == n.alias)
                .map_or(true, |o| !o.same_config(n))
        });

    // Relative order of the aliases both lists share.
    let common_old: Vec<&str> = old
        .iter()
        .filter(|o| new.iter().any(|n| n.alias == o.alias))
        .map(|o| o.alias.as_str())
        .collect();
    let common_new: Vec<&str> = new
        .iter()
        .filter(|n| old.iter().any(|o| o.alias == n.alias))
        .map(|n| n.alias.as_str())
        .collect();
    let order_changed = common_old != common_new;

    match (data_changed, order_changed) {
        (false, false) => HostConfigResult::NoChange,
        (true, false) => HostConfigResult::DataChanged,
        (false, true) => HostConfigResult::OrderChanged,
        (true, true) => HostConfigResult::DataAndOrderChanged,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsa::FsaFlags;
    use tempfile::tempdir;

    const S1: &str = "h1:1.2.3.4::::3:10:300:4096:10:-1:120:0:0:1:0:0:0:0:0:0:0";

    fn defaults() -> HostDefaults {
        HostDefaults::default()
    }

    #[test]
    fn test_parse_plain_line() {
        let parsed = parse(&format!("# comment\n\n{}\n", S1), &defaults()).unwrap();
        assert_eq!(parsed.warnings, 0);
        let h = &parsed.entries[0];
        assert_eq!(h.alias, "h1");
        assert_eq!(h.real_hostname[0], "1.2.3.4");
        assert_eq!(h.allowed_transfers, 3);
        assert_eq!(h.retry_interval, 300);
        assert_eq!(h.transfer_blk_size, 4096);
        assert_eq!(h.file_size_offset, -1);
        assert_eq!(h.protocol_options, 1);
        assert_eq!(h.to_line(), S1);
    }

    #[test]
    fn test_group_and_escape_roundtrip() {
        let text = "group1\nv6:fe80\\:\\:1::{ab}::3:10:300:4096:10:-2:120:0:0:0:0:0:0:0:3600:33:0:0:0\n";
        let parsed = parse(text, &defaults()).unwrap();
        assert!(parsed.entries[0].group);
        let v6 = &parsed.entries[1];
        assert_eq!(v6.real_hostname[0], "fe80::1");
        assert_eq!(v6.host_toggle_str, "{ab}");
        assert_eq!(v6.dup_check_timeout, 3600);
        assert_eq!(v6.dup_check_flag, 33);
        assert_eq!(v6.file_size_offset, -2);

        let rendered: String = parsed
            .entries
            .iter()
            .map(|e| format!("{}\n", e.to_line()))
            .collect();
        let again = parse(&rendered, &defaults()).unwrap();
        assert_eq!(again.entries, parsed.entries);
    }

    #[test]
    fn test_field_count_error_names_line() {
        let err = parse("# c\nbad:1:2:3\n", &defaults()).unwrap_err();
        match err {
            HostConfigError::Parse { line, message } => {
                assert_eq!(line, 2);
                assert!(message.contains("4 fields"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_alias_is_error() {
        let text = format!("{}\n{}\n", S1, S1);
        assert!(matches!(
            parse(&text, &defaults()),
            Err(HostConfigError::Parse { line: 2, .. })
        ));
    }

    #[test]
    fn test_out_of_range_values_fall_back() {
        let line = "h9:host::[xx]::99:10:300:17:10:-7:0:0:0:0:-5:0:0:0:0:0:0";
        let parsed = parse(line, &defaults()).unwrap();
        let h = &parsed.entries[0];
        let d = defaults();
        assert_eq!(h.allowed_transfers, d.allowed_transfers);
        assert_eq!(h.transfer_blk_size, d.transfer_blocksize);
        assert_eq!(h.file_size_offset, -1);
        assert_eq!(h.transfer_timeout, d.transfer_timeout);
        assert_eq!(h.transfer_rate_limit, 0);
        assert!(h.host_toggle_str.is_empty());
        // toggle, allowed, blksize, fso, timeout, rate limit
        assert_eq!(parsed.warnings, 6);
    }

    #[test]
    fn test_empty_real_hostname_uses_alias() {
        let parsed = parse("lonely:::::3:10:300:4096:10:-1:120:0:0:0:0:0:0:0:0:0:0", &defaults()).unwrap();
        assert_eq!(parsed.entries[0].real_hostname[0], "lonely");
    }

    #[test]
    fn test_write_is_atomic_rename() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("HOST_CONFIG");
        std::fs::write(&path, "old content\n").unwrap();
        let entries = parse(S1, &defaults()).unwrap().entries;
        let mtime = write(&path, &entries).unwrap();

        assert!(!temp.path().join(".HOST_CONFIG").exists());
        assert_eq!(std::fs::metadata(&path).unwrap().modified().unwrap(), mtime);
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("#"));
        assert!(text.ends_with(&format!("{}\n", S1)));
        assert_eq!(read(&path, &defaults()).unwrap().entries, entries);
    }

    #[test]
    fn test_compare() {
        let d = defaults();
        let a = HostEntry::new("a", &d);
        let b = HostEntry::new("b", &d);
        let mut b2 = b.clone();
        b2.retry_interval = 1;
        let c = HostEntry::new("c", &d);

        let base = vec![a.clone(), b.clone()];
        assert_eq!(compare(&base, &base), HostConfigResult::NoChange);
        assert_eq!(compare(&base, &[a.clone(), b2.clone()]), HostConfigResult::DataChanged);
        assert_eq!(compare(&base, &[b.clone(), a.clone()]), HostConfigResult::OrderChanged);
        assert_eq!(
            compare(&base, &[b2, a.clone()]),
            HostConfigResult::DataAndOrderChanged
        );
        assert_eq!(compare(&base, &[a, b, c]), HostConfigResult::DataChanged);
    }

    #[test]
    fn test_record_roundtrip_and_merge() {
        let temp = tempdir().unwrap();
        let d = defaults();
        let mut live = parse(S1, &d).unwrap().entries;
        live[0].retry_interval = 60;
        live.push(HostEntry::group("grp", &d));
        let records: Vec<HostRecord> = live.iter().map(HostEntry::to_record).collect();
        let fsa = crate::fsa::Fsa::create(temp.path(), &records, FsaFlags::default(), None).unwrap();

        assert_eq!(from_fsa(&fsa), live);

        let mut stale = parse(S1, &d).unwrap().entries;
        stale.push(HostEntry::new("only_in_file", &d));
        assert_eq!(merge_from_fsa(&mut stale, &fsa), 1);
        assert_eq!(stale[0].retry_interval, 60);
        assert_eq!(stale[1].alias, "only_in_file");
    }

    #[test]
    fn test_display_name_follows_toggle() {
        let mut e = HostEntry::new("h", &defaults());
        e.host_toggle_str = "[12]".to_string();
        let rec = e.to_record();
        assert_eq!(afd_ipc::cstr(&rec.host_dsp_name), "h1");
        assert_eq!(rec.auto_toggle, 0);
    }
}
