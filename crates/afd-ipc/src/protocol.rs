//! FIFO command codes, request decoding and reply frames.
//!
//! Every FIFO message starts with a one-byte type code. Requests that expect a
//! reply carry the caller's pid (native-endian `pid_t`) right after the code;
//! the reply goes to `DB_UPDATE_REPLY_FIFO<pid>`.

use std::fmt;

// AMG_CMD_FIFO / DC_CMD_FIFO
pub const SHUTDOWN: u8 = 1;
pub const STOP: u8 = 2;
pub const ACKN: u8 = 3;

// DC_CMD_FIFO
pub const CHECK_FSA_ENTRIES: u8 = 20;
pub const ONETIME_CONFIG: u8 = 21;

// FD_CMD_FIFO
pub const FSA_ABOUT_TO_CHANGE: u8 = 30;

// DB_UPDATE_FIFO
pub const HOST_CONFIG_UPDATE: u8 = 4;
pub const DIR_CONFIG_UPDATE: u8 = 5;
pub const REREAD_HOST_CONFIG: u8 = 6;
pub const REREAD_HOST_CONFIG_VERBOSE1: u8 = 7;
pub const REREAD_HOST_CONFIG_VERBOSE2: u8 = 8;
pub const REREAD_DIR_CONFIG: u8 = 9;
pub const REREAD_DIR_CONFIG_VERBOSE1: u8 = 10;
pub const REREAD_DIR_CONFIG_VERBOSE2: u8 = 11;

pub const PID_SIZE: usize = std::mem::size_of::<libc::pid_t>();

/// Verbosity requested by a reread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    Quiet,
    Verbose1,
    Verbose2,
}

/// One decoded DB_UPDATE_FIFO request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbUpdateRequest {
    HostConfigUpdate,
    DirConfigUpdate,
    RereadHostConfig { reply_pid: i32, verbosity: Verbosity },
    RereadDirConfig { reply_pid: i32, verbosity: Verbosity },
}

impl DbUpdateRequest {
    /// Encode as it travels over the FIFO.
    pub fn to_bytes(&self) -> Vec<u8> {
        let (code, pid) = match *self {
            DbUpdateRequest::HostConfigUpdate => (HOST_CONFIG_UPDATE, None),
            DbUpdateRequest::DirConfigUpdate => (DIR_CONFIG_UPDATE, None),
            DbUpdateRequest::RereadHostConfig {
                reply_pid,
                verbosity,
            } => {
                let code = match verbosity {
                    Verbosity::Quiet => REREAD_HOST_CONFIG,
                    Verbosity::Verbose1 => REREAD_HOST_CONFIG_VERBOSE1,
                    Verbosity::Verbose2 => REREAD_HOST_CONFIG_VERBOSE2,
                };
                (code, Some(reply_pid))
            }
            DbUpdateRequest::RereadDirConfig {
                reply_pid,
                verbosity,
            } => {
                let code = match verbosity {
                    Verbosity::Quiet => REREAD_DIR_CONFIG,
                    Verbosity::Verbose1 => REREAD_DIR_CONFIG_VERBOSE1,
                    Verbosity::Verbose2 => REREAD_DIR_CONFIG_VERBOSE2,
                };
                (code, Some(reply_pid))
            }
        };
        let mut out = vec![code];
        if let Some(pid) = pid {
            out.extend_from_slice(&(pid as libc::pid_t).to_ne_bytes());
        }
        out
    }

    /// Pid waiting for a reply, if any.
    pub fn reply_pid(&self) -> Option<i32> {
        match *self {
            DbUpdateRequest::RereadHostConfig { reply_pid, .. }
            | DbUpdateRequest::RereadDirConfig { reply_pid, .. } => Some(reply_pid),
            _ => None,
        }
    }
}

/// Incremental decoder for DB_UPDATE_FIFO traffic.
///
/// A single `read` may return several requests or split one request in
/// the middle of its pid; the remainder is kept for the next `feed`.
#[derive(Debug, Default)]
pub struct DbUpdateDecoder {
    pending: Vec<u8>,
}

impl DbUpdateDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode as many complete requests as possible. Unknown codes are
    /// returned in the second vector and skipped.
    pub fn feed(&mut self, bytes: &[u8]) -> (Vec<DbUpdateRequest>, Vec<u8>) {
        self.pending.extend_from_slice(bytes);
        let mut requests = Vec::new();
        let mut unknown = Vec::new();
        let mut pos = 0;

        while pos < self.pending.len() {
            let code = self.pending[pos];
            let with_pid = |verbosity| -> Option<(i32, Verbosity)> {
                let start = pos + 1;
                let end = start + PID_SIZE;
                if self.pending.len() < end {
                    return None;
                }
                let mut raw = [0u8; PID_SIZE];
                raw.copy_from_slice(&self.pending[start..end]);
                Some((libc::pid_t::from_ne_bytes(raw) as i32, verbosity))
            };
            let (request, used) = match code {
                HOST_CONFIG_UPDATE => (Some(DbUpdateRequest::HostConfigUpdate), 1),
                DIR_CONFIG_UPDATE => (Some(DbUpdateRequest::DirConfigUpdate), 1),
                REREAD_HOST_CONFIG | REREAD_HOST_CONFIG_VERBOSE1 | REREAD_HOST_CONFIG_VERBOSE2 => {
                    let verbosity = match code {
                        REREAD_HOST_CONFIG => Verbosity::Quiet,
                        REREAD_HOST_CONFIG_VERBOSE1 => Verbosity::Verbose1,
                        _ => Verbosity::Verbose2,
                    };
                    match with_pid(verbosity) {
                        Some((reply_pid, verbosity)) => (
                            Some(DbUpdateRequest::RereadHostConfig {
                                reply_pid,
                                verbosity,
                            }),
                            1 + PID_SIZE,
                        ),
                        None => break,
                    }
                }
                REREAD_DIR_CONFIG | REREAD_DIR_CONFIG_VERBOSE1 | REREAD_DIR_CONFIG_VERBOSE2 => {
                    let verbosity = match code {
                        REREAD_DIR_CONFIG => Verbosity::Quiet,
                        REREAD_DIR_CONFIG_VERBOSE1 => Verbosity::Verbose1,
                        _ => Verbosity::Verbose2,
                    };
                    match with_pid(verbosity) {
                        Some((reply_pid, verbosity)) => (
                            Some(DbUpdateRequest::RereadDirConfig {
                                reply_pid,
                                verbosity,
                            }),
                            1 + PID_SIZE,
                        ),
                        None => break,
                    }
                }
                other => {
                    unknown.push(other);
                    (None, 1)
                }
            };
            if let Some(request) = request {
                requests.push(request);
            }
            pos += used;
        }

        self.pending.drain(..pos);
        (requests, unknown)
    }

    /// Bytes of an incomplete request still waiting for the rest.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

// ---------------------------------------------------------------------------
// Result codes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "Info",
            Severity::Warning => "Warning",
            Severity::Error => "Error",
        }
    }
}

/// Outcome of a HOST_CONFIG reread.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostConfigResult {
    NoChange = 1,
    Recreated = 2,
    DataChanged = 3,
    OrderChanged = 4,
    DataAndOrderChanged = 5,
    RestartFailed = 6,
    NoAccess = 7,
}

impl HostConfigResult {
    pub fn from_i32(v: i32) -> Option<Self> {
        Some(match v {
            1 => Self::NoChange,
            2 => Self::Recreated,
            3 => Self::DataChanged,
            4 => Self::OrderChanged,
            5 => Self::DataAndOrderChanged,
            6 => Self::RestartFailed,
            7 => Self::NoAccess,
            _ => return None,
        })
    }

    pub fn changed(&self) -> bool {
        matches!(
            self,
            Self::Recreated | Self::DataChanged | Self::OrderChanged | Self::DataAndOrderChanged
        )
    }

    pub fn describe(&self) -> (Severity, &'static str) {
        match self {
            Self::NoChange => (Severity::Info, "No changes in HOST_CONFIG"),
            Self::Recreated => (Severity::Warning, "HOST_CONFIG was missing, recreated from FSA"),
            Self::DataChanged => (Severity::Info, "Updated configuration"),
            Self::OrderChanged => (Severity::Info, "Updated configuration, host order changed"),
            Self::DataAndOrderChanged => (
                Severity::Info,
                "Updated configuration, data and host order changed",
            ),
            Self::RestartFailed => (Severity::Error, "Failed to restart process, config updated"),
            Self::NoAccess => (Severity::Error, "Unable to do any changes"),
        }
    }
}

/// Outcome of a DIR_CONFIG reread.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirConfigResult {
    NoChange = 1,
    Updated = 2,
    UpdatedDcProblems = 3,
    Empty = 4,
    NoValidData = 5,
    AccessError = 6,
    NothingDone = 7,
}

impl DirConfigResult {
    pub fn from_i32(v: i32) -> Option<Self> {
        Some(match v {
            1 => Self::NoChange,
            2 => Self::Updated,
            3 => Self::UpdatedDcProblems,
            4 => Self::Empty,
            5 => Self::NoValidData,
            6 => Self::AccessError,
            7 => Self::NothingDone,
            _ => return None,
        })
    }

    pub fn describe(&self) -> (Severity, &'static str) {
        match self {
            Self::NoChange => (Severity::Info, "No changes in DIR_CONFIG"),
            Self::Updated => (Severity::Info, "Updated configuration"),
            Self::UpdatedDcProblems => (
                Severity::Error,
                "Failed to restart process, config updated",
            ),
            Self::Empty => (Severity::Warning, "DIR_CONFIG is empty, nothing changed"),
            Self::NoValidData => (
                Severity::Error,
                "No valid data in DIR_CONFIG, unable to do any changes",
            ),
            Self::AccessError => (Severity::Error, "Unable to access DIR_CONFIG"),
            Self::NothingDone => (Severity::Warning, "Nothing done"),
        }
    }
}

// ---------------------------------------------------------------------------
// Reply frames
// ---------------------------------------------------------------------------

/// 8-byte HOST_CONFIG reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostConfigReply {
    pub hc_result: i32,
    pub hc_warnings: u32,
}

impl HostConfigReply {
    pub const SIZE: usize = 8;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..4].copy_from_slice(&self.hc_result.to_ne_bytes());
        out[4..8].copy_from_slice(&self.hc_warnings.to_ne_bytes());
        out
    }

    pub fn from_bytes(buf: &[u8; Self::SIZE]) -> Self {
        Self {
            hc_result: i32::from_ne_bytes([buf[0], buf[1], buf[2], buf[3]]),
            hc_warnings: u32::from_ne_bytes([buf[4], buf[5], buf[6], buf[7]]),
        }
    }

    pub fn result(&self) -> Option<HostConfigResult> {
        HostConfigResult::from_i32(self.hc_result)
    }
}

/// 16-byte DIR_CONFIG reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirConfigReply {
    pub hc_result: i32,
    pub hc_warnings: u32,
    pub dc_result: i32,
    pub dc_warnings: u32,
}

impl DirConfigReply {
    pub const SIZE: usize = 16;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..4].copy_from_slice(&self.hc_result.to_ne_bytes());
        out[4..8].copy_from_slice(&self.hc_warnings.to_ne_bytes());
        out[8..12].copy_from_slice(&self.dc_result.to_ne_bytes());
        out[12..16].copy_from_slice(&self.dc_warnings.to_ne_bytes());
        out
    }

    pub fn from_bytes(buf: &[u8; Self::SIZE]) -> Self {
        let word = |i: usize| [buf[i], buf[i + 1], buf[i + 2], buf[i + 3]];
        Self {
            hc_result: i32::from_ne_bytes(word(0)),
            hc_warnings: u32::from_ne_bytes(word(4)),
            dc_result: i32::from_ne_bytes(word(8)),
            dc_warnings: u32::from_ne_bytes(word(12)),
        }
    }
}

/// Either reply shape, as received by a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateReply {
    Host(HostConfigReply),
    Dir(DirConfigReply),
}

impl fmt::Display for UpdateReply {
    /// First field is the severity, the remainder describes the outcome.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let warnings = |n: u32| match n {
            0 => String::new(),
            1 => " (1 warning)".to_string(),
            n => format!(" ({} warnings)", n),
        };
        match self {
            UpdateReply::Host(r) => match r.result() {
                Some(res) => {
                    let (sev, text) = res.describe();
                    let sev = if r.hc_warnings > 0 && sev == Severity::Info {
                        Severity::Warning
                    } else {
                        sev
                    };
                    write!(f, "{}: {}{}", sev.as_str(), text, warnings(r.hc_warnings))
                }
                None => write!(f, "Error: unknown result code {}", r.hc_result),
            },
            UpdateReply::Dir(r) => {
                let hc = HostConfigResult::from_i32(r.hc_result);
                let dc = DirConfigResult::from_i32(r.dc_result);
                match dc {
                    Some(dc) => {
                        let (mut sev, text) = dc.describe();
                        if sev == Severity::Info && (r.dc_warnings > 0 || r.hc_warnings > 0) {
                            sev = Severity::Warning;
                        }
                        write!(f, "{}: {}{}", sev.as_str(), text, warnings(r.dc_warnings))?;
                        if let Some(hc) = hc.filter(|hc| *hc != HostConfigResult::NoChange) {
                            write!(f, "; {}{}", hc.describe().1, warnings(r.hc_warnings))?;
                        }
                        Ok(())
                    }
                    None => write!(f, "Error: unknown result code {}", r.dc_result),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decoder_splits_pid_across_reads() {
        let bytes = DbUpdateRequest::RereadHostConfig {
            reply_pid: 4711,
            verbosity: Verbosity::Quiet,
        }
        .to_bytes();
        let mut dec = DbUpdateDecoder::new();
        let (reqs, unknown) = dec.feed(&bytes[..2]);
        assert!(reqs.is_empty());
        assert!(unknown.is_empty());
        assert_eq!(dec.pending(), 2);

        let (reqs, _) = dec.feed(&bytes[2..]);
        assert_eq!(
            reqs,
            vec![DbUpdateRequest::RereadHostConfig {
                reply_pid: 4711,
                verbosity: Verbosity::Quiet
            }]
        );
        assert_eq!(dec.pending(), 0);
    }

    #[test]
    fn test_decoder_mixed_batch() {
        let mut batch = vec![HOST_CONFIG_UPDATE, 0xee];
        batch.extend(
            DbUpdateRequest::RereadDirConfig {
                reply_pid: 12,
                verbosity: Verbosity::Verbose2,
            }
            .to_bytes(),
        );
        batch.push(DIR_CONFIG_UPDATE);

        let (reqs, unknown) = DbUpdateDecoder::new().feed(&batch);
        assert_eq!(unknown, vec![0xee]);
        assert_eq!(reqs.len(), 3);
        assert_eq!(reqs[0], DbUpdateRequest::HostConfigUpdate);
        assert_eq!(reqs[1].reply_pid(), Some(12));
        assert_eq!(reqs[2], DbUpdateRequest::DirConfigUpdate);
    }

    #[test]
    fn test_reply_frames() {
        let hc = HostConfigReply {
            hc_result: HostConfigResult::DataChanged as i32,
            hc_warnings: 2,
        };
        assert_eq!(HostConfigReply::from_bytes(&hc.to_bytes()), hc);

        let dc = DirConfigReply {
            hc_result: 1,
            hc_warnings: 0,
            dc_result: DirConfigResult::Updated as i32,
            dc_warnings: 0,
        };
        assert_eq!(DirConfigReply::from_bytes(&dc.to_bytes()), dc);
    }

    #[test]
    fn test_reply_rendering() {
        let no_change = UpdateReply::Host(HostConfigReply {
            hc_result: HostConfigResult::NoChange as i32,
            hc_warnings: 0,
        });
        assert_eq!(no_change.to_string(), "Info: No changes in HOST_CONFIG");

        let warned = UpdateReply::Host(HostConfigReply {
            hc_result: HostConfigResult::DataChanged as i32,
            hc_warnings: 3,
        });
        assert_eq!(warned.to_string(), "Warning: Updated configuration (3 warnings)");

        let failed = UpdateReply::Dir(DirConfigReply {
            hc_result: HostConfigResult::NoChange as i32,
            hc_warnings: 0,
            dc_result: DirConfigResult::UpdatedDcProblems as i32,
            dc_warnings: 0,
        });
        assert!(failed.to_string().starts_with("Error: Failed to restart process"));
    }
}
