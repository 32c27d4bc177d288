//! AMG supervisor.
//!
//! Startup builds the FSA from HOST_CONFIG and DIR_CONFIG and starts
//! dir_check. After that a single task waits on the two control FIFOs,
//! the termination signals and the rescan timer, and handles one event at
//! a time.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use afd_config::logging::{
    EventClass, EventLog, EventType, UpdateDbLog, EA_AMG_START, EA_AMG_STOP,
    EA_DIR_CHECK_RESTART, EA_ONETIME_CONFIG, EA_REREAD_DIR_CONFIG, EA_REREAD_HOST_CONFIG,
};
use afd_config::path::{create_dir_mode, DIR_MODE};
use afd_config::{
    log_amg_debug, log_amg_error, log_amg_fatal, log_amg_info, log_amg_warn, AmgConfig, WorkDir,
};
use afd_ipc::client::{reply_fifo_path, send_command};
use afd_ipc::{
    make_fifo, DbUpdateDecoder, DbUpdateRequest, DirConfigReply, DirConfigResult, FifoError,
    HostConfigReply, HostConfigResult, HostRecord, AMG_CMD_FIFO, AMG_NO, CHECK_FSA_ENTRIES,
    CONTROL_FIFOS, DB_UPDATE_FIFO, DC_CMD_FIFO, DC_NO, DISABLE_CREATE_SOURCE_DIR, FD_CMD_FIFO,
    FD_WAITING, FSA_ABOUT_TO_CHANGE, ONETIME_CONFIG, PROC_OFF, PROC_ON, PROC_SHUTDOWN,
    PROC_STOPPED, REREADING_DIR_CONFIG,
};
use anyhow::{bail, Context, Result};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::AsyncReadExt;
use tokio::net::unix::pipe;
use tokio::signal::unix::{signal, SignalKind};
use tokio::time::MissedTickBehavior;
use tracing::{debug, Level};

use crate::afd_status::{AfdActive, AfdStatusMap};
use crate::counter::Counter;
use crate::dir_check::{DirCheck, DirCheckCommand, StopOutcome};
use crate::dir_config::{
    apply_to_host_list, DirConfigEval, DirConfigEvaluator, DirConfigSet, TextDirConfig,
    MIN_DIR_CONFIG_SIZE,
};
use crate::extra_workdir::{self, ExtraWorkDir};
use crate::fsa::{Fsa, FsaFlags};
use crate::host_list::{self, HostEntry};
use crate::lock::ProcessLock;

const WHO: &str = "AMG";

/// Iterations of [`FD_WAIT_STEP`] AMG waits for FD to acknowledge an FSA
/// change.
pub const WAIT_LOOPS: u32 = 600;
pub const FD_WAIT_STEP: Duration = Duration::from_millis(100);

/// Exit code for a fatal initialisation error.
pub const INCORRECT: u8 = 1;
/// Exit code asking init to start AMG again.
pub const RESTART_REQUESTED: u8 = 3;

/// What made the main loop end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Traffic on AMG_CMD_FIFO.
    Shutdown,
    Signal(i32),
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("AMG failed to start: {0:#}")]
    Init(anyhow::Error),
    #[error("AMG main loop failed: {0:#}")]
    Runtime(anyhow::Error),
}

impl SupervisorError {
    pub fn exit_code(&self) -> u8 {
        match self {
            SupervisorError::Init(_) => INCORRECT,
            SupervisorError::Runtime(_) => RESTART_REQUESTED,
        }
    }
}

pub struct AmgOptions {
    pub work: WorkDir,
    /// `None` runs AMG without a dir_check child.
    pub dir_check: Option<DirCheckCommand>,
    pub evaluator: Box<dyn DirConfigEvaluator + Send + Sync>,
    pub fd_wait_loops: u32,
}

impl AmgOptions {
    pub fn new(work: WorkDir) -> Self {
        Self {
            work,
            dir_check: None,
            evaluator: Box::new(TextDirConfig),
            fd_wait_loops: WAIT_LOOPS,
        }
    }

    pub fn with_dir_check(mut self, cmd: DirCheckCommand) -> Self {
        self.dir_check = Some(cmd);
        self
    }
}

/// Start AMG and run it until it is told to stop.
pub async fn run(options: AmgOptions) -> Result<StopReason, SupervisorError> {
    let supervisor = Supervisor::start(options)
        .await
        .map_err(SupervisorError::Init)?;
    supervisor.run().await.map_err(SupervisorError::Runtime)
}

pub struct Supervisor {
    work: WorkDir,
    fifo_dir: PathBuf,
    config: AmgConfig,
    _lock: ProcessLock,
    status: AfdStatusMap,
    active: AfdActive,
    counter: Option<Counter>,
    fsa: Option<Fsa>,
    hosts: Vec<HostEntry>,
    host_config_mtime: Option<SystemTime>,
    dir_configs: DirConfigSet,
    eval: DirConfigEval,
    evaluator: Box<dyn DirConfigEvaluator + Send + Sync>,
    dir_check_cmd: Option<DirCheckCommand>,
    dir_check: Option<DirCheck>,
    events: EventLog,
    fd_wait_loops: u32,
    extra_dirs: Vec<ExtraWorkDir>,
    control: Option<ControlFifos>,
}

/// Read ends of the two FIFOs AMG listens on.
struct ControlFifos {
    amg_cmd: pipe::Receiver,
    db_update: pipe::Receiver,
}

impl ControlFifos {
    fn open(fifo_dir: &Path) -> Result<Self> {
        Ok(Self {
            amg_cmd: open_fifo_receiver(&fifo_dir.join(AMG_CMD_FIFO))?,
            db_update: open_fifo_receiver(&fifo_dir.join(DB_UPDATE_FIFO))?,
        })
    }
}

fn open_fifo_receiver(path: &Path) -> Result<pipe::Receiver> {
    make_fifo(path).with_context(|| format!("Failed to create {}", path.display()))?;
    // Read/write so the fifo never reports EOF while no writer is around.
    pipe::OpenOptions::new()
        .read_write(true)
        .open_receiver(path)
        .with_context(|| format!("Failed to open {}", path.display()))
}

fn set_priority(priority: i32) {
    // SAFETY: plain syscall on the calling process.
    let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, priority) };
    if rc == -1 {
        log_amg_warn!(priority, error = %io::Error::last_os_error(), "Failed to set AMG priority");
    }
}

/// Remove what a dead dir_check left in the pool. Link farm entries stay.
fn clear_pool_dir(pool: &Path) -> io::Result<usize> {
    let entries = match std::fs::read_dir(pool) {
        Ok(e) => e,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };
    let mut removed = 0;
    for entry in entries {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_symlink() {
            continue;
        }
        if file_type.is_dir() {
            std::fs::remove_dir_all(entry.path())?;
        } else {
            std::fs::remove_file(entry.path())?;
        }
        removed += 1;
    }
    Ok(removed)
}

fn remove_logged(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            log_amg_warn!(path = %path.display(), error = %e, "Failed to remove file");
        }
    }
}

/// The live FSA, when there is one.
fn live_fsa(fifo_dir: &Path) -> Option<Fsa> {
    match Fsa::current_id(fifo_dir) {
        Ok(Some(_)) => match Fsa::attach_passive(fifo_dir, true, WHO) {
            Ok(fsa) => Some(fsa),
            Err(e) => {
                debug!(error = %e, "No usable FSA to recover hosts from");
                None
            }
        },
        _ => None,
    }
}

impl Supervisor {
    /// Run the startup sequence.
    pub async fn start(options: AmgOptions) -> Result<Self> {
        let AmgOptions {
            work,
            dir_check,
            evaluator,
            fd_wait_loops,
        } = options;
        let fifo_dir = work.fifo_dir();
        work.create_layout()
            .with_context(|| format!("Failed to create work dir {}", work.root().display()))?;

        let lock = ProcessLock::acquire(&fifo_dir, AMG_NO).context("Failed to lock AMG slot")?;

        let mut status = AfdStatusMap::create(&fifo_dir).context("Failed to attach afd_status")?;
        let active = AfdActive::open(&fifo_dir)?;
        let old_dc = active.pid(DC_NO)?;
        if old_dc > 0 {
            match kill(Pid::from_raw(old_dc), Signal::SIGINT) {
                Ok(()) => log_amg_info!(pid = old_dc, "Interrupted dir_check left by a previous AMG"),
                Err(Errno::ESRCH) => {}
                Err(e) => log_amg_warn!(pid = old_dc, error = %e, "Failed to interrupt old dir_check"),
            }
            active.set_pid(DC_NO, 0)?;
        }
        active.set_pid(AMG_NO, std::process::id() as i32)?;
        status.set_amg(PROC_ON)?;

        let counter = Counter::create(&work.counter_file()).context("Failed to create counter")?;

        for name in CONTROL_FIFOS {
            let path = fifo_dir.join(name);
            make_fifo(&path).with_context(|| format!("Failed to create {}", path.display()))?;
        }
        let control = ControlFifos::open(&fifo_dir)?;

        let mut config = AmgConfig::load(&work).context("Failed to read AFD_CONFIG")?;
        if let Some(priority) = config.amg_priority {
            set_priority(priority);
        }
        let defaults = config.host_defaults;

        let extra_dirs = match extra_workdir::setup(&work, &config.extra_work_dirs) {
            Ok(dirs) => dirs,
            Err(e) => {
                log_amg_error!(error = %e, "Failed to set up extra work dirs");
                Vec::new()
            }
        };

        let host_config = work.host_config();
        let interrupted_write = host_config.with_file_name(format!(
            ".{}",
            afd_config::path::HOST_CONFIG_FILE
        ));
        let mut hosts = match host_list::read(&host_config, &defaults) {
            Ok(parsed) => {
                let mut entries = parsed.entries;
                if interrupted_write.exists() {
                    // A rewrite never completed; the FSA has the newer values.
                    if let Some(fsa) = live_fsa(&fifo_dir) {
                        let merged = host_list::merge_from_fsa(&mut entries, &fsa);
                        log_amg_warn!(merged, "HOST_CONFIG rewrite was interrupted, took values from FSA");
                        if let Err(e) = fsa.detach() {
                            log_amg_warn!(error = %e, "Failed to detach FSA");
                        }
                    }
                    remove_logged(&interrupted_write);
                }
                entries
            }
            Err(e) => {
                log_amg_warn!(path = %host_config.display(), error = %e, "Failed to read HOST_CONFIG");
                match live_fsa(&fifo_dir) {
                    Some(fsa) => {
                        let entries = host_list::from_fsa(&fsa);
                        log_amg_info!(hosts = entries.len(), "Recovered host list from FSA");
                        if let Err(e) = fsa.detach() {
                            log_amg_warn!(error = %e, "Failed to detach FSA");
                        }
                        entries
                    }
                    None => Vec::new(),
                }
            }
        };

        let dir_configs = DirConfigSet::enumerate(&work, &config.dir_config_names)
            .context("Failed to enumerate DIR_CONFIG files")?;
        if dir_configs.total_size() < MIN_DIR_CONFIG_SIZE {
            log_amg_fatal!(
                size = dir_configs.total_size(),
                "DIR_CONFIG is missing or too small to hold a configuration"
            );
            bail!("No usable DIR_CONFIG ({} bytes)", dir_configs.total_size());
        }

        status.set_amg_jobs(REREADING_DIR_CONFIG);

        let features = match Fsa::current_id(&fifo_dir) {
            Ok(Some(_)) => Fsa::attach_features(&fifo_dir, WHO).ok(),
            _ => None,
        };
        let feature_flags = features.map_or(0, |h| h.feature_flags);
        if feature_flags & DISABLE_CREATE_SOURCE_DIR != 0 && config.create_source_dir {
            log_amg_warn!("Source directory creation is disabled by the FSA feature flags, overriding AFD_CONFIG");
            config.create_source_dir = false;
        }

        let events = EventLog::new(&fifo_dir);
        let mut supervisor = Supervisor {
            work,
            fifo_dir,
            config,
            _lock: lock,
            status,
            active,
            counter: Some(counter),
            fsa: None,
            hosts: Vec::new(),
            host_config_mtime: None,
            dir_configs,
            eval: DirConfigEval::default(),
            evaluator,
            dir_check_cmd: dir_check,
            dir_check: None,
            events,
            fd_wait_loops,
            extra_dirs,
            control: Some(control),
        };

        supervisor.inform_fd_about_fsa_change().await;
        let eval = supervisor
            .evaluator
            .evaluate(&supervisor.dir_configs.paths())
            .context("Failed to evaluate DIR_CONFIG")?;
        apply_to_host_list(
            &mut hosts,
            &eval,
            &defaults,
            supervisor.config.remove_unused_hosts,
        );
        if hosts.is_empty() {
            supervisor.status.clear_amg_jobs(REREADING_DIR_CONFIG | FD_WAITING);
            log_amg_fatal!("Neither HOST_CONFIG nor DIR_CONFIG name a single host");
            bail!("No hosts configured");
        }

        let records: Vec<HostRecord> = hosts.iter().map(HostEntry::to_record).collect();
        let flags = FsaFlags {
            feature_flags,
            ignore_first_errors: supervisor.config.ignore_first_errors,
        };
        let created = Fsa::create(&supervisor.fifo_dir, &records, flags, None);
        supervisor
            .status
            .clear_amg_jobs(REREADING_DIR_CONFIG | FD_WAITING);
        supervisor.fsa = Some(created.context("Failed to create FSA")?);
        supervisor.hosts = hosts;
        supervisor.eval = eval;

        supervisor.host_config_mtime = Some(
            host_list::write(&host_config, &supervisor.hosts)
                .context("Failed to write HOST_CONFIG")?,
        );

        match clear_pool_dir(&supervisor.work.pool_dir()) {
            Ok(0) => {}
            Ok(removed) => log_amg_info!(removed, "Cleared pool directory"),
            Err(e) => log_amg_warn!(error = %e, "Failed to clear pool directory"),
        }

        if supervisor.eval.has_data() {
            supervisor.start_dir_check();
        } else {
            log_amg_warn!("DIR_CONFIG holds no directory with a destination, dir_check not started");
        }

        log_amg_info!(
            hosts = supervisor.hosts.len(),
            directories = supervisor.eval.directories,
            jobs = supervisor.eval.jobs,
            dir_configs = supervisor.dir_configs.files.len(),
            extra_work_dirs = supervisor.extra_dirs.len().saturating_sub(1),
            rescan_time = supervisor.config.rescan_time,
            max_shutdown_time = supervisor.config.max_shutdown_time,
            create_source_dir = supervisor.config.create_source_dir,
            "AMG started"
        );
        supervisor
            .events
            .log(EventClass::Global, EventType::Auto, EA_AMG_START, None);
        Ok(supervisor)
    }

    pub fn work(&self) -> &WorkDir {
        &self.work
    }

    pub fn hosts(&self) -> &[HostEntry] {
        &self.hosts
    }

    pub fn config(&self) -> &AmgConfig {
        &self.config
    }

    /// Wait for events until AMG is told to stop, then clean up. Cleanup
    /// also runs when the main loop fails.
    pub async fn run(mut self) -> Result<StopReason> {
        let outcome = self.serve().await;
        if let Err(e) = &outcome {
            log_amg_error!(error = %format!("{:#}", e), "Main loop failed, shutting down");
        }
        self.shutdown(outcome.as_ref().ok().copied()).await;
        outcome
    }

    async fn serve(&mut self) -> Result<StopReason> {
        let Some(ControlFifos {
            mut amg_cmd,
            mut db_update,
        }) = self.control.take()
        else {
            bail!("Control fifos are not open");
        };
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigquit = signal(SignalKind::quit())?;
        let mut sighup = signal(SignalKind::hangup())?;

        let mut ticker = tokio::time::interval(self.config.scan_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        let mut decoder = DbUpdateDecoder::new();
        let mut cmd_buf = [0u8; 64];
        let mut db_buf = [0u8; 1024];

        let reason = loop {
            tokio::select! {
                res = amg_cmd.read(&mut cmd_buf) => {
                    let n = res.context("Failed to read AMG command fifo")?;
                    if cmd_buf[..n].iter().any(|&b| b != 0) {
                        log_amg_info!("Received shutdown request");
                        break StopReason::Shutdown;
                    }
                }
                res = db_update.read(&mut db_buf) => {
                    let n = res.context("Failed to read DB update fifo")?;
                    let (requests, unknown) = decoder.feed(&db_buf[..n]);
                    for code in unknown {
                        log_amg_warn!(code, "Unknown DB update request, ignored");
                    }
                    for request in requests {
                        self.handle_db_update(request).await;
                    }
                }
                _ = sigint.recv() => break StopReason::Signal(libc::SIGINT),
                _ = sigterm.recv() => break StopReason::Signal(libc::SIGTERM),
                _ = sigquit.recv() => break StopReason::Signal(libc::SIGQUIT),
                _ = sighup.recv() => debug!("Ignoring SIGHUP"),
                _ = ticker.tick() => self.tick().await,
            }
        };

        Ok(reason)
    }

    async fn handle_db_update(&mut self, request: DbUpdateRequest) {
        match request {
            DbUpdateRequest::HostConfigUpdate => self.host_config_update(),
            DbUpdateRequest::DirConfigUpdate => {
                log_amg_info!("DIR_CONFIG_UPDATE is not implemented")
            }
            DbUpdateRequest::RereadHostConfig {
                reply_pid,
                verbosity,
            } => {
                let mut log = UpdateDbLog::open(&self.fifo_dir, reply_pid, verbosity);
                let result = self.reread_host_config(&mut log).await;
                let reply = HostConfigReply {
                    hc_result: result as i32,
                    hc_warnings: log.warnings(),
                };
                self.send_reply(reply_pid, &reply.to_bytes());
                self.events.log(
                    EventClass::Global,
                    EventType::External,
                    EA_REREAD_HOST_CONFIG,
                    Some(result.describe().1),
                );
            }
            DbUpdateRequest::RereadDirConfig {
                reply_pid,
                verbosity,
            } => {
                let mut log = UpdateDbLog::open(&self.fifo_dir, reply_pid, verbosity);
                let reply = self.reread_dir_config(&mut log).await;
                self.send_reply(reply_pid, &reply.to_bytes());
                let info = DirConfigResult::from_i32(reply.dc_result).map(|r| r.describe().1);
                self.events.log(
                    EventClass::Global,
                    EventType::External,
                    EA_REREAD_DIR_CONFIG,
                    info,
                );
            }
        }
    }

    /// Write a reply frame to the caller's fifo. A caller that has gone
    /// away is not an error.
    fn send_reply(&self, pid: i32, frame: &[u8]) {
        let path = reply_fifo_path(&self.fifo_dir, pid);
        let mut file = match OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&path)
        {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(pid, "Reply fifo gone, not replying");
                return;
            }
            Err(e) => {
                log_amg_error!(path = %path.display(), error = %e, "Failed to open reply fifo");
                return;
            }
        };
        if let Err(e) = file.write_all(frame) {
            log_amg_error!(path = %path.display(), error = %e, "Failed to write reply");
        }
    }

    /// Rewrite HOST_CONFIG from the live FSA, so edits made through the
    /// FSA survive a restart.
    fn host_config_update(&mut self) {
        let Some(fsa) = self.fsa.as_mut() else {
            log_amg_warn!("No FSA attached, cannot update HOST_CONFIG");
            return;
        };
        if let Err(e) = fsa.reattach_if_stale(WHO) {
            log_amg_error!(error = %e, "Failed to reattach FSA");
            return;
        }
        let mut entries = host_list::from_fsa(fsa);
        for entry in entries.iter_mut() {
            if let Some(known) = self.hosts.iter().find(|h| h.alias == entry.alias) {
                entry.protocol = known.protocol;
                entry.in_dir_config = known.in_dir_config;
            }
        }
        match host_list::write(&self.work.host_config(), &entries) {
            Ok(mtime) => self.host_config_mtime = Some(mtime),
            Err(e) => {
                log_amg_error!(error = %e, "Failed to write HOST_CONFIG");
                return;
            }
        }
        match fsa.bump_host_config_counter() {
            Ok(counter) => debug!(counter, "Bumped host config counter"),
            Err(e) => log_amg_warn!(error = %e, "Failed to bump host config counter"),
        }
        self.hosts = entries;
        self.notify_dir_check(CHECK_FSA_ENTRIES);
        log_amg_info!(hosts = self.hosts.len(), "Updated HOST_CONFIG from FSA");
    }

    /// Reread HOST_CONFIG if it changed since it was last read or written.
    async fn reread_host_config(&mut self, log: &mut UpdateDbLog) -> HostConfigResult {
        let path = self.work.host_config();
        let mtime = match std::fs::metadata(&path) {
            Ok(meta) => meta.modified().ok(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return match host_list::write(&path, &self.hosts) {
                    Ok(mtime) => {
                        self.host_config_mtime = Some(mtime);
                        log.warn("HOST_CONFIG was missing, recreated it from the current host list");
                        HostConfigResult::Recreated
                    }
                    Err(e) => {
                        log.log(Level::ERROR, &format!("Failed to recreate HOST_CONFIG: {}", e));
                        HostConfigResult::NoAccess
                    }
                };
            }
            Err(e) => {
                log.log(Level::ERROR, &format!("Cannot access {}: {}", path.display(), e));
                return HostConfigResult::NoAccess;
            }
        };
        if mtime.is_some() && mtime == self.host_config_mtime {
            log.info("There is no change in HOST_CONFIG");
            return HostConfigResult::NoChange;
        }

        let defaults = self.config.host_defaults;
        let parsed = match host_list::read(&path, &defaults) {
            Ok(p) => p,
            Err(e) => {
                log.log(Level::ERROR, &format!("Failed to read HOST_CONFIG: {}", e));
                return HostConfigResult::NoAccess;
            }
        };
        log.add_warnings(parsed.warnings);
        self.host_config_mtime = mtime;

        let mut entries = parsed.entries;
        let added = apply_to_host_list(
            &mut entries,
            &self.eval,
            &defaults,
            self.config.remove_unused_hosts,
        );
        let result = host_list::compare(&self.hosts, &entries);
        if !result.changed() {
            log.info("There is no change in HOST_CONFIG");
            return HostConfigResult::NoChange;
        }

        if let Err(e) = self.publish_hosts(entries).await {
            log.log(Level::ERROR, &format!("Failed to publish new host list: {:#}", e));
            return HostConfigResult::RestartFailed;
        }
        if added > 0 {
            log.info(&format!("Added {} host(s) referenced in DIR_CONFIG", added));
            self.rewrite_host_config();
        }
        self.notify_dir_check(CHECK_FSA_ENTRIES);
        log.info(result.describe().1);
        result
    }

    /// Reread DIR_CONFIG when any of its files changed or appeared.
    async fn reread_dir_config(&mut self, log: &mut UpdateDbLog) -> DirConfigReply {
        let mut reply = DirConfigReply {
            hc_result: HostConfigResult::NoChange as i32,
            hc_warnings: 0,
            dc_result: DirConfigResult::NoChange as i32,
            dc_warnings: 0,
        };
        let set = match DirConfigSet::enumerate(&self.work, &self.config.dir_config_names) {
            Ok(set) => set,
            Err(e) => {
                log.log(Level::ERROR, &format!("Failed to stat DIR_CONFIG: {}", e));
                reply.dc_result = DirConfigResult::AccessError as i32;
                reply.dc_warnings = log.warnings();
                return reply;
            }
        };
        if set.total_size() < MIN_DIR_CONFIG_SIZE {
            log.warn("DIR_CONFIG is empty, keeping the current configuration");
            reply.dc_result = DirConfigResult::Empty as i32;
            reply.dc_warnings = log.warnings();
            return reply;
        }
        if !set.changed_since(&self.dir_configs) {
            log.info("There is no change in DIR_CONFIG");
            return reply;
        }

        self.status.set_amg_jobs(REREADING_DIR_CONFIG);
        let hc_result = self.reread_host_config(log).await;
        reply.hc_result = hc_result as i32;
        reply.hc_warnings = log.warnings();

        let eval = match self.evaluator.evaluate(&set.paths()) {
            Ok(eval) => eval,
            Err(e) => {
                self.status.clear_amg_jobs(REREADING_DIR_CONFIG);
                log.log(Level::ERROR, &format!("Failed to read DIR_CONFIG: {}", e));
                reply.dc_result = DirConfigResult::AccessError as i32;
                reply.dc_warnings = log.warnings() - reply.hc_warnings;
                return reply;
            }
        };
        log.add_warnings(eval.warnings);
        self.dir_configs = set;

        let mut entries = self.hosts.clone();
        let added = apply_to_host_list(
            &mut entries,
            &eval,
            &self.config.host_defaults,
            self.config.remove_unused_hosts,
        );
        self.eval = eval;
        if entries != self.hosts {
            if let Err(e) = self.publish_hosts(entries).await {
                log.log(Level::ERROR, &format!("Failed to publish new host list: {:#}", e));
            } else if added > 0 {
                log.info(&format!("Added {} host(s) referenced in DIR_CONFIG", added));
                self.rewrite_host_config();
            }
        }

        let dc_result = if !self.eval.has_data() {
            log.warn("DIR_CONFIG holds no directory with a destination");
            self.stop_dir_check().await;
            DirConfigResult::NoValidData
        } else if self.restart_dir_check().await {
            DirConfigResult::Updated
        } else {
            DirConfigResult::UpdatedDcProblems
        };
        self.status.clear_amg_jobs(REREADING_DIR_CONFIG);

        log.info(&format!(
            "{} directories, {} jobs, {} hosts",
            self.eval.directories,
            self.eval.jobs,
            self.hosts.len()
        ));
        reply.dc_result = dc_result as i32;
        reply.dc_warnings = log.warnings() - reply.hc_warnings;
        reply
    }

    fn rewrite_host_config(&mut self) {
        match host_list::write(&self.work.host_config(), &self.hosts) {
            Ok(mtime) => self.host_config_mtime = Some(mtime),
            Err(e) => log_amg_error!(error = %e, "Failed to write HOST_CONFIG"),
        }
    }

    /// Publish `entries` as a new FSA generation.
    async fn publish_hosts(&mut self, entries: Vec<HostEntry>) -> Result<()> {
        let records: Vec<HostRecord> = entries.iter().map(HostEntry::to_record).collect();
        self.inform_fd_about_fsa_change().await;
        let previous = self.fsa.take();
        let flags = FsaFlags {
            feature_flags: previous.as_ref().map_or(0, |f| f.feature_flags()),
            ignore_first_errors: self.config.ignore_first_errors,
        };
        let created = Fsa::create(&self.fifo_dir, &records, flags, previous);
        self.status.clear_amg_jobs(FD_WAITING);
        match created {
            Ok(mut fsa) => {
                fsa.bump_host_config_counter()?;
                self.fsa = Some(fsa);
                self.hosts = entries;
                Ok(())
            }
            Err(e) => {
                self.fsa = Fsa::attach(&self.fifo_dir, WHO).ok();
                Err(e).context("Failed to create FSA")
            }
        }
    }

    /// Tell FD the FSA is about to change and wait until it holds still.
    async fn inform_fd_about_fsa_change(&self) {
        if self.status.fd_state() != PROC_ON {
            debug!("FD not running, changing FSA without waiting");
            return;
        }
        if let Err(e) = send_command(&self.fifo_dir.join(FD_CMD_FIFO), FSA_ABOUT_TO_CHANGE) {
            log_amg_debug!(error = %e, "Could not tell FD about FSA change");
            return;
        }
        for _ in 0..self.fd_wait_loops {
            if self.status.amg_jobs() & FD_WAITING != 0 {
                return;
            }
            tokio::time::sleep(FD_WAIT_STEP).await;
        }
        log_amg_debug!(
            waited_ms = u64::from(self.fd_wait_loops) * FD_WAIT_STEP.as_millis() as u64,
            "FD did not acknowledge FSA change, continuing"
        );
    }

    async fn tick(&mut self) {
        if !self.work.host_config().exists() {
            log_amg_info!("HOST_CONFIG is missing, recreating it");
            self.rewrite_host_config();
        }
        self.check_onetime();
        self.check_dir_check();
    }

    /// Hand every valid config in `etc/onetime` to dir_check.
    fn check_onetime(&mut self) {
        let dir = self.work.onetime_config_dir();
        let entries = match std::fs::read_dir(&dir) {
            Ok(e) => e,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return,
            Err(e) => {
                log_amg_warn!(path = %dir.display(), error = %e, "Failed to read onetime dir");
                return;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || !path.is_file() {
                continue;
            }
            match self.evaluator.evaluate(std::slice::from_ref(&path)) {
                Ok(eval) if eval.has_data() => {
                    let spool = self.work.onetime_spool_dir();
                    let moved = create_dir_mode(&spool, DIR_MODE)
                        .and_then(|_| std::fs::rename(&path, spool.join(&name)));
                    if let Err(e) = moved {
                        log_amg_error!(file = %name, error = %e, "Failed to spool onetime config");
                        continue;
                    }
                    self.notify_dir_check(ONETIME_CONFIG);
                    log_amg_info!(file = %name, jobs = eval.jobs, "Handed onetime config to dir_check");
                    self.events.log(
                        EventClass::Global,
                        EventType::External,
                        EA_ONETIME_CONFIG,
                        Some(&name),
                    );
                }
                Ok(_) => {
                    log_amg_warn!(file = %name, "Onetime config holds no usable data, removed");
                    remove_logged(&path);
                }
                Err(e) => {
                    log_amg_warn!(file = %name, error = %e, "Unreadable onetime config, removed");
                    remove_logged(&path);
                }
            }
        }
    }

    fn notify_dir_check(&self, code: u8) {
        if self.dir_check.is_none() {
            return;
        }
        match send_command(&self.fifo_dir.join(DC_CMD_FIFO), code) {
            Ok(()) => {}
            Err(FifoError::NotRunning(_)) => debug!(code, "dir_check not reading its fifo"),
            Err(e) => log_amg_warn!(code, error = %e, "Failed to send command to dir_check"),
        }
    }

    /// Reap an exited dir_check and start a new one while there is work.
    fn check_dir_check(&mut self) {
        if let Some(dc) = self.dir_check.as_mut() {
            match dc.try_reap() {
                Ok(Some(status)) => {
                    log_amg_warn!(pid = dc.pid(), %status, "dir_check exited");
                    self.dir_check = None;
                    self.clear_dir_check_pid();
                    self.set_dir_check_state(PROC_OFF);
                }
                Ok(None) => return,
                Err(e) => {
                    log_amg_warn!(error = %e, "Failed to check on dir_check");
                    return;
                }
            }
        }
        if self.dir_check_cmd.is_none() || !self.eval.has_data() {
            return;
        }
        if self.start_dir_check() {
            log_amg_info!("Restarted dir_check");
            self.events.log(
                EventClass::Global,
                EventType::Auto,
                EA_DIR_CHECK_RESTART,
                None,
            );
        }
    }

    fn start_dir_check(&mut self) -> bool {
        let Some(cmd) = self.dir_check_cmd.as_ref() else {
            return true;
        };
        match cmd.spawn() {
            Ok(dc) => {
                if let Err(e) = self.active.set_pid(DC_NO, dc.pid()) {
                    log_amg_warn!(error = %e, "Failed to record dir_check pid");
                }
                self.set_dir_check_state(PROC_ON);
                self.dir_check = Some(dc);
                true
            }
            Err(e) => {
                log_amg_error!(program = %cmd.program().display(), error = %e, "Failed to start dir_check");
                self.set_dir_check_state(PROC_OFF);
                false
            }
        }
    }

    async fn stop_dir_check(&mut self) {
        let Some(dc) = self.dir_check.take() else {
            return;
        };
        let pid = dc.pid();
        self.set_dir_check_state(PROC_SHUTDOWN);
        match dc.stop(&self.fifo_dir, self.config.max_shutdown_time).await {
            Ok(StopOutcome::Exited) => debug!(pid, "dir_check stopped"),
            Ok(StopOutcome::Killed) => log_amg_warn!(pid, "dir_check had to be killed"),
            Err(e) => log_amg_error!(pid, error = %e, "Failed to stop dir_check"),
        }
        self.clear_dir_check_pid();
        self.set_dir_check_state(PROC_STOPPED);
    }

    fn clear_dir_check_pid(&self) {
        if let Err(e) = self.active.set_pid(DC_NO, 0) {
            log_amg_warn!(error = %e, "Failed to clear dir_check pid");
        }
    }

    fn set_dir_check_state(&mut self, state: i8) {
        if let Err(e) = self.status.set_dir_check(state) {
            log_amg_warn!(state, error = %e, "Failed to record dir_check state");
        }
    }

    fn set_amg_state(&mut self, state: i8) {
        if let Err(e) = self.status.set_amg(state) {
            log_amg_warn!(state, error = %e, "Failed to record AMG state");
        }
    }

    async fn restart_dir_check(&mut self) -> bool {
        self.stop_dir_check().await;
        let started = self.start_dir_check();
        if started && self.dir_check.is_some() {
            self.events.log(
                EventClass::Global,
                EventType::Auto,
                EA_DIR_CHECK_RESTART,
                None,
            );
        }
        started
    }

    /// `None` when the main loop failed.
    async fn shutdown(mut self, reason: Option<StopReason>) {
        self.stop_dir_check().await;
        let stop_flag = reason == Some(StopReason::Shutdown);

        if let Some(counter) = self.counter.take() {
            let path = counter.path().to_path_buf();
            if let Err(e) = counter.close() {
                log_amg_warn!(error = %e, "Failed to close counter");
            }
            if !stop_flag {
                if let Err(e) = std::fs::remove_file(&path) {
                    debug!(path = %path.display(), error = %e, "Failed to remove counter file");
                }
            }
        }
        if let Some(fsa) = self.fsa.take() {
            if let Err(e) = fsa.detach() {
                log_amg_warn!(error = %e, "Failed to detach FSA");
            }
        }
        if let Err(e) = self.active.set_pid(AMG_NO, 0) {
            log_amg_warn!(error = %e, "Failed to clear AMG pid");
        }
        self.set_amg_state(PROC_STOPPED);
        self.events
            .log(EventClass::Global, EventType::Auto, EA_AMG_STOP, None);
        match reason {
            Some(StopReason::Shutdown) => log_amg_info!("AMG stopped"),
            Some(StopReason::Signal(signo)) => log_amg_info!(signo, "AMG stopped by signal"),
            None => log_amg_error!("AMG stopped after an error"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use afd_config::testing::TestEnvironment;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failed_main_loop_still_cleans_up() {
        let env = TestEnvironment::new().unwrap();
        env.write_afd_config("MAX_SHUTDOWN_TIME 5\n").unwrap();
        env.write_host_config("h1:1.2.3.4::::3:10:300:4096:10:-1:120:0:0:1:0:0:0:0:0:0:0\n")
            .unwrap();
        env.write_dir_config(
            "[directory] /data/in\n   [files]\n   *\n      [destination]\n         [recipient]\n         ftp://user:pw@h1/out\n",
        )
        .unwrap();
        let fifo = env.work.fifo_dir();
        let options = AmgOptions::new(env.work.clone())
            .with_dir_check(DirCheckCommand::new("sleep").arg("30"));
        let mut supervisor = Supervisor::start(options).await.unwrap();
        let dc_pid = supervisor.dir_check.as_ref().map(DirCheck::pid).unwrap();

        // Without its control fifos the main loop cannot serve.
        supervisor.control = None;
        assert!(supervisor.run().await.is_err());

        let active = AfdActive::open(&fifo).unwrap();
        assert_eq!(active.pid(AMG_NO).unwrap(), 0);
        assert_eq!(active.pid(DC_NO).unwrap(), 0);
        let status = AfdStatusMap::attach(&fifo, Duration::from_secs(1)).unwrap();
        assert_eq!(status.status().amg, PROC_STOPPED);
        assert_eq!(status.status().dir_check, PROC_STOPPED);
        assert_eq!(kill(Pid::from_raw(dc_pid), None), Err(Errno::ESRCH));
        // Not a regular stop, so the counter goes.
        assert!(!env.work.counter_file().exists());
    }
}
