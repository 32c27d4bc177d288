//! The dir_check child: start, reap, restart and stop it.

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use afd_config::{log_amg_info, log_amg_warn, WorkDir};
use afd_ipc::client::send_command;
use afd_ipc::{FifoError, DC_CMD_FIFO, SHUTDOWN};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tracing::debug;

/// Interval between exit checks while waiting for dir_check to stop.
pub const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

/// How to launch dir_check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirCheckCommand {
    program: PathBuf,
    args: Vec<OsString>,
}

impl DirCheckCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// `<program> -w <work root>`
    pub fn for_work_dir(program: impl Into<PathBuf>, work: &WorkDir) -> Self {
        Self::new(program).arg("-w").arg(work.root())
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn spawn(&self) -> io::Result<DirCheck> {
        let child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .kill_on_drop(false)
            .spawn()?;
        let pid = child
            .id()
            .map(|p| p as i32)
            .ok_or_else(|| io::Error::other("dir_check exited before its pid was known"))?;
        debug!(pid, program = %self.program.display(), "Started dir_check");
        Ok(DirCheck { child, pid })
    }
}

/// How a stop request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Exited on its own after SHUTDOWN.
    Exited,
    /// Had to be killed.
    Killed,
}

/// A running dir_check.
#[derive(Debug)]
pub struct DirCheck {
    child: Child,
    pid: i32,
}

impl DirCheck {
    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// Reap the child if it has exited.
    pub fn try_reap(&mut self) -> io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    /// Ask dir_check to shut down, then kill it if it is still there after
    /// `polls` intervals of [`SHUTDOWN_POLL`].
    pub async fn stop(mut self, fifo_dir: &Path, polls: u32) -> io::Result<StopOutcome> {
        let fifo = fifo_dir.join(DC_CMD_FIFO);
        if let Err(first) = send_command(&fifo, SHUTDOWN) {
            debug!(error = %first, "SHUTDOWN to dir_check failed, retrying");
            tokio::time::sleep(SHUTDOWN_POLL).await;
            if let Err(e) = send_command(&fifo, SHUTDOWN) {
                match e {
                    FifoError::NotRunning(_) => {
                        debug!(pid = self.pid, "dir_check does not read its command fifo")
                    }
                    e => log_amg_warn!(pid = self.pid, error = %e, "Failed to send SHUTDOWN to dir_check"),
                }
                // Without the fifo the only way to ask is a signal.
                if let Err(e) = kill(Pid::from_raw(self.pid), Signal::SIGTERM) {
                    log_amg_warn!(pid = self.pid, error = %e, "Failed to send SIGTERM to dir_check");
                }
            }
        }

        let grace = SHUTDOWN_POLL * polls.max(1);
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => {
                let status = status?;
                debug!(pid = self.pid, ?status, "dir_check stopped");
                Ok(StopOutcome::Exited)
            }
            Err(_) => {
                log_amg_info!(pid = self.pid, "dir_check did not stop in time, killing it");
                self.child.kill().await?;
                Ok(StopOutcome::Killed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_spawn_and_reap() {
        let mut dc = DirCheckCommand::new("true").spawn().unwrap();
        assert!(dc.pid() > 0);
        let mut status = None;
        for _ in 0..50 {
            status = dc.try_reap().unwrap();
            if status.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(status.unwrap().success());
    }

    #[tokio::test]
    async fn test_stop_kills_unresponsive_child() {
        let temp = tempdir().unwrap();
        // `sh -c` ignoring TERM, with no command fifo: only SIGKILL ends it.
        let dc = DirCheckCommand::new("sh")
            .arg("-c")
            .arg("trap '' TERM; sleep 30")
            .spawn()
            .unwrap();
        let started = std::time::Instant::now();
        let outcome = dc.stop(temp.path(), 3).await.unwrap();
        assert_eq!(outcome, StopOutcome::Killed);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_stop_via_signal_fallback() {
        let temp = tempdir().unwrap();
        let dc = DirCheckCommand::new("sleep").arg("30").spawn().unwrap();
        let outcome = dc.stop(temp.path(), 20).await.unwrap();
        assert_eq!(outcome, StopOutcome::Exited);
    }

    #[test]
    fn test_for_work_dir_args() {
        let work = WorkDir::new("/srv/afd");
        let cmd = DirCheckCommand::for_work_dir("dir_check", &work);
        assert_eq!(cmd.program(), Path::new("dir_check"));
        assert_eq!(cmd.args, vec![OsString::from("-w"), OsString::from("/srv/afd")]);
    }
}
