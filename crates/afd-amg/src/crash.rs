//! SIGSEGV/SIGBUS: leave a FATAL line in the system log, then abort so
//! init sees the process die and restarts it.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::OnceLock;

use afd_config::logging::format_system_line;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

static LOG_FD: AtomicI32 = AtomicI32::new(-1);
static LINES: OnceLock<CrashLines> = OnceLock::new();

struct CrashLines {
    segv: Vec<u8>,
    bus: Vec<u8>,
}

extern "C" fn on_crash(signo: libc::c_int) {
    let fd = LOG_FD.load(Ordering::Relaxed);
    if let (true, Some(lines)) = (fd >= 0, LINES.get()) {
        let line = if signo == libc::SIGBUS {
            &lines.bus
        } else {
            &lines.segv
        };
        // SAFETY: write(2) is async-signal-safe and the buffer is static.
        unsafe {
            libc::write(fd, line.as_ptr().cast(), line.len());
        }
    }
    // SAFETY: abort(3) is async-signal-safe.
    unsafe { libc::abort() }
}

/// Install the handlers. `log_fd` is the system-log FIFO, or `None` when it
/// could not be opened; the handlers then only abort.
pub fn install(log_fd: Option<RawFd>) -> nix::Result<()> {
    let now = chrono::Local::now();
    let _ = LINES.set(CrashLines {
        segv: format_system_line(now, 'F', "Received SIGSEGV, aborting", None).into_bytes(),
        bus: format_system_line(now, 'F', "Received SIGBUS, aborting", None).into_bytes(),
    });
    LOG_FD.store(log_fd.unwrap_or(-1), Ordering::Relaxed);

    let action = SigAction::new(
        SigHandler::Handler(on_crash),
        SaFlags::SA_RESETHAND,
        SigSet::empty(),
    );
    // SAFETY: the handler only touches atomics, a set-once buffer and
    // async-signal-safe libc calls.
    unsafe {
        sigaction(Signal::SIGSEGV, &action)?;
        sigaction(Signal::SIGBUS, &action)?;
    }
    Ok(())
}
