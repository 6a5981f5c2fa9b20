//! Process-group lifecycle: group creation, signal remapping, and the
//! all-or-nothing kill switch.
//!
//! Everything descended from the monitor lives in one OS process group, and
//! the only failure mode is killing all of it. Termination must stay
//! reachable from signal handlers and from panicking scopes, so the latch
//! that makes it idempotent is process-wide state; the [`Group`] handle
//! itself is constructed once in `main` and passed down explicitly.

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};

use log::{error, info};

/// Highest signal number the remap loop tries to claim. Numbers the kernel
/// refuses (EINVAL) are skipped.
const SIGNAL_MAX: libc::c_int = 64;

/// Signals that keep their default dispositions: the kill/stop/continue
/// control set, the child-exit notification, and the notifications that are
/// routine rather than fatal.
const KEEP_DISPOSITION: &[libc::c_int] = &[
    libc::SIGKILL,
    libc::SIGSTOP,
    libc::SIGURG,
    libc::SIGCONT,
    libc::SIGCHLD,
    libc::SIGIO,
    libc::SIGWINCH,
];

/// The group kill switch as seen by components that may need to pull it.
///
/// The production implementation ([`Group`]) never returns control; test
/// doubles record the call and do.
pub trait Terminate: Send + Sync {
    fn terminate(&self, reason: &str, is_error: bool);
}

/// Which branch a termination request takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationPath {
    /// First request: flush, report, then kill.
    Orderly,
    /// Termination re-entered itself (or ran twice): skip straight to the
    /// unconditional kill, never re-run cleanup.
    Immediate,
}

/// One-way latch deciding between the orderly and immediate branches.
pub struct TerminationLatch(AtomicBool);

impl TerminationLatch {
    pub const fn new() -> Self {
        TerminationLatch(AtomicBool::new(false))
    }

    pub fn begin(&self) -> TerminationPath {
        if self.0.swap(true, Ordering::SeqCst) {
            TerminationPath::Immediate
        } else {
            TerminationPath::Orderly
        }
    }
}

static LATCH: TerminationLatch = TerminationLatch::new();

/// The single process-group controller, created once at monitor startup.
pub struct Group {
    set_up: AtomicBool,
}

impl Group {
    pub fn new() -> Self {
        Group {
            set_up: AtomicBool::new(false),
        }
    }

    /// Put this process at the head of a fresh session/process group and
    /// remap almost every signal to the group kill switch, so an
    /// otherwise-fatal signal anywhere cascades into group termination
    /// instead of silently dropping one process.
    ///
    /// Must run before anything forks or spawns threads. A second call is a
    /// caller bug and terminates; so does any failure along the way. Setup
    /// either completes or the process dies.
    pub fn setup(&self) {
        if self.set_up.swap(true, Ordering::SeqCst) {
            self.terminate("process group set up twice", true);
        }
        let guard = TerminateGuard::new(self, "process group setup left incomplete");

        // SAFETY: no preconditions. Fails only if we already lead a group,
        // which is an acceptable group to keep.
        if unsafe { libc::setsid() } == -1 {
            info!(
                "setsid failed ({}); keeping the current process group",
                io::Error::last_os_error()
            );
        }
        // SAFETY: no preconditions.
        info!("monitoring process group {}", unsafe { libc::getpgrp() });

        if let Err(e) = remap_signal_handlers() {
            self.terminate(&format!("remapping signal handlers failed: {e}"), true);
        }
        info!("signal handlers remapped to the group kill switch");

        guard.disarm();
    }

    pub fn is_set_up(&self) -> bool {
        self.set_up.load(Ordering::SeqCst)
    }

    /// Report `reason` and kill the whole group.
    ///
    /// Idempotent via the latch: the first caller takes the orderly path
    /// (report, flush, kill); if termination is entered again, e.g.
    /// because the orderly path itself faulted, the second entry performs an
    /// unconditional kill with no further cleanup.
    ///
    /// In a process where [`setup`](Group::setup) never ran (a lightweight
    /// instrumentation-side endpoint), only the current process is killed:
    /// an instrumented worker must not take down processes it does not own.
    pub fn terminate(&self, reason: &str, is_error: bool) -> ! {
        if LATCH.begin() == TerminationPath::Immediate {
            kill_group_now();
        }

        if is_error {
            error!("{reason}");
            eprintln!("retguard: {reason}");
        } else {
            info!("{reason}");
            println!("retguard: {reason}");
        }
        let _ = io::stdout().flush();
        let _ = io::stderr().flush();

        if self.is_set_up() {
            kill_group_now()
        } else {
            kill_self_now()
        }
    }
}

impl Default for Group {
    fn default() -> Self {
        Group::new()
    }
}

impl Terminate for Group {
    fn terminate(&self, reason: &str, is_error: bool) {
        Group::terminate(self, reason, is_error)
    }
}

/// Scope guard that terminates the group on drop unless disarmed.
///
/// Wrap any sequence that must not be left half-done; call
/// [`disarm`](TerminateGuard::disarm) once the scope has completed. This
/// turns a forgotten error path into a guaranteed-safe default.
pub struct TerminateGuard<'a> {
    group: &'a dyn Terminate,
    reason: &'static str,
    armed: bool,
}

impl<'a> TerminateGuard<'a> {
    pub fn new(group: &'a dyn Terminate, reason: &'static str) -> Self {
        TerminateGuard {
            group,
            reason,
            armed: true,
        }
    }

    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for TerminateGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.group.terminate(self.reason, true);
        }
    }
}

/// SIGKILL the entire process group, then wait for our own delivery.
fn kill_group_now() -> ! {
    // SAFETY: killpg(0) signals the caller's own process group.
    unsafe { libc::killpg(0, libc::SIGKILL) };
    // The kernel may schedule us once more before the signal lands.
    loop {
        // SAFETY: pause only waits for signal delivery.
        unsafe { libc::pause() };
    }
}

/// SIGKILL only the current process.
fn kill_self_now() -> ! {
    // SAFETY: signalling our own pid.
    unsafe { libc::kill(libc::getpid(), libc::SIGKILL) };
    loop {
        // SAFETY: pause only waits for signal delivery.
        unsafe { libc::pause() };
    }
}

extern "C" fn fatal_signal_handler(_sig: libc::c_int) {
    // Async-signal-safe only: write(2), then the kill.
    const MSG: &[u8] = b"\nretguard: fatal signal caught, terminating process group\n";
    unsafe {
        libc::write(
            libc::STDERR_FILENO,
            MSG.as_ptr() as *const libc::c_void,
            MSG.len(),
        );
    }
    kill_group_now();
}

fn remap_signal_handlers() -> io::Result<()> {
    for sig in 1..=SIGNAL_MAX {
        if KEEP_DISPOSITION.contains(&sig) {
            continue;
        }
        let handler = fatal_signal_handler as *const () as libc::sighandler_t;
        // SAFETY: the handler only performs async-signal-safe work.
        let prev = unsafe { libc::signal(sig, handler) };
        if prev == libc::SIG_ERR {
            let err = io::Error::last_os_error();
            // Reserved and real-time-adjacent numbers refuse remapping.
            if err.raw_os_error() != Some(libc::EINVAL) {
                return Err(err);
            }
        }
    }
    Ok(())
}

/// Ignore SIGPIPE: every socket write's return value is checked, and a dead
/// peer must surface as an error on the session that owns it, not kill the
/// monitor. SIGCHLD keeps its default disposition so the child watcher can
/// still `wait()`.
pub fn ignore_sigpipe() -> io::Result<()> {
    // SAFETY: SIG_IGN is always a valid disposition for SIGPIPE.
    if unsafe { libc::signal(libc::SIGPIPE, libc::SIG_IGN) } == libc::SIG_ERR {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
