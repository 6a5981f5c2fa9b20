//! In-process validation mode: no socket round-trips, one shadow stack per
//! application thread.
//!
//! The validation rules are identical to the monitor's; only the transport
//! differs. Each thread owns its own [`ThreadValidator`] with no cross-thread
//! sharing, so no lock is needed. Unlike socketed sessions, in-process
//! validators do not register with the live-endpoint counter; the engine
//! observes its own threads exiting directly.

use std::cell::RefCell;
use std::io;
use std::sync::Arc;
use std::sync::OnceLock;

use log::debug;

use retguard_core::{ShadowStack, Terminate};

/// Which page-stack flavor backs the per-thread shadow stacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackMode {
    /// Plain writable pages. No mprotect cost per event.
    Plain,
    /// Pages sealed read-only between pushes.
    Guarded,
}

enum LocalStack {
    Plain(ShadowStack<false>),
    Guarded(ShadowStack<true>),
}

impl LocalStack {
    fn new(mode: StackMode) -> io::Result<LocalStack> {
        Ok(match mode {
            StackMode::Plain => LocalStack::Plain(ShadowStack::new()?),
            StackMode::Guarded => LocalStack::Guarded(ShadowStack::new()?),
        })
    }

    fn record_call(&mut self, ret_addr: usize) -> io::Result<()> {
        match self {
            LocalStack::Plain(s) => s.record_call(ret_addr),
            LocalStack::Guarded(s) => s.record_call(ret_addr),
        }
    }

    fn record_signal(&mut self) -> io::Result<()> {
        match self {
            LocalStack::Plain(s) => s.record_signal(),
            LocalStack::Guarded(s) => s.record_signal(),
        }
    }

    fn validate_return(&mut self, target: usize) -> Result<(), retguard_core::Violation> {
        match self {
            LocalStack::Plain(s) => s.validate_return(target),
            LocalStack::Guarded(s) => s.validate_return(target),
        }
    }

    fn reset(&mut self) {
        match self {
            LocalStack::Plain(s) => s.reset(),
            LocalStack::Guarded(s) => s.reset(),
        }
    }
}

/// One thread's validator. Create it when the thread starts (or use the
/// module-level hooks, which do so lazily) and let it drop with the thread;
/// a non-empty stack at thread exit is not an error.
pub struct ThreadValidator {
    stack: LocalStack,
    group: Arc<dyn Terminate>,
}

impl ThreadValidator {
    pub fn new(group: Arc<dyn Terminate>, mode: StackMode) -> io::Result<Self> {
        Ok(ThreadValidator {
            stack: LocalStack::new(mode)?,
            group,
        })
    }

    /// A call is about to execute on this thread.
    pub fn on_call(&mut self, ret_addr: usize) {
        if let Err(e) = self.stack.record_call(ret_addr) {
            self.group
                .terminate(&format!("shadow stack allocation failed: {e}"), true);
        }
    }

    /// A signal handler is being entered on this thread.
    pub fn on_signal(&mut self) {
        if let Err(e) = self.stack.record_signal() {
            self.group
                .terminate(&format!("shadow stack allocation failed: {e}"), true);
        }
    }

    /// A return is about to execute on this thread.
    pub fn on_ret(&mut self, target: usize) {
        if let Err(violation) = self.stack.validate_return(target) {
            self.group
                .terminate(&format!("control-flow integrity violation: {violation}"), true);
        }
    }

    /// The image is about to be replaced via exec.
    pub fn on_exec(&mut self) {
        self.stack.reset();
    }
}

static GROUP: OnceLock<Arc<dyn Terminate>> = OnceLock::new();
static MODE: OnceLock<StackMode> = OnceLock::new();

thread_local! {
    static VALIDATOR: RefCell<Option<ThreadValidator>> = const { RefCell::new(None) };
}

/// Install the group handle and stack mode for the module-level hooks.
/// Call once, before the engine starts reporting events.
pub fn install(group: Arc<dyn Terminate>, mode: StackMode) {
    let _ = GROUP.set(group);
    let _ = MODE.set(mode);
    debug!("in-process validation installed ({mode:?})");
}

fn with_validator(f: impl FnOnce(&mut ThreadValidator)) {
    VALIDATOR.with(|slot| {
        let mut slot = slot.borrow_mut();
        if slot.is_none() {
            let (Some(group), Some(mode)) = (GROUP.get(), MODE.get()) else {
                // An event arrived before install: validating nothing would
                // silently skip the integrity check, so fail loud instead.
                eprintln!("retguard: event reported before inproc::install; aborting");
                std::process::abort();
            };
            match ThreadValidator::new(group.clone(), *mode) {
                Ok(v) => *slot = Some(v),
                Err(e) => {
                    group.terminate(&format!("shadow stack allocation failed: {e}"), true);
                    return;
                }
            }
        }
        if let Some(v) = slot.as_mut() {
            f(v);
        }
    });
}

/// Per-thread hook: a call is about to execute.
pub fn on_call(ret_addr: usize) {
    with_validator(|v| v.on_call(ret_addr));
}

/// Per-thread hook: a return is about to execute.
pub fn on_ret(target: usize) {
    with_validator(|v| v.on_ret(target));
}

/// Per-thread hook: a signal handler is being entered.
pub fn on_signal() {
    with_validator(|v| v.on_signal());
}

/// Per-thread hook: the image is about to be replaced.
pub fn on_exec() {
    with_validator(|v| v.on_exec());
}
