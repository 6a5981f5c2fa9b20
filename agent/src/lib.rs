//! Endpoint-side library linked by the instrumentation engine.
//!
//! The engine rewrites the target's machine code and reports the resulting
//! call/return/signal/fork/thread/exec events through this crate: either to
//! the out-of-process monitor over a Unix socket ([`Endpoint`]) or to a
//! per-thread in-process validator ([`inproc`]).

pub mod endpoint;
pub mod inproc;

pub use endpoint::{Endpoint, EndpointError};
pub use inproc::{StackMode, ThreadValidator};
pub use retguard_core::{Group, LiveCounter, Terminate};
