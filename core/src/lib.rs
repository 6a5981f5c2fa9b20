//! Engine-independent machinery of the retguard monitor: the page-backed
//! protected stack, the shadow-stack validator, the process-group kill
//! switch, and the cross-process live-endpoint counter.

pub mod counter;
pub mod group;
pub mod stack;
pub mod validator;

pub use counter::LiveCounter;
pub use group::{Group, Terminate, TerminateGuard};
pub use stack::{GuardedStack, PageStack, PlainStack};
pub use validator::{ShadowStack, Violation, WILDCARD};
