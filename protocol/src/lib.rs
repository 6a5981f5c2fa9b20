//! Wire protocol shared between the retguard monitor and instrumented endpoints.

pub mod env;
pub mod error;
pub mod frame;

pub use error::*;
pub use frame::*;
