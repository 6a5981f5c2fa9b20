//! Environment variable names making up the monitor/endpoint contract.
//!
//! Centralized here so the monitor and the endpoint library cannot drift.

/// Path of the monitor's listening socket, set for the spawned target.
pub const SOCKET_PATH_ENV: &str = "RETGUARD_SOCKET";

/// File descriptor of an already-connected session socket. An endpoint
/// exports this before exec so the fresh image reuses the same session
/// instead of reconnecting.
pub const SOCKET_FD_ENV: &str = "RETGUARD_SOCKET_FD";

/// File descriptor of the shared live-endpoint counter mapping, inherited
/// by every process in the monitored group.
pub const COUNTER_FD_ENV: &str = "RETGUARD_COUNTER_FD";
