//! Spawn the target program inside the monitored group.

use std::path::Path;
use std::process::{Child, Command};

use anyhow::{Context, Result};
use log::info;

use retguard_protocol::env::{COUNTER_FD_ENV, SOCKET_PATH_ENV};

/// Start the target with the monitor's environment contract in place.
///
/// The child inherits the monitor's process group, so group termination
/// reaches it and everything it spawns; the counter fd is inherited because
/// it was opened without close-on-exec.
pub fn spawn_target(
    program: &[String],
    socket_path: &Path,
    counter_fd: libc::c_int,
) -> Result<Child> {
    let (cmd, args) = program.split_first().context("no target command given")?;

    info!("starting target: {}", program.join(" "));
    let child = Command::new(cmd)
        .args(args)
        .env(SOCKET_PATH_ENV, socket_path)
        .env(COUNTER_FD_ENV, counter_fd.to_string())
        .spawn()
        .with_context(|| format!("failed to start `{cmd}`"))?;

    info!("target running with pid {}", child.id());
    Ok(child)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_sees_the_session_environment() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("monitor.sock");

        let program = vec![
            "sh".to_string(),
            "-c".to_string(),
            format!(
                "test \"${SOCKET_PATH_ENV}\" = '{}' && test \"${COUNTER_FD_ENV}\" = 7",
                sock.display()
            ),
        ];

        let mut child = spawn_target(&program, &sock, 7).expect("spawn");
        assert!(child.wait().expect("wait").success());
    }

    #[test]
    fn empty_command_is_rejected() {
        let err = spawn_target(&[], Path::new("/tmp/x.sock"), 3).unwrap_err();
        assert!(err.to_string().contains("no target command"));
    }
}
