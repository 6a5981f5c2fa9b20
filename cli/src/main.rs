//! retguard: out-of-band return-address monitor.
//!
//! Runs a program as a child of a fresh process group, listens for
//! call/return events from its instrumentation, validates every return
//! against a shadow stack, and kills the entire group the moment a return
//! targets anywhere but the address its call pushed.

mod paths;
mod server;
mod session;
mod spawn;

use std::os::unix::net::UnixListener;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};

use retguard_core::group::ignore_sigpipe;
use retguard_core::{Group, LiveCounter};

#[derive(Parser)]
#[command(name = "retguard", version)]
#[command(
    about = "Run a program under out-of-band return-address validation; \
             the whole process group is killed on the first mismatch"
)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Seal each session's shadow stack read-only between updates
    #[arg(long)]
    protected: bool,

    /// Listening socket path [default: a fresh name under the temp directory]
    #[arg(long, value_name = "PATH")]
    socket: Option<PathBuf>,

    /// Program to run under the monitor, with its arguments
    #[arg(trailing_var_arg = true, required = true)]
    program: Vec<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    // The group exists before anything forks or threads; from then on every
    // otherwise-fatal signal cascades into group termination.
    let group = Arc::new(Group::new());
    group.setup();
    ignore_sigpipe().context("failed to ignore SIGPIPE")?;

    let counter = Arc::new(
        LiveCounter::create(group.clone()).context("live-endpoint counter setup failed")?,
    );

    let socket_path = cli.socket.unwrap_or_else(paths::socket_path);
    paths::check_addr_len(&socket_path)?;
    let listener = UnixListener::bind(&socket_path)
        .with_context(|| format!("failed to listen on {}", socket_path.display()))?;
    info!("listening on {}", socket_path.display());

    // From here on children exist: failures must bring the group down, not
    // just this process.
    let mut child = match spawn::spawn_target(&cli.program, &socket_path, counter.raw_fd()) {
        Ok(child) => child,
        Err(e) => group.terminate(&format!("{e:#}"), true),
    };

    {
        let counter = counter.clone();
        let group = group.clone();
        thread::spawn(move || {
            match child.wait() {
                Ok(status) => info!("target exited with {status}"),
                Err(e) => warn!("waiting on the target failed: {e}"),
            }
            // Endpoints may outlive the direct child (its own children keep
            // sessions open); only a drained counter means the workload is
            // done. An instrumentation-less target never registers at all
            // and lands here too.
            if counter.value() <= 0 {
                group.terminate("program exited", false);
            }
        });
    }

    server::serve(listener, counter, group, cli.protected)
}
