//! The out-of-process endpoint: one validated socket session with the
//! monitor.
//!
//! The protocol is half-duplex per return: [`Endpoint::ret`] does not come
//! back until the monitor's `CONT` frame arrives, so an engine that reports
//! a return before letting it execute gives the monitor veto power over it.

use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::Path;

use log::{debug, info};
use thiserror::Error;

use retguard_protocol::env::{SOCKET_FD_ENV, SOCKET_PATH_ENV};
use retguard_protocol::{read_message, write_message, Message, ProtocolError};

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("connecting to the monitor failed: {0}")]
    Connect(#[source] std::io::Error),

    #[error("{0} is not set; this process is not inside a retguard session")]
    MissingEnv(&'static str),

    #[error("{SOCKET_FD_ENV} does not hold a file descriptor: `{0}`")]
    BadInheritedFd(String),

    #[error("sending an event to the monitor failed: {0}")]
    Send(#[source] std::io::Error),

    #[error("reading the return acknowledgement failed: {0}")]
    Ack(#[from] ProtocolError),

    #[error("monitor answered a pending return with {got:?} instead of CONT")]
    UnexpectedReply { got: Message },

    #[error("monitor closed the session while a return was pending")]
    Disconnected,

    #[error("exporting the session across exec failed: {0}")]
    ExecHandoff(#[source] std::io::Error),
}

/// A connected endpoint session.
pub struct Endpoint {
    stream: UnixStream,
}

impl Endpoint {
    /// Dial the monitor's listening socket.
    pub fn connect(path: &Path) -> Result<Self, EndpointError> {
        let stream = UnixStream::connect(path).map_err(EndpointError::Connect)?;
        info!("connected to monitor at {}", path.display());
        Ok(Endpoint { stream })
    }

    /// Establish the session from the environment the monitor set up: adopt
    /// the connected fd a previous image exported before exec, or dial the
    /// advertised socket path.
    pub fn connect_from_env() -> Result<Self, EndpointError> {
        if let Ok(value) = std::env::var(SOCKET_FD_ENV) {
            let fd: RawFd = value
                .parse()
                .map_err(|_| EndpointError::BadInheritedFd(value))?;
            debug!("resuming session on inherited fd {fd}");
            // SAFETY: the fd was exported by prepare_exec in the previous
            // image and is owned by nothing else in this one.
            let stream = unsafe { UnixStream::from_raw_fd(fd) };
            return Ok(Endpoint { stream });
        }

        let path = std::env::var_os(SOCKET_PATH_ENV)
            .ok_or(EndpointError::MissingEnv(SOCKET_PATH_ENV))?;
        Self::connect(Path::new(&path))
    }

    /// Wrap an already-connected stream (engines that own their transport,
    /// and tests).
    pub fn from_stream(stream: UnixStream) -> Self {
        Endpoint { stream }
    }

    /// A call is about to execute and will return to `ret_addr`.
    pub fn call(&mut self, ret_addr: usize) -> Result<(), EndpointError> {
        self.send(Message::Call(ret_addr))
    }

    /// A return to `target` is about to execute. Blocks until the monitor
    /// acknowledges; the engine must not let the real return run before
    /// this comes back.
    pub fn ret(&mut self, target: usize) -> Result<(), EndpointError> {
        self.send(Message::Ret(target))?;
        match read_message(&mut self.stream)? {
            Some(Message::Continue) => Ok(()),
            Some(got) => Err(EndpointError::UnexpectedReply { got }),
            None => Err(EndpointError::Disconnected),
        }
    }

    /// A signal was just delivered to this endpoint.
    pub fn signal_delivered(&mut self) -> Result<(), EndpointError> {
        self.send(Message::SignalDelivered)
    }

    /// The process forked. The child must establish its own session and
    /// counter registration; nothing is inherited for validation purposes.
    pub fn forked(&mut self) -> Result<(), EndpointError> {
        self.send(Message::Forked)
    }

    /// A new thread started.
    pub fn thread_started(&mut self) -> Result<(), EndpointError> {
        self.send(Message::ThreadStarted)
    }

    /// The process is about to replace its image via exec: tell the monitor
    /// to discard this session's call history, then arrange for the socket
    /// to survive into the next image (clear close-on-exec, export the fd
    /// number) so it resumes the same session instead of reconnecting.
    pub fn prepare_exec(&mut self) -> Result<(), EndpointError> {
        self.send(Message::Exec)?;

        let fd = self.stream.as_raw_fd();
        clear_cloexec(fd).map_err(EndpointError::ExecHandoff)?;
        std::env::set_var(SOCKET_FD_ENV, fd.to_string());
        debug!("session fd {fd} exported for exec");
        Ok(())
    }

    fn send(&mut self, message: Message) -> Result<(), EndpointError> {
        write_message(&mut self.stream, message).map_err(EndpointError::Send)
    }
}

fn clear_cloexec(fd: RawFd) -> std::io::Result<()> {
    // SAFETY: querying and updating descriptor flags on an fd we own.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags == -1 {
            return Err(std::io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) == -1 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}
