//! Fixed-size message frames.
//!
//! Every frame is `HEADER_LEN + BODY_LEN` bytes: a 4-byte ASCII tag followed
//! by a pointer-width body in native byte order. Header-only messages still
//! occupy a full frame with a zero-filled body, so the reader never has to
//! branch on message kind to know how much to pull off the socket.

use std::io::{self, ErrorKind, Read, Write};

use crate::error::ProtocolError;

/// Length of the ASCII tag that opens every frame.
pub const HEADER_LEN: usize = 4;

/// Width of the frame body: one pointer of the protected program.
/// Fixed per build; a 32-bit monitor speaks 4-byte bodies.
pub const BODY_LEN: usize = std::mem::size_of::<usize>();

/// Total size of every frame on the wire.
pub const FRAME_LEN: usize = HEADER_LEN + BODY_LEN;

/// One wire message, either direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Message {
    /// Endpoint → monitor: a call is about to execute; the body is the
    /// address it will return to.
    Call(usize),
    /// Endpoint → monitor: a return is about to execute; the body is the
    /// address it targets. The endpoint must stall until [`Message::Continue`]
    /// comes back.
    Ret(usize),
    /// Monitor → endpoint: the previous return was accepted, proceed.
    Continue,
    /// Endpoint → monitor: a signal was just delivered.
    SignalDelivered,
    /// Endpoint → monitor: the process forked.
    Forked,
    /// Endpoint → monitor: a new thread started.
    ThreadStarted,
    /// Endpoint → monitor: the process image is about to be replaced.
    Exec,
}

impl Message {
    /// The 4-byte tag identifying this message kind on the wire.
    pub fn tag(&self) -> &'static [u8; HEADER_LEN] {
        match self {
            Message::Call(_) => b"CALL",
            Message::Ret(_) => b"RET-",
            Message::Continue => b"CONT",
            Message::SignalDelivered => b"NEWS",
            Message::Forked => b"FORK",
            Message::ThreadStarted => b"THRD",
            Message::Exec => b"EXEC",
        }
    }

    /// The frame body; zero for header-only messages.
    pub fn body(&self) -> usize {
        match self {
            Message::Call(addr) | Message::Ret(addr) => *addr,
            _ => 0,
        }
    }

    /// Encode into a full wire frame.
    pub fn encode(&self) -> [u8; FRAME_LEN] {
        let mut frame = [0u8; FRAME_LEN];
        frame[..HEADER_LEN].copy_from_slice(self.tag());
        frame[HEADER_LEN..].copy_from_slice(&self.body().to_ne_bytes());
        frame
    }

    /// Decode a full wire frame.
    ///
    /// The body bytes of header-only kinds are ignored, so any frame a
    /// conforming peer produced round-trips exactly.
    pub fn decode(frame: &[u8; FRAME_LEN]) -> Result<Message, ProtocolError> {
        let mut tag = [0u8; HEADER_LEN];
        tag.copy_from_slice(&frame[..HEADER_LEN]);
        let mut body = [0u8; BODY_LEN];
        body.copy_from_slice(&frame[HEADER_LEN..]);
        let body = usize::from_ne_bytes(body);

        match &tag {
            b"CALL" => Ok(Message::Call(body)),
            b"RET-" => Ok(Message::Ret(body)),
            b"CONT" => Ok(Message::Continue),
            b"NEWS" => Ok(Message::SignalDelivered),
            b"FORK" => Ok(Message::Forked),
            b"THRD" => Ok(Message::ThreadStarted),
            b"EXEC" => Ok(Message::Exec),
            _ => Err(ProtocolError::UnknownTag(tag)),
        }
    }
}

/// Read exactly one message, blocking until a whole frame has arrived.
///
/// Returns `Ok(None)` on a clean disconnect: the peer closed the connection
/// on a frame boundary. Closing mid-frame is a protocol error: an endpoint
/// that dies between bytes of a frame is indistinguishable from one whose
/// stream was tampered with.
pub fn read_message(reader: &mut impl Read) -> Result<Option<Message>, ProtocolError> {
    let mut frame = [0u8; FRAME_LEN];
    let mut filled = 0;
    while filled < FRAME_LEN {
        match reader.read(&mut frame[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(ProtocolError::TruncatedFrame { got: filled }),
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Message::decode(&frame).map(Some)
}

/// Write one message as a full frame.
pub fn write_message(writer: &mut impl Write, message: Message) -> io::Result<()> {
    writer.write_all(&message.encode())
}
