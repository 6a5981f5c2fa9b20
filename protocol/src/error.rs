use thiserror::Error;

use crate::frame::FRAME_LEN;

/// Errors raised while decoding or reading wire frames.
///
/// Every variant is fatal to the session that observes it: the protocol has
/// no recoverable malformations, only clean disconnects (which are not
/// errors and are reported out of band as `Ok(None)` by
/// [`read_message`](crate::frame::read_message)).
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unrecognized frame tag `{}`", .0.escape_ascii())]
    UnknownTag([u8; 4]),

    #[error("peer closed the connection mid-frame ({got}/{FRAME_LEN} bytes)")]
    TruncatedFrame { got: usize },

    #[error("socket read failed: {0}")]
    Io(#[from] std::io::Error),
}
