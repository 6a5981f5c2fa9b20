//! One validated connection: frame in, state transition, acknowledgement out.

use std::io;
use std::os::unix::net::UnixStream;

use log::{debug, info};
use thiserror::Error;

use retguard_core::{ShadowStack, Violation};
use retguard_protocol::{read_message, write_message, Message, ProtocolError};

/// A session failure. Every variant ends in group termination; the session
/// itself only reports.
#[derive(Debug, Error)]
pub enum SessionFailure {
    #[error("control-flow integrity violation: {0}")]
    Violation(#[from] Violation),

    #[error("protocol breach: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("endpoint sent CONT; that frame flows monitor-to-endpoint only")]
    BackwardsContinue,

    #[error("session resource failure: {0}")]
    Resource(#[from] io::Error),
}

/// The pairing of one accepted connection with one shadow stack.
pub struct Session<const PROTECT: bool> {
    id: u64,
    stream: UnixStream,
    stack: ShadowStack<PROTECT>,
}

impl<const PROTECT: bool> Session<PROTECT> {
    pub fn new(id: u64, stream: UnixStream) -> Result<Self, SessionFailure> {
        Ok(Session {
            id,
            stream,
            stack: ShadowStack::new()?,
        })
    }

    /// Drive the session until the endpoint disconnects cleanly (`Ok`) or
    /// something fatal happens (`Err`).
    ///
    /// The loop is strictly half-duplex per return: `CONT` is written only
    /// after the return's state transition has been applied, and the
    /// endpoint stalls on that acknowledgement, which is what gives the
    /// monitor veto power over the real return.
    pub fn run(&mut self) -> Result<(), SessionFailure> {
        loop {
            let Some(message) = read_message(&mut self.stream)? else {
                info!("session {}: endpoint disconnected", self.id);
                return Ok(());
            };

            match message {
                Message::Call(ret_addr) => self.stack.record_call(ret_addr)?,
                Message::Ret(target) => {
                    self.stack.validate_return(target)?;
                    write_message(&mut self.stream, Message::Continue)?;
                }
                Message::SignalDelivered => self.stack.record_signal()?,
                Message::Exec => {
                    debug!("session {}: image replaced, discarding call history", self.id);
                    self.stack.reset();
                }
                Message::Forked => {
                    // The child registers through its own connection.
                    debug!("session {}: endpoint forked", self.id);
                }
                Message::ThreadStarted => {
                    debug!("session {}: endpoint started a thread", self.id);
                }
                Message::Continue => return Err(SessionFailure::BackwardsContinue),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::thread;

    use retguard_protocol::FRAME_LEN;

    use super::*;

    fn harness() -> (Session<false>, UnixStream) {
        let (ours, theirs) = UnixStream::pair().expect("socketpair");
        (Session::new(1, ours).expect("session"), theirs)
    }

    fn send(peer: &mut UnixStream, message: Message) {
        write_message(peer, message).expect("send");
    }

    fn expect_cont(peer: &mut UnixStream) {
        let reply = read_message(peer).expect("read").expect("closed");
        assert_eq!(reply, Message::Continue);
    }

    #[test]
    fn balanced_traffic_is_acknowledged_and_ends_cleanly() {
        let (mut session, mut peer) = harness();

        let client = thread::spawn(move || {
            send(&mut peer, Message::Call(0x1000));
            send(&mut peer, Message::Call(0x2000));
            send(&mut peer, Message::Ret(0x2000));
            expect_cont(&mut peer);
            send(&mut peer, Message::Ret(0x1000));
            expect_cont(&mut peer);
            // Drop closes the socket on a frame boundary.
        });

        assert!(session.run().is_ok());
        client.join().unwrap();
    }

    #[test]
    fn cont_is_only_sent_after_the_transition_is_applied() {
        let (mut session, mut peer) = harness();

        let client = thread::spawn(move || {
            send(&mut peer, Message::Call(0xaaaa));
            send(&mut peer, Message::Ret(0xaaaa));
            expect_cont(&mut peer);
            // The pop already happened by the time CONT arrived: a second
            // return to the same target must now be an empty-stack violation.
            send(&mut peer, Message::Ret(0xaaaa));
            // No CONT for a rejected return.
            assert!(matches!(read_message(&mut peer), Ok(None) | Err(_)));
        });

        match session.run() {
            Err(SessionFailure::Violation(Violation::EmptyStack { target })) => {
                assert_eq!(target, 0xaaaa)
            }
            other => panic!("expected empty-stack violation, got {other:?}"),
        }
        drop(session);
        client.join().unwrap();
    }

    #[test]
    fn mismatched_return_fails_the_session() {
        let (mut session, mut peer) = harness();

        send(&mut peer, Message::Call(0x1000));
        send(&mut peer, Message::Ret(0x2000));

        match session.run() {
            Err(SessionFailure::Violation(Violation::Mismatch { target, expected })) => {
                assert_eq!(target, 0x2000);
                assert_eq!(expected, 0x1000);
            }
            other => panic!("expected mismatch violation, got {other:?}"),
        }
    }

    #[test]
    fn wildcard_flow_spans_a_signal_handler() {
        let (mut session, mut peer) = harness();

        let client = thread::spawn(move || {
            send(&mut peer, Message::Call(0x1000));
            send(&mut peer, Message::SignalDelivered);
            send(&mut peer, Message::Call(0x8000));
            send(&mut peer, Message::Ret(0x8000));
            expect_cont(&mut peer);
            send(&mut peer, Message::Ret(0x4444)); // consumes the wildcard
            expect_cont(&mut peer);
            send(&mut peer, Message::Ret(0x1000));
            expect_cont(&mut peer);
        });

        assert!(session.run().is_ok());
        client.join().unwrap();
    }

    #[test]
    fn exec_resets_history_within_the_session() {
        let (mut session, mut peer) = harness();

        send(&mut peer, Message::Call(0x1000));
        send(&mut peer, Message::Exec);
        send(&mut peer, Message::Ret(0x1000));

        match session.run() {
            Err(SessionFailure::Violation(Violation::EmptyStack { .. })) => {}
            other => panic!("expected empty-stack violation after exec, got {other:?}"),
        }
    }

    #[test]
    fn partial_frame_is_a_protocol_breach() {
        let (mut session, mut peer) = harness();

        let frame = Message::Call(0x1234).encode();
        peer.write_all(&frame[..FRAME_LEN - 2]).unwrap();
        drop(peer);

        match session.run() {
            Err(SessionFailure::Protocol(ProtocolError::TruncatedFrame { got })) => {
                assert_eq!(got, FRAME_LEN - 2)
            }
            other => panic!("expected truncated-frame breach, got {other:?}"),
        }
    }

    #[test]
    fn unknown_tag_is_a_protocol_breach() {
        let (mut session, mut peer) = harness();

        let mut frame = Message::Call(0).encode();
        frame[..4].copy_from_slice(b"WAT?");
        peer.write_all(&frame).unwrap();

        match session.run() {
            Err(SessionFailure::Protocol(ProtocolError::UnknownTag(tag))) => {
                assert_eq!(&tag, b"WAT?")
            }
            other => panic!("expected unknown-tag breach, got {other:?}"),
        }
    }

    #[test]
    fn client_sent_cont_is_a_protocol_breach() {
        let (mut session, mut peer) = harness();
        send(&mut peer, Message::Continue);
        assert!(matches!(
            session.run(),
            Err(SessionFailure::BackwardsContinue)
        ));
    }

    #[test]
    fn fork_and_thread_events_do_not_disturb_the_stack() {
        let (mut session, mut peer) = harness();

        let client = thread::spawn(move || {
            send(&mut peer, Message::Call(0x1000));
            send(&mut peer, Message::Forked);
            send(&mut peer, Message::ThreadStarted);
            send(&mut peer, Message::Ret(0x1000));
            expect_cont(&mut peer);
        });

        assert!(session.run().is_ok());
        client.join().unwrap();
    }
}
