//! Accept loop and per-connection session threads.

use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use log::info;

use retguard_core::{Group, LiveCounter, Terminate, TerminateGuard};

use crate::session::Session;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Accept connections forever, one blocking session thread each.
///
/// Only group termination ends this loop: the last endpoint's unregister,
/// a violation in some session, or a fatal signal.
pub fn serve(
    listener: UnixListener,
    counter: Arc<LiveCounter>,
    group: Arc<Group>,
    protect: bool,
) -> ! {
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let counter = counter.clone();
                let group = group.clone();
                thread::spawn(move || run_session(stream, &counter, group.as_ref(), protect));
            }
            Err(e) => group.terminate(&format!("accepting a connection failed: {e}"), true),
        }
    }
    unreachable!("incoming() never ends")
}

/// Drive one endpoint session from accept to disconnect.
///
/// The endpoint counts as live for exactly that window. Failures escalate to
/// group termination with the session's own failure text; the guard converts
/// a panic anywhere in the session machinery into the same termination.
pub(crate) fn run_session(
    stream: UnixStream,
    counter: &LiveCounter,
    group: &dyn Terminate,
    protect: bool,
) {
    let id = NEXT_SESSION_ID.fetch_add(1, Ordering::SeqCst);
    info!("session {id}: endpoint connected");

    let guard = TerminateGuard::new(group, "session ended abnormally");
    counter.register();

    let result = if protect {
        Session::<true>::new(id, stream).and_then(|mut s| s.run())
    } else {
        Session::<false>::new(id, stream).and_then(|mut s| s.run())
    };

    match result {
        Ok(()) => {
            guard.disarm();
            // Terminates the group with the normal-completion message if
            // this was the last live endpoint.
            counter.unregister();
        }
        Err(failure) => {
            group.terminate(&failure.to_string(), true);
            // Only reached under a test double.
            guard.disarm();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use retguard_protocol::{write_message, Message};

    use super::*;

    #[derive(Default)]
    struct Recording {
        calls: Mutex<Vec<(String, bool)>>,
    }

    impl Recording {
        fn calls(&self) -> Vec<(String, bool)> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl Terminate for Recording {
        fn terminate(&self, reason: &str, is_error: bool) {
            self.calls
                .lock()
                .unwrap()
                .push((reason.to_string(), is_error));
        }
    }

    #[test]
    fn last_disconnect_terminates_normally() {
        let recorder = Arc::new(Recording::default());
        let counter = LiveCounter::create(recorder.clone()).expect("counter");

        let (ours, theirs) = UnixStream::pair().expect("socketpair");
        drop(theirs); // immediate clean disconnect

        run_session(ours, &counter, recorder.as_ref(), false);

        let calls = recorder.calls();
        assert_eq!(calls.len(), 1);
        assert!(!calls[0].1, "counter drain is a normal completion");
    }

    #[test]
    fn disconnect_with_other_endpoints_live_is_silent() {
        let recorder = Arc::new(Recording::default());
        let counter = LiveCounter::create(recorder.clone()).expect("counter");
        counter.register(); // another endpoint elsewhere

        let (ours, theirs) = UnixStream::pair().expect("socketpair");
        drop(theirs);

        run_session(ours, &counter, recorder.as_ref(), false);

        assert!(recorder.calls().is_empty());
        assert_eq!(counter.value(), 1);
    }

    #[test]
    fn violation_escalates_with_the_session_failure_text() {
        let recorder = Arc::new(Recording::default());
        let counter = LiveCounter::create(recorder.clone()).expect("counter");

        let (ours, mut theirs) = UnixStream::pair().expect("socketpair");
        write_message(&mut theirs, Message::Call(0x1000)).unwrap();
        write_message(&mut theirs, Message::Ret(0x2000)).unwrap();

        run_session(ours, &counter, recorder.as_ref(), true);

        let calls = recorder.calls();
        assert_eq!(calls.len(), 1);
        let (reason, is_error) = &calls[0];
        assert!(*is_error);
        assert!(reason.contains("control-flow integrity violation"));
        assert!(reason.contains("0x2000"));
        assert!(reason.contains("0x1000"));
    }
}
