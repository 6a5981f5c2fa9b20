//! The shadow-stack state machine: records observed calls, vets observed
//! returns, and models signal handlers with a wildcard entry.

use log::debug;
use thiserror::Error;

use crate::stack::PageStack;

/// Stack entry marking entry into control flow the call graph did not
/// predict (a signal handler). It absorbs exactly one return without an
/// address check: the handler's own calls push and pop normally on top of
/// it, and the return that unwinds out of the handler consumes it.
///
/// All-ones is not a canonical return address on any supported target.
pub const WILDCARD: usize = usize::MAX;

/// A control-flow-integrity violation. Always fatal; the caller decides how
/// everything dies, the validator only reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Violation {
    #[error("attempting to return to {target:#x} with no recorded call sites")]
    EmptyStack { target: usize },

    #[error("attempting to return to {target:#x} but the expected call site is {expected:#x}")]
    Mismatch { target: usize, expected: usize },
}

/// One execution context's record of not-yet-returned call sites.
///
/// Owned by exactly one context (one connected process in out-of-process
/// mode, one thread in in-process mode) and never shared. A non-empty stack
/// at destruction is not an error; contexts may die mid-call-chain.
pub struct ShadowStack<const PROTECT: bool> {
    entries: PageStack<PROTECT>,
}

impl<const PROTECT: bool> ShadowStack<PROTECT> {
    pub fn new() -> std::io::Result<Self> {
        Ok(ShadowStack {
            entries: PageStack::new()?,
        })
    }

    /// A call is about to execute; expect a return to `ret_addr`.
    pub fn record_call(&mut self, ret_addr: usize) -> std::io::Result<()> {
        debug!("push({ret_addr:#x})");
        self.entries.push(ret_addr)
    }

    /// A signal was delivered; the next unmatched return may target anywhere.
    pub fn record_signal(&mut self) -> std::io::Result<()> {
        debug!("push(wildcard) for signal delivery");
        self.entries.push(WILDCARD)
    }

    /// Vet a return to `target` against the top of the stack.
    pub fn validate_return(&mut self, target: usize) -> Result<(), Violation> {
        if self.entries.is_empty() {
            return Err(Violation::EmptyStack { target });
        }

        let expected = self.entries.top();
        if expected == target {
            self.entries.pop();
            return Ok(());
        }

        // The call site beneath a wildcard was validated before the signal
        // arrived, so unwinding out of the handler is trusted wholesale.
        if expected == WILDCARD {
            debug!("wildcard consumed: returning out of a signal handler to {target:#x}");
            self.entries.pop();
            return Ok(());
        }

        Err(Violation::Mismatch { target, expected })
    }

    /// The image was replaced via exec: a fresh image has no call history.
    pub fn reset(&mut self) {
        debug!("shadow stack reset for exec");
        self.entries.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stack() -> ShadowStack<false> {
        ShadowStack::new().expect("mmap")
    }

    #[test]
    fn balanced_calls_and_returns_accept() {
        let mut ss = stack();
        let addrs = [0x1000, 0x2000, 0x3000, 0x4000];
        for &a in &addrs {
            ss.record_call(a).unwrap();
        }
        for &a in addrs.iter().rev() {
            assert_eq!(ss.validate_return(a), Ok(()));
        }
        assert!(ss.is_empty());
    }

    #[test]
    fn mismatched_return_is_a_violation() {
        let mut ss = stack();
        ss.record_call(0x1000).unwrap();
        assert_eq!(
            ss.validate_return(0x2000),
            Err(Violation::Mismatch {
                target: 0x2000,
                expected: 0x1000,
            })
        );
    }

    #[test]
    fn return_with_empty_stack_is_a_violation() {
        let mut ss = stack();
        assert_eq!(
            ss.validate_return(0x1000),
            Err(Violation::EmptyStack { target: 0x1000 })
        );
    }

    #[test]
    fn wildcard_absorbs_exactly_one_mismatch() {
        let mut ss = stack();
        ss.record_call(0x1000).unwrap();
        ss.record_signal().unwrap();

        // Returning out of the handler to an arbitrary address is fine...
        assert_eq!(ss.validate_return(0xdead_beef), Ok(()));
        // ...and the original call site is still intact beneath it.
        assert_eq!(ss.validate_return(0x1000), Ok(()));
        assert!(ss.is_empty());
    }

    #[test]
    fn handler_calls_nest_on_top_of_the_wildcard() {
        let mut ss = stack();
        ss.record_call(0x1000).unwrap();
        ss.record_signal().unwrap();

        // The handler makes its own calls, validated exactly.
        ss.record_call(0x8000).unwrap();
        assert_eq!(ss.validate_return(0x8000), Ok(()));

        // Then unwinds through the wildcard and the original frame.
        assert_eq!(ss.validate_return(0x7777), Ok(()));
        assert_eq!(ss.validate_return(0x1000), Ok(()));
    }

    #[test]
    fn exec_clears_history() {
        let mut ss = stack();
        ss.record_call(0x1000).unwrap();
        ss.reset();
        assert_eq!(
            ss.validate_return(0x1000),
            Err(Violation::EmptyStack { target: 0x1000 })
        );
    }

    #[test]
    fn violations_name_both_addresses() {
        let text = Violation::Mismatch {
            target: 0xbad,
            expected: 0x600d,
        }
        .to_string();
        assert!(text.contains("0xbad"));
        assert!(text.contains("0x600d"));

        let text = Violation::EmptyStack { target: 0xbad }.to_string();
        assert!(text.contains("0xbad"));
        assert!(text.contains("no recorded call sites"));
    }
}
