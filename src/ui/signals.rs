//! Close-request signals
//!
//! SIGHUP, SIGTERM and SIGINT only set a flag; the surface turns it into a
//! close request on its next poll.

use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

static CLOSE_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_close(_: libc::c_int) {
    CLOSE_REQUESTED.store(true, Ordering::Release);
}

/// Install the handlers for the whole process
pub fn install() -> nix::Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(handle_close),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    for signal in [Signal::SIGHUP, Signal::SIGTERM, Signal::SIGINT] {
        // SAFETY: the handler only stores to an atomic, which is
        // async-signal-safe.
        unsafe { sigaction(signal, &action) }?;
    }
    Ok(())
}

/// Consume a pending close request
pub fn take_close_request() -> bool {
    CLOSE_REQUESTED.swap(false, Ordering::AcqRel)
}
