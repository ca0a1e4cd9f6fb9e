use nix::sys::signal::{SigHandler, SigSet, SigmaskHow, Signal, signal, sigprocmask};

/// Reset signal state that `exec` would otherwise pass on to the child.
///
/// Handled signals are reset by `exec` itself, ignored ones are not.
/// Rust programs ignore SIGPIPE, so without this a pipeline producer
/// would see `EPIPE` instead of dying when its consumer goes away.
///
/// Runs in the child between `fork` and `exec`; the calls are plain
/// `sigaction`/`sigprocmask` wrappers.
pub fn restore_default() -> Result<(), nix::errno::Errno> {
    unsafe {
        signal(Signal::SIGPIPE, SigHandler::SigDfl)?;
    }
    sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None)
}
