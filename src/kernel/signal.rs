use log::info;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
/// Async-safe termination signal handling for the session controller.
///
/// The handler only stores atomics. The controller's wait loop polls them,
/// forwards the signal to the shell, and still runs teardown.
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

/// Set once any caught signal arrives
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Last signal received, 0 if none or already taken
static SIGNAL_RECEIVED: AtomicI32 = AtomicI32::new(0);

/// Signals that would otherwise kill the controller before teardown
pub const CAUGHT_SIGNALS: [Signal; 4] = [
    Signal::SIGHUP,
    Signal::SIGINT,
    Signal::SIGQUIT,
    Signal::SIGTERM,
];

pub struct SignalHandler;

impl SignalHandler {
    /// Install handlers for [`CAUGHT_SIGNALS`].
    /// Call before spawning the shell.
    pub fn init() -> Result<Self, String> {
        let sig_action = SigAction::new(
            SigHandler::Handler(Self::signal_handler),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );

        for sig in CAUGHT_SIGNALS {
            // SAFETY: the handler only touches atomics.
            unsafe {
                signal::sigaction(sig, &sig_action)
                    .map_err(|e| format!("Failed to install {} handler: {}", sig, e))?;
            }
        }

        info!("Signal handlers installed (SIGHUP, SIGINT, SIGQUIT, SIGTERM)");
        Ok(Self)
    }

    /// No allocations, locks or I/O here.
    extern "C" fn signal_handler(signal: libc::c_int) {
        SIGNAL_RECEIVED.store(signal, Ordering::SeqCst);
        SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
    }

    pub fn shutdown_requested(&self) -> bool {
        SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
    }

    /// Take the pending signal, if any, so it is forwarded only once.
    pub fn take_signal(&self) -> Option<Signal> {
        let raw = SIGNAL_RECEIVED.swap(0, Ordering::SeqCst);
        if raw == 0 {
            return None;
        }
        Signal::try_from(raw).ok()
    }

    pub fn reset(&self) {
        SHUTDOWN_REQUESTED.store(false, Ordering::SeqCst);
        SIGNAL_RECEIVED.store(0, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_handler_init() {
        assert!(SignalHandler::init().is_ok());
    }

    #[test]
    fn test_take_signal_is_one_shot() {
        let handler = SignalHandler::init().unwrap();
        SignalHandler::signal_handler(libc::SIGTERM);
        assert!(handler.shutdown_requested());
        assert_eq!(handler.take_signal(), Some(Signal::SIGTERM));
        assert_eq!(handler.take_signal(), None);
        handler.reset();
        assert!(!handler.shutdown_requested());
    }
}
