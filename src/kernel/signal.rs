use log::info;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
/// Async-safe shutdown handling for worker processes
///
/// The handler only flips atomics. Workers poll [`should_continue`] between
/// dispatch steps and leave their loop cooperatively.
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

static SIGNAL_RECEIVED: AtomicU32 = AtomicU32::new(0);

/// Installed SIGINT/SIGTERM handlers
pub struct ShutdownSignals;

impl ShutdownSignals {
    /// Install handlers. Call before forking workers so children inherit them.
    pub fn install() -> Result<Self, String> {
        let action = SigAction::new(
            SigHandler::Handler(Self::on_signal),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );

        unsafe {
            signal::sigaction(Signal::SIGINT, &action)
                .map_err(|e| format!("Failed to install SIGINT handler: {}", e))?;
            signal::sigaction(Signal::SIGTERM, &action)
                .map_err(|e| format!("Failed to install SIGTERM handler: {}", e))?;
        }

        info!("Shutdown handlers installed (SIGINT, SIGTERM)");
        Ok(Self)
    }

    extern "C" fn on_signal(signal: libc::c_int) {
        SIGNAL_RECEIVED.store(signal as u32, Ordering::SeqCst);
        SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
    }

    /// Signal that triggered shutdown (0 if none)
    pub fn received(&self) -> u32 {
        SIGNAL_RECEIVED.load(Ordering::SeqCst)
    }
}

/// False once a shutdown signal arrived
pub fn should_continue() -> bool {
    !SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}
