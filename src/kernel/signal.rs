/// Async-safe interrupt handling for the CLI
///
/// The handler only stores atomics. Long-running loops (streaming a script
/// session, waiting on a batch) poll `interrupted()` and shut down from
/// normal code.
use crate::config::types::Result;
use log::info;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::{Duration, Instant};

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

static LAST_SIGNAL: AtomicI32 = AtomicI32::new(0);

const HANDLED: [Signal; 3] = [Signal::SIGINT, Signal::SIGTERM, Signal::SIGHUP];

/// Installed SIGINT/SIGTERM/SIGHUP handlers
#[derive(Debug)]
pub struct SignalHandler;

impl SignalHandler {
    /// Install the handlers. Call early in `main`, before spawning threads.
    pub fn install() -> Result<Self> {
        let action = SigAction::new(
            SigHandler::Handler(Self::on_signal),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );

        for sig in HANDLED {
            // SAFETY: the handler only touches atomics.
            unsafe { signal::sigaction(sig, &action) }?;
        }

        info!("Signal handlers installed (SIGINT, SIGTERM, SIGHUP)");
        Ok(Self)
    }

    extern "C" fn on_signal(signal: libc::c_int) {
        LAST_SIGNAL.store(signal, Ordering::SeqCst);
        INTERRUPTED.store(true, Ordering::SeqCst);
    }

    pub fn interrupted(&self) -> bool {
        INTERRUPTED.load(Ordering::SeqCst)
    }

    /// Last signal received, if any
    pub fn signal(&self) -> Option<Signal> {
        match LAST_SIGNAL.load(Ordering::SeqCst) {
            0 => None,
            raw => Signal::try_from(raw).ok(),
        }
    }

    /// Clear the flag so the next interrupt can be observed
    pub fn reset(&self) {
        INTERRUPTED.store(false, Ordering::SeqCst);
        LAST_SIGNAL.store(0, Ordering::SeqCst);
    }

    /// Sleep in short steps until interrupted or `timeout` elapses.
    /// Returns true if interrupted.
    pub fn wait_for_signal(&self, timeout: Duration) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if self.interrupted() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        self.interrupted()
    }
}
