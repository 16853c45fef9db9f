use log::info;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
/// Async-safe termination signal handling
/// The handler only records the signal number; the cancellation coordinator
/// polls for it from an ordinary thread.
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::{Duration, Instant};

use crate::config::types::{FuzzError, Result};

/// Last termination signal received, 0 when none is pending (async-safe atomic)
static SIGNAL_RECEIVED: AtomicI32 = AtomicI32::new(0);

/// Signals that cancel a run
pub const TERMINATION_SIGNALS: [Signal; 3] = [Signal::SIGINT, Signal::SIGTERM, Signal::SIGQUIT];

/// Source of termination requests observed by the cancellation coordinator.
pub trait SignalSource: Send + Sync {
    /// Take the pending signal, if any. Non-blocking.
    fn poll(&self) -> Option<i32>;
}

/// Process signal handlers for SIGINT, SIGTERM and SIGQUIT.
pub struct OsSignals {
    _installed: (),
}

impl OsSignals {
    /// Install the handlers. Call early in main(), before threads are spawned.
    pub fn install() -> Result<Self> {
        let action = SigAction::new(
            SigHandler::Handler(Self::signal_handler),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );

        for sig in TERMINATION_SIGNALS {
            // SAFETY: the handler only stores into an atomic.
            unsafe { signal::sigaction(sig, &action) }.map_err(|e| {
                FuzzError::Config(format!("failed to install {} handler: {}", sig, e))
            })?;
        }

        info!("Signal handlers installed (SIGINT, SIGTERM, SIGQUIT)");
        Ok(Self { _installed: () })
    }

    /// Only performs an atomic store - no allocations, no locks, no I/O
    extern "C" fn signal_handler(signal: libc::c_int) {
        SIGNAL_RECEIVED.store(signal, Ordering::SeqCst);
    }
}

impl SignalSource for OsSignals {
    fn poll(&self) -> Option<i32> {
        match SIGNAL_RECEIVED.swap(0, Ordering::SeqCst) {
            0 => None,
            sig => Some(sig),
        }
    }
}

/// Signal source that fires once after a fixed delay. Drives scripted
/// shutdowns in tests and tools embedding the runner.
pub struct DelayedSignal {
    signal: i32,
    fire_at: Instant,
    fired: AtomicBool,
}

impl DelayedSignal {
    pub fn new(signal: Signal, delay: Duration) -> Self {
        Self {
            signal: signal as i32,
            fire_at: Instant::now() + delay,
            fired: AtomicBool::new(false),
        }
    }
}

impl SignalSource for DelayedSignal {
    fn poll(&self) -> Option<i32> {
        if Instant::now() < self.fire_at {
            return None;
        }
        if self.fired.swap(true, Ordering::SeqCst) {
            None
        } else {
            Some(self.signal)
        }
    }
}

/// Signal source that never fires.
pub struct NoSignals;

impl SignalSource for NoSignals {
    fn poll(&self) -> Option<i32> {
        None
    }
}

/// Human readable name, e.g. `SIGINT`.
pub fn signal_name(signal: i32) -> String {
    Signal::try_from(signal)
        .map(|s| s.as_str().to_string())
        .unwrap_or_else(|_| format!("signal {}", signal))
}
