//! Cancellation Coordinator.
//!
//! Runs the supervisor and a signal listener side by side in one thread
//! scope. Both share a [`CancelToken`]: a signal triggers it and the
//! supervisor stops its process group; natural completion triggers it and
//! the listener exits. Whichever comes first decides the outcome.

use crate::config::types::{FuzzError, Result, RunConfiguration};
use crate::core::cancel::{CancelCause, CancelToken};
use crate::core::supervisor::Supervisor;
use crate::core::types::RunMetrics;
use crate::kernel::signal::{signal_name, SignalSource};
use crate::report::handler::ReportHandler;
use crossbeam_channel::select;
use log::{debug, warn};
use std::time::Duration;

/// How often the listener polls the signal source
pub const SIGNAL_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Run one supervised fuzz run, cancelling it on the first signal
/// `signals` reports.
pub fn run_with_cancellation(
    supervisor: &mut Supervisor,
    config: &RunConfiguration,
    report: &mut ReportHandler,
    signals: &dyn SignalSource,
) -> Result<RunMetrics> {
    run_with_token(supervisor, &CancelToken::new(), config, report, signals)
}

/// Same as [`run_with_cancellation`] with a caller-provided token, which
/// lets the caller observe the final state.
pub fn run_with_token(
    supervisor: &mut Supervisor,
    token: &CancelToken,
    config: &RunConfiguration,
    report: &mut ReportHandler,
    signals: &dyn SignalSource,
) -> Result<RunMetrics> {
    let result = std::thread::scope(|scope| {
        let listener = {
            let token = token.clone();
            scope.spawn(move || listen(&token, signals))
        };

        let result = supervisor.run(token, config, report);

        // The supervisor triggers on its way out; this covers early returns.
        token.trigger(CancelCause::Completed);
        if listener.join().is_err() {
            warn!("Signal listener panicked");
        }
        result
    });

    match (result, token.signal()) {
        (Ok(_), Some(signal)) => Err(FuzzError::Interrupted { signal }),
        (result, _) => result,
    }
}

fn listen(token: &CancelToken, signals: &dyn SignalSource) {
    loop {
        if let Some(sig) = signals.poll() {
            if token.trigger(CancelCause::Signal(sig)) {
                warn!("Received {}, stopping the run", signal_name(sig));
            } else {
                debug!("Ignoring {}: run is already shutting down", signal_name(sig));
            }
            return;
        }
        select! {
            recv(token.done()) -> _ => return,
            default(SIGNAL_POLL_INTERVAL) => {}
        }
    }
}
