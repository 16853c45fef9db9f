//! Process-group termination for the supervised child.
//!
//! The child is spawned as the leader of its own process group, so one
//! `killpg` reaches it together with everything it started, including a
//! sandbox launcher and the processes inside the sandbox.

use crate::core::types::KillReport;
use log::{debug, warn};
use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use std::process::Child;
use std::time::{Duration, Instant};

/// Time between SIGTERM and SIGKILL
pub const TERMINATION_GRACE: Duration = Duration::from_millis(200);

/// SIGTERM the child's group, wait up to `grace` for the leader, then SIGKILL
/// the group. Reaps the leader when it exits within the grace period.
pub fn terminate_process_group(child: &mut Child, grace: Duration) -> KillReport {
    let mut report = KillReport::default();
    let start = Instant::now();
    let pid = Pid::from_raw(child.id() as i32);

    if let Ok(Some(status)) = child.try_wait() {
        debug!("Process group leader {} already exited: {}", pid, status);
        report.already_exited = true;
    }

    match killpg(pid, Signal::SIGTERM) {
        Ok(()) => report.term_sent = true,
        Err(Errno::ESRCH) => {
            report.notes.push("process group already gone".to_string());
            report.waited_ms = start.elapsed().as_millis() as u64;
            return report;
        }
        Err(e) => {
            let _ = kill(pid, Signal::SIGTERM);
            report.term_sent = true;
            report
                .notes
                .push(format!("group SIGTERM fallback used: {}", e));
        }
    }

    let deadline = start + grace;
    while Instant::now() < deadline {
        if let Ok(Some(_)) = child.try_wait() {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }

    match killpg(pid, Signal::SIGKILL) {
        Ok(()) => report.kill_sent = true,
        Err(Errno::ESRCH) => {}
        Err(e) => {
            let _ = kill(pid, Signal::SIGKILL);
            report.kill_sent = true;
            report
                .notes
                .push(format!("group SIGKILL fallback used: {}", e));
        }
    }

    if !report.notes.is_empty() {
        warn!("Terminating process group {}: {}", pid, report.notes.join("; "));
    }
    report.waited_ms = start.elapsed().as_millis() as u64;
    report
}
