use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Last statistics printed by the fuzzing engine.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FuzzerStats {
    pub executions: u64,
    pub exec_per_sec: Option<u64>,
    pub coverage: Option<u64>,
    pub corpus_entries: Option<u64>,
}

/// How the fuzz process ended.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum Termination {
    /// Exited on its own with a status code
    Exited { code: i32 },
    /// Killed by a signal it did not ask for
    Signaled { signal: i32 },
    /// Terminated by the supervisor when the run timeout expired
    TimedOut,
    /// Terminated by the supervisor after cancellation
    Cancelled,
}

impl Termination {
    pub fn describe(&self) -> String {
        match self {
            Self::Exited { code } => format!("exited with code {}", code),
            Self::Signaled { signal } => format!("was killed by signal {}", signal),
            Self::TimedOut => "reached the run timeout".to_string(),
            Self::Cancelled => "was cancelled".to_string(),
        }
    }

    pub fn is_clean_exit(&self) -> bool {
        matches!(self, Self::Exited { code: 0 })
    }
}

/// Counters for one run; rendered once by the report handler.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RunMetrics {
    /// Deduplicated findings reported during the run
    pub findings: usize,
    /// Every finding occurrence, duplicates included
    pub finding_occurrences: usize,
    pub seeds_before: usize,
    pub seeds_after: usize,
    pub elapsed: Duration,
    /// Last execution count printed by the engine
    pub executions: Option<u64>,
    pub exec_per_sec: Option<u64>,
    pub termination: Option<Termination>,
}

impl RunMetrics {
    pub fn new_seeds(&self) -> usize {
        self.seeds_after.saturating_sub(self.seeds_before)
    }

    pub fn update_stats(&mut self, stats: &FuzzerStats) {
        self.executions = Some(stats.executions);
        if stats.exec_per_sec.is_some() {
            self.exec_per_sec = stats.exec_per_sec;
        }
    }

    pub fn success(&self) -> bool {
        self.findings == 0
    }
}

/// Signal escalation report for timeout/forced termination paths.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KillReport {
    pub term_sent: bool,
    pub kill_sent: bool,
    /// The group was already gone when termination started
    pub already_exited: bool,
    pub waited_ms: u64,
    pub notes: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_update_keeps_last_known_rate() {
        let mut metrics = RunMetrics::default();
        metrics.update_stats(&FuzzerStats {
            executions: 100,
            exec_per_sec: Some(50),
            ..Default::default()
        });
        metrics.update_stats(&FuzzerStats {
            executions: 250,
            exec_per_sec: None,
            ..Default::default()
        });
        assert_eq!(metrics.executions, Some(250));
        assert_eq!(metrics.exec_per_sec, Some(50));
    }

    #[test]
    fn corpus_growth_never_underflows() {
        let metrics = RunMetrics {
            seeds_before: 7,
            seeds_after: 4,
            ..Default::default()
        };
        assert_eq!(metrics.new_seeds(), 0);
        assert!(metrics.success());
    }

    #[test]
    fn termination_descriptions() {
        assert_eq!(Termination::Exited { code: 1 }.describe(), "exited with code 1");
        assert!(Termination::Exited { code: 0 }.is_clean_exit());
        assert!(!Termination::Signaled { signal: 9 }.is_clean_exit());
    }
}
