//! Report aggregation for one run.
//!
//! Findings are rendered the moment they are added, either as colored text
//! or as one JSON object per line. Repeats of an identity already seen are
//! counted and otherwise dropped. The final metrics block is rendered once,
//! after the fuzz process is gone.

use crate::config::types::{FuzzError, OutputFormat, Result};
use crate::core::types::RunMetrics;
use crate::finding::types::{Finding, FindingKind};
use crate::utils::duration::format_duration;
use log::debug;
use serde::Serialize;
use std::collections::HashMap;
use std::io::{IsTerminal, Write};
use std::path::PathBuf;

const RESET: &str = "\x1b[0m";
const BOLD: &str = "\x1b[1m";
const RED: &str = "\x1b[31m";
const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const DIM: &str = "\x1b[2m";

/// Wire shape of the machine-readable output, one object per line.
#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum JsonRecord<'a> {
    Finding(&'a Finding),
    FinalMetrics(MetricsRecord),
}

#[derive(Serialize)]
struct MetricsRecord {
    findings: usize,
    finding_occurrences: usize,
    seeds_before: usize,
    seeds_after: usize,
    new_seeds: usize,
    elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    executions: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    exec_per_sec: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    termination: Option<String>,
    success: bool,
}

impl From<&RunMetrics> for MetricsRecord {
    fn from(m: &RunMetrics) -> Self {
        Self {
            findings: m.findings,
            finding_occurrences: m.finding_occurrences,
            seeds_before: m.seeds_before,
            seeds_after: m.seeds_after,
            new_seeds: m.new_seeds(),
            elapsed_ms: m.elapsed.as_millis() as u64,
            executions: m.executions,
            exec_per_sec: m.exec_per_sec,
            termination: m.termination.as_ref().map(|t| t.describe()),
            success: m.success(),
        }
    }
}

/// Report Aggregator. One instance per run, single writer.
pub struct ReportHandler {
    format: OutputFormat,
    verbose: bool,
    out: Box<dyn Write + Send>,
    err: Box<dyn Write + Send>,
    color: bool,
    /// identity -> occurrences
    seen: HashMap<String, usize>,
    /// Distinct findings in arrival order
    findings: Vec<Finding>,
    occurrences: usize,
    finalized: bool,
}

impl ReportHandler {
    /// Report to stdout, with raw passthrough on stderr. Color is used only
    /// for human output on a terminal.
    pub fn new(format: OutputFormat, verbose: bool) -> Self {
        let color = format == OutputFormat::Human && std::io::stdout().is_terminal();
        let mut handler = Self::with_writers(
            format,
            verbose,
            Box::new(std::io::stdout()),
            Box::new(std::io::stderr()),
        );
        handler.color = color;
        handler
    }

    pub fn with_writers(
        format: OutputFormat,
        verbose: bool,
        out: Box<dyn Write + Send>,
        err: Box<dyn Write + Send>,
    ) -> Self {
        Self {
            format,
            verbose,
            out,
            err,
            color: false,
            seen: HashMap::new(),
            findings: Vec::new(),
            occurrences: 0,
            finalized: false,
        }
    }

    pub fn with_color(mut self, color: bool) -> Self {
        self.color = color && self.format == OutputFormat::Human;
        self
    }

    /// Record a finding. Returns `true` when it was new and has been
    /// rendered, `false` for a repeat of an identity already reported.
    pub fn add_finding(&mut self, finding: Finding) -> Result<bool> {
        self.occurrences += 1;
        if let Some(count) = self.seen.get_mut(&finding.identity) {
            *count += 1;
            debug!(
                "Suppressing duplicate {} finding {} (seen {} times)",
                finding.kind, finding.identity, count
            );
            return Ok(false);
        }
        self.seen.insert(finding.identity.clone(), 1);

        match self.format {
            OutputFormat::Json => self.write_json(&JsonRecord::Finding(&finding))?,
            OutputFormat::Human => self.write_human_finding(&finding)?,
        }
        self.out.flush()?;
        self.findings.push(finding);
        Ok(true)
    }

    /// Raw fuzzer output that is not part of a finding.
    pub fn passthrough(&mut self, line: &str) -> Result<()> {
        if self.verbose {
            writeln!(self.err, "{}", line)?;
        }
        Ok(())
    }

    /// Deduplicated findings, in the order they were first seen.
    pub fn findings(&self) -> &[Finding] {
        &self.findings
    }

    pub fn finding_count(&self) -> usize {
        self.findings.len()
    }

    /// Every finding added, duplicates included.
    pub fn occurrences(&self) -> usize {
        self.occurrences
    }

    /// Occurrences of one identity.
    pub fn occurrences_of(&self, identity: &str) -> usize {
        self.seen.get(identity).copied().unwrap_or(0)
    }

    /// Render the end-of-run summary. May be called only once.
    pub fn print_final_metrics(&mut self, metrics: &RunMetrics) -> Result<()> {
        if self.finalized {
            return Err(FuzzError::Io(std::io::Error::other(
                "final metrics were already printed for this run",
            )));
        }
        self.finalized = true;

        for (identity, count) in self.seen.iter().filter(|(_, c)| **c > 1) {
            debug!("Finding {} occurred {} times", identity, count);
        }

        match self.format {
            OutputFormat::Json => {
                self.write_json(&JsonRecord::FinalMetrics(MetricsRecord::from(metrics)))?
            }
            OutputFormat::Human => self.write_human_metrics(metrics)?,
        }
        self.out.flush()?;
        Ok(())
    }

    fn write_json(&mut self, record: &JsonRecord<'_>) -> Result<()> {
        let line = serde_json::to_string(record).map_err(std::io::Error::other)?;
        writeln!(self.out, "{}", line)?;
        Ok(())
    }

    fn paint(&self, style: &str, text: &str) -> String {
        if self.color {
            format!("{}{}{}", style, text, RESET)
        } else {
            text.to_string()
        }
    }

    fn write_human_finding(&mut self, finding: &Finding) -> Result<()> {
        let style = match finding.kind {
            FindingKind::Crash | FindingKind::SanitizerError => RED,
            FindingKind::Timeout | FindingKind::OutOfMemory | FindingKind::Leak => YELLOW,
        };
        let label = self.paint(
            &format!("{}{}", BOLD, style),
            &format!("[{}]", finding.kind),
        );
        let mut text = format!("{} {}\n", label, finding.title());
        if let Some(input) = &finding.input_file {
            text.push_str(&format!("    input: {}\n", input.display()));
        }
        let top: Vec<&str> = finding
            .stack_trace
            .iter()
            .filter(|f| !f.is_runtime())
            .take(3)
            .map(|f| f.function.as_str())
            .collect();
        if !top.is_empty() {
            text.push_str(&self.paint(DIM, &format!("    stack: {}", top.join(" <- "))));
            text.push('\n');
        }
        self.out.write_all(text.as_bytes())?;
        Ok(())
    }

    fn write_human_metrics(&mut self, m: &RunMetrics) -> Result<()> {
        let findings = if m.finding_occurrences > m.findings {
            format!("{} ({} occurrences)", m.findings, m.finding_occurrences)
        } else {
            m.findings.to_string()
        };
        let executions = match (m.executions, m.exec_per_sec) {
            (Some(n), Some(rate)) => format!("{} ({} exec/s)", n, rate),
            (Some(n), None) => n.to_string(),
            _ => "n/a".to_string(),
        };
        let result = if m.success() {
            self.paint(&format!("{}{}", BOLD, GREEN), "OK")
        } else {
            self.paint(&format!("{}{}", BOLD, RED), "FAILED")
        };

        let mut text = String::new();
        text.push_str(&self.paint(BOLD, "Run summary"));
        text.push('\n');
        text.push_str(&format!("  Findings:    {}\n", findings));
        text.push_str(&format!("  Executions:  {}\n", executions));
        text.push_str(&format!(
            "  Corpus:      {} -> {} seeds (+{})\n",
            m.seeds_before,
            m.seeds_after,
            m.new_seeds()
        ));
        text.push_str(&format!("  Duration:    {}\n", format_duration(m.elapsed)));
        if let Some(termination) = &m.termination {
            text.push_str(&format!("  Target:      {}\n", termination.describe()));
        }
        text.push_str(&format!("  Result:      {}\n", result));
        self.out.write_all(text.as_bytes())?;
        Ok(())
    }
}

/// Input files of the findings, for a closing hint in human output.
pub fn reproducer_paths(findings: &[Finding]) -> Vec<PathBuf> {
    findings.iter().filter_map(|f| f.input_file.clone()).collect()
}
