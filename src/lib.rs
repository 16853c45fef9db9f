//! fuzzbox: sandboxed libFuzzer execution with live finding reports
//!
//! # Architecture
//!
//! ## Run Orchestration ([`core`])
//! - [`core::supervisor`]: Process Supervisor (spawn, stream, timeout, terminate)
//! - [`core::coordinator`]: Cancellation Coordinator (signal listener + supervisor)
//! - [`core::cancel`]: `Armed -> Triggered -> Cleaned` cancellation token
//! - [`core::args`]: Fuzzer argument vector and engine-argument bindings
//!
//! ## Findings ([`finding`])
//! - [`finding::parser`]: Incremental recognizer for libFuzzer and sanitizer reports
//! - [`finding::signature`]: Pluggable signature normalization and identity
//!
//! ## Reporting ([`report`])
//! - [`report::handler`]: Deduplicating aggregator, human or JSON-lines output
//!
//! ## Sandbox ([`sandbox`])
//! - [`sandbox::policy`]: Builder contract and binding resolution
//! - [`sandbox::minijail`]: minijail0 command construction
//! - [`sandbox::finder`]: External tool lookup
//! - [`sandbox::wrapper`]: In-sandbox exec wrapper role
//!
//! ## Kernel Primitives ([`kernel`])
//! - [`kernel::signal`]: Async-signal-safe termination signal capture
//! - [`kernel::process`]: Process-group termination with SIGTERM/SIGKILL escalation
//!
//! ## Safety & Cleanup ([`safety`])
//! - [`safety::cleanup`]: Idempotent run finalizer
//! - [`safety::lock`]: Per-corpus advisory lock with a stable inode
//!
//! ## Collaborators
//! - [`build`]: CMake and shell-command builders
//! - [`coverage`]: llvm-profdata / llvm-cov HTML report
//!
//! ## Configuration ([`config`])
//! - [`config::types`]: Run configuration, bindings and the error taxonomy
//! - [`config::validator`]: Pre-run validation
//! - [`config::project`]: `fuzzbox.json` project file

// Kernel Primitives
pub mod kernel;

// Run orchestration
pub mod core;

// Findings and reporting
pub mod finding;
pub mod report;

// Sandbox command construction
pub mod sandbox;

// Safety & Cleanup
pub mod safety;

// Build and coverage collaborators
pub mod build;
pub mod coverage;

// Configuration
pub mod config;

// Utilities
pub mod utils;

// CLI
pub mod cli;
