//! Run orchestration.
//!
//! The supervisor owns the fuzz process; the coordinator pairs it with a
//! signal listener through a shared cancellation token.

pub mod args;
pub mod cancel;
pub mod coordinator;
pub mod supervisor;
pub mod types;
