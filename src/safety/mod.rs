//! Safety & cleanup
//!
//! Run-scoped resource ledger and the per-corpus run lock.

pub mod cleanup;
pub mod lock;
