//! Utilities
//!
//! Environment lists, duration flags, seed counting, and output streaming.

pub mod duration;
pub mod env;
pub mod output;
pub mod seeds;
