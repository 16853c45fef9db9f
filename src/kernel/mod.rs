//! Thin wrappers around Unix process primitives.
//!
//! All `unsafe` code is concentrated here.

pub mod process;
pub mod signal;
