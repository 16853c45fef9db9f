//! Configuration
//!
//! Run configuration types, validation, and project file loading.

pub mod project;
pub mod types;
pub mod validator;
