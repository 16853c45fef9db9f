//! Findings
//!
//! Typed diagnostics recognized in fuzzer output, their identity, and the
//! incremental parser producing them.

pub mod parser;
pub mod signature;
pub mod types;

pub use parser::{FindingParser, ParseEvent};
pub use signature::{AddressInsensitive, SignatureNormalizer};
pub use types::{Finding, FindingKind, SourceLocation, StackFrame};
