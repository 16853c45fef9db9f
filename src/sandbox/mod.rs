//! Sandboxing
//!
//! Turns a command plus its filesystem exposure into a confined command
//! line. Builders never run anything; the supervisor executes the result.

pub mod finder;
pub mod minijail;
pub mod policy;
pub mod wrapper;

pub use finder::{InstallDirFinder, Tool, ToolFinder};
pub use minijail::MinijailBuilder;
pub use policy::{SandboxPolicyBuilder, SandboxRequest, SandboxedCommand};

/// Whether this platform has the confinement primitive the sandbox needs.
pub fn is_supported() -> bool {
    cfg!(target_os = "linux")
}
