//! Finding identity.
//!
//! Two findings are the same when their kind, normalized details and top
//! stack frames agree. Normalization is a pluggable policy; the default rule
//! (`AddressInsensitive`) removes the tokens that change from one execution
//! to the next:
//!
//! - hexadecimal literals (`0x7ffd...`) become `0x?`
//! - pid banners (`==1234==`) become `==?==`
//! - sanitizer thread ids (`T12`) become `T?`
//! - runs of whitespace collapse to one space

use crate::finding::types::{FindingKind, StackFrame};
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

/// Frames taken into account for the identity
pub const SIGNATURE_FRAMES: usize = 3;

static HEX_LITERAL: Lazy<Regex> = Lazy::new(|| Regex::new(r"0x[0-9a-fA-F]+").unwrap());
static PID_BANNER: Lazy<Regex> = Lazy::new(|| Regex::new(r"==\d+==").unwrap());
static THREAD_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bT\d+\b").unwrap());
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

pub trait SignatureNormalizer: Send + Sync {
    fn normalize(&self, text: &str) -> String;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AddressInsensitive;

impl SignatureNormalizer for AddressInsensitive {
    fn normalize(&self, text: &str) -> String {
        let text = HEX_LITERAL.replace_all(text, "0x?");
        let text = PID_BANNER.replace_all(&text, "==?==");
        let text = THREAD_ID.replace_all(&text, "T?");
        WHITESPACE.replace_all(text.trim(), " ").into_owned()
    }
}

/// Compute the deduplication key of a finding.
pub fn identity(
    kind: FindingKind,
    details: &str,
    frames: &[StackFrame],
    normalizer: &dyn SignatureNormalizer,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(normalizer.normalize(details).as_bytes());

    for frame in frames.iter().filter(|f| !f.is_runtime()).take(SIGNATURE_FRAMES) {
        hasher.update([0u8]);
        hasher.update(normalizer.normalize(&frame.function).as_bytes());
        if let Some(loc) = &frame.location {
            hasher.update(format!("@{}:{}", loc.file, loc.line).as_bytes());
        }
    }

    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}
