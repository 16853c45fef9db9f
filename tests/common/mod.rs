//! Shared fixtures: shell-script fuzz targets and in-memory report sinks.

#![allow(dead_code)]

use fuzzbox::config::types::{FuzzError, OutputFormat, Result};
use fuzzbox::core::supervisor::{Supervisor, SupervisorOptions};
use fuzzbox::report::ReportHandler;
use fuzzbox::sandbox::policy::{
    resolve_bindings, MountPoint, SandboxPolicyBuilder, SandboxRequest, SandboxedCommand,
};
use fuzzbox::sandbox::{Tool, ToolFinder};
use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Report sink readable after the handler is done with it.
#[derive(Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl SharedBuffer {
    pub fn json_lines(&self) -> Vec<serde_json::Value> {
        let bytes = self.0.lock().unwrap().clone();
        String::from_utf8(bytes)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }
}

pub fn json_report() -> (ReportHandler, SharedBuffer) {
    let out = SharedBuffer::default();
    let report = ReportHandler::with_writers(
        OutputFormat::Json,
        false,
        Box::new(out.clone()),
        Box::new(std::io::sink()),
    );
    (report, out)
}

/// Write an executable `/bin/sh` script named `name` into `dir`.
pub fn fake_target(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

pub fn write_seeds(dir: &Path, non_empty: usize, empty: usize) {
    fs::create_dir_all(dir).unwrap();
    for i in 0..non_empty {
        fs::write(dir.join(format!("seed-{}", i)), b"input").unwrap();
    }
    for i in 0..empty {
        fs::write(dir.join(format!("empty-{}", i)), b"").unwrap();
    }
}

/// An AddressSanitizer heap overflow report as libFuzzer prints it.
pub fn asan_crash(pid: u32, addr: &str) -> String {
    format!(
        "=={pid}==ERROR: AddressSanitizer: heap-buffer-overflow on address {addr} at pc 0x4f5a2b bp 0x7ffc sp 0x7ff0\n\
READ of size 1 at {addr} thread T0\n\
    #0 0x4f5a2a in LLVMFuzzerTestOneInput /src/fuzz.c:12:3\n\
    #1 0x4c1d2e in fuzzer::Fuzzer::ExecuteCallback(unsigned char const*, unsigned long) /src/llvm/compiler-rt/lib/fuzzer/FuzzerLoop.cpp:611:15\n\
SUMMARY: AddressSanitizer: heap-buffer-overflow /src/fuzz.c:12:3 in LLVMFuzzerTestOneInput\n\
artifact_prefix='./'; Test unit written to ./crash-{pid}\n"
    )
}

pub fn libfuzzer_timeout(pid: u32) -> String {
    format!(
        "=={pid}== ERROR: libFuzzer: timeout after 25 seconds\n\
    #0 0x51e2c1 in __sanitizer_print_stack_trace /src/llvm/compiler-rt/lib/asan/asan_stack.cpp:87:3\n\
    #1 0x4f5b10 in LLVMFuzzerTestOneInput /src/fuzz.c:20:1\n\
SUMMARY: libFuzzer: timeout\n\
artifact_prefix='./'; Test unit written to ./timeout-{pid}\n"
    )
}

/// Shell body printing `text` verbatim.
pub fn print(text: &str) -> String {
    format!("cat <<'FUZZ_EOF'\n{}FUZZ_EOF", text)
}

pub struct NoTools;

impl ToolFinder for NoTools {
    fn find(&self, tool: Tool) -> Result<PathBuf> {
        Err(FuzzError::Config(format!("{} not installed", tool.binary_name())))
    }
}

/// Resolves bindings and lays out a root like a real sandbox, but runs the
/// command unconfined.
pub struct PassthroughSandbox;

impl SandboxPolicyBuilder for PassthroughSandbox {
    fn name(&self) -> &'static str {
        "passthrough"
    }

    fn build(&self, request: &SandboxRequest<'_>) -> Result<SandboxedCommand> {
        let resolved = resolve_bindings(request.bindings)?;
        Ok(SandboxedCommand {
            args: request.command.to_vec(),
            mount_points: resolved
                .into_iter()
                .map(|b| MountPoint {
                    path: b.target,
                    is_dir: b.is_dir,
                })
                .collect(),
        })
    }
}

pub fn supervisor(scratch: &Path, sandbox: Option<Box<dyn SandboxPolicyBuilder>>) -> Supervisor {
    Supervisor::new(
        SupervisorOptions {
            scratch_root: scratch.to_path_buf(),
            termination_grace: Duration::from_millis(100),
            drain_timeout: Duration::from_millis(500),
        },
        sandbox,
        Arc::new(NoTools),
    )
}
