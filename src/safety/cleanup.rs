//! Run-scoped resource cleanup
//! Every resource a run creates is recorded here immediately after creation
//! and released in reverse order by one idempotent `cleanup`, which also
//! runs from `Drop` so no exit path can skip it.

use crate::core::cancel::{CancelCause, CancelToken};
use crate::kernel::process::{terminate_process_group, TERMINATION_GRACE};
use crate::safety::lock::CorpusLock;
use log::{debug, info};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Child;
use walkdir::WalkDir;

/// Resources owned by one run.
pub struct RunResources {
    token: CancelToken,
    lock: Option<CorpusLock>,
    scratch_dirs: Vec<PathBuf>,
    child: Option<Child>,
    cleaned: bool,
    cleanup_errors: Vec<String>,
}

impl RunResources {
    pub fn new(token: CancelToken) -> Self {
        Self {
            token,
            lock: None,
            scratch_dirs: Vec::new(),
            child: None,
            cleaned: false,
            cleanup_errors: Vec::new(),
        }
    }

    pub fn record_lock(&mut self, lock: CorpusLock) {
        debug!("Recording resource: lock {}", lock.path().display());
        self.lock = Some(lock);
    }

    pub fn record_scratch_dir(&mut self, path: PathBuf) {
        debug!("Recording resource: scratch dir {}", path.display());
        self.scratch_dirs.push(path);
    }

    pub fn record_child(&mut self, child: Child) {
        debug!("Recording resource: process group {}", child.id());
        self.child = Some(child);
    }

    pub fn child_mut(&mut self) -> Option<&mut Child> {
        self.child.as_mut()
    }

    pub fn is_cleaned(&self) -> bool {
        self.cleaned
    }

    /// Errors seen during cleanup; informational only.
    pub fn cleanup_errors(&self) -> &[String] {
        &self.cleanup_errors
    }

    /// Release everything in reverse creation order: process group, scratch
    /// directories, then the corpus lock. Returns false if cleanup already
    /// ran. Failures are logged at debug level and never returned.
    pub fn cleanup(&mut self) -> bool {
        if self.cleaned {
            debug!("Run resources already cleaned");
            return false;
        }
        self.cleaned = true;

        // Completion trigger is a no-op when a signal got there first.
        self.token.trigger(CancelCause::Completed);

        if let Some(mut child) = self.child.take() {
            match child.try_wait() {
                Ok(Some(_)) => debug!("Process {} already exited", child.id()),
                _ => {
                    let report = terminate_process_group(&mut child, TERMINATION_GRACE);
                    debug!("Terminated process group {}: {:?}", child.id(), report);
                }
            }
            if let Err(e) = child.wait() {
                self.note_error(format!("wait for process {}: {}", child.id(), e));
            }
        }

        for dir in std::mem::take(&mut self.scratch_dirs).into_iter().rev() {
            if let Err(e) = remove_scratch_tree(&dir) {
                self.note_error(format!("remove {}: {}", dir.display(), e));
            }
        }

        if let Some(mut lock) = self.lock.take() {
            lock.release();
        }

        self.token.mark_cleaned();
        info!(
            "Run cleanup complete ({} error(s))",
            self.cleanup_errors.len()
        );
        true
    }

    fn note_error(&mut self, msg: String) {
        debug!("Cleanup: {}", msg);
        self.cleanup_errors.push(msg);
    }
}

impl Drop for RunResources {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Remove a sandbox scratch tree, which only ever holds mount-point
/// skeletons: directories and empty files. Walking stays on one filesystem,
/// and non-empty files are left alone, so a mount that outlived its sandbox
/// is never descended into.
pub fn remove_scratch_tree(root: &Path) -> std::io::Result<()> {
    if !root.exists() {
        debug!("Scratch dir {} already cleaned", root.display());
        return Ok(());
    }

    let mut kept = 0usize;
    for entry in WalkDir::new(root)
        .contents_first(true)
        .same_file_system(true)
        .follow_links(false)
    {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                debug!("Skipping unreadable scratch entry: {}", e);
                kept += 1;
                continue;
            }
        };
        let path = entry.path();
        let file_type = entry.file_type();
        let removed = if file_type.is_dir() {
            fs::remove_dir(path)
        } else if file_type.is_symlink() {
            fs::remove_file(path)
        } else {
            match entry.metadata() {
                Ok(meta) if meta.len() == 0 => fs::remove_file(path),
                _ => Err(std::io::Error::other("non-empty file")),
            }
        };
        if let Err(e) = removed {
            debug!("Keeping {}: {}", path.display(), e);
            kept += 1;
        }
    }

    if kept > 0 {
        return Err(std::io::Error::other(format!(
            "{} entr{} could not be removed",
            kept,
            if kept == 1 { "y" } else { "ies" }
        )));
    }
    Ok(())
}
