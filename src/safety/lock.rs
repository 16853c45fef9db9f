/// Per-corpus run lock
/// Two runs writing into one corpus directory would race on new inputs, so a
/// run holds an exclusive flock keyed by the canonical corpus path. The lock
/// file is truncated on release rather than removed, keeping its inode stable
/// for anyone blocked on it.
use crate::config::types::{FuzzError, Result};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::io::{Seek, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

/// Content of a held lock file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub corpus: PathBuf,
    pub created_at: DateTime<Utc>,
    pub version: String,
}

#[derive(Debug)]
pub struct CorpusLock {
    file: Option<File>,
    path: PathBuf,
}

impl CorpusLock {
    /// Lock file path for `corpus` under `lock_dir`.
    pub fn lock_path(lock_dir: &Path, corpus: &Path) -> PathBuf {
        let canonical = corpus.canonicalize().unwrap_or_else(|_| corpus.to_path_buf());
        let digest = Sha256::digest(canonical.as_os_str().as_encoded_bytes());
        let hex = format!("{:x}", digest);
        lock_dir.join(format!("corpus-{}.lock", &hex[..16]))
    }

    /// Take the lock without blocking. Fails with `LockBusy` when another
    /// process holds it.
    pub fn acquire(lock_dir: &Path, corpus: &Path) -> Result<Self> {
        std::fs::create_dir_all(lock_dir)?;
        let path = Self::lock_path(lock_dir, corpus);

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        // SAFETY: flock on a descriptor we own.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
                if let Some(owner) = read_owner(&path) {
                    warn!("Corpus {} is locked by PID {}", corpus.display(), owner.pid);
                }
                return Err(FuzzError::LockBusy { path });
            }
            return Err(FuzzError::Io(err));
        }

        let info = LockInfo {
            pid: std::process::id(),
            corpus: corpus.to_path_buf(),
            created_at: Utc::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        };
        let json = serde_json::to_string(&info)
            .map_err(|e| FuzzError::Io(std::io::Error::other(e)))?;
        file.set_len(0)?;
        file.rewind()?;
        writeln!(file, "{}", json)?;
        file.sync_all()?;

        debug!("Acquired corpus lock {}", path.display());
        Ok(Self {
            file: Some(file),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_held(&self) -> bool {
        self.file.is_some()
    }

    /// Truncate and unlock. Idempotent; returns false when already released.
    pub fn release(&mut self) -> bool {
        let Some(file) = self.file.take() else {
            return false;
        };
        if let Err(e) = file.set_len(0) {
            debug!("Failed to truncate lock {}: {}", self.path.display(), e);
        }
        // SAFETY: flock on a descriptor we own; closing it would unlock too.
        unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
        debug!("Released corpus lock {}", self.path.display());
        true
    }
}

impl Drop for CorpusLock {
    fn drop(&mut self) {
        self.release();
    }
}

fn read_owner(path: &Path) -> Option<LockInfo> {
    let content = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(content.lines().next()?).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_is_busy_until_release() {
        let tmp = tempfile::tempdir().unwrap();
        let corpus = tmp.path().join("corpus");
        std::fs::create_dir(&corpus).unwrap();
        let locks = tmp.path().join("locks");

        let mut first = CorpusLock::acquire(&locks, &corpus).unwrap();
        let owner = read_owner(first.path()).expect("lock info written");
        assert_eq!(owner.pid, std::process::id());

        match CorpusLock::acquire(&locks, &corpus) {
            Err(FuzzError::LockBusy { path }) => assert_eq!(path, first.path()),
            other => panic!("expected LockBusy, got {other:?}"),
        }

        assert!(first.release());
        assert!(!first.release(), "release is idempotent");
        assert!(first.path().exists(), "lock file is kept, not unlinked");
        assert_eq!(std::fs::metadata(first.path()).unwrap().len(), 0);

        let again = CorpusLock::acquire(&locks, &corpus).unwrap();
        assert!(again.is_held());
    }

    #[test]
    fn lock_path_is_stable_per_corpus() {
        let tmp = tempfile::tempdir().unwrap();
        let a = CorpusLock::lock_path(tmp.path(), Path::new("/work/corpus-a"));
        let b = CorpusLock::lock_path(tmp.path(), Path::new("/work/corpus-b"));
        assert_ne!(a, b);
        assert_eq!(a, CorpusLock::lock_path(tmp.path(), Path::new("/work/corpus-a")));
    }
}
