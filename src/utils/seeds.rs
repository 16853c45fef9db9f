use crate::config::types::{FuzzError, Result};
use std::path::PathBuf;
use walkdir::WalkDir;

/// Count the seeds in `dirs`: every non-empty regular file, recursively.
/// Directories that do not exist contribute nothing.
pub fn count_seeds(dirs: &[PathBuf]) -> Result<usize> {
    let mut count = 0usize;
    for dir in dirs {
        if !dir.exists() {
            continue;
        }
        for entry in WalkDir::new(dir).follow_links(true) {
            let entry = entry.map_err(|e| {
                let msg = e.to_string();
                FuzzError::Io(e.into_io_error().unwrap_or_else(|| std::io::Error::other(msg)))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            if entry.metadata().map(|m| m.len() > 0).unwrap_or(false) {
                count += 1;
            }
        }
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn empty_files_are_not_seeds() {
        let tmp = tempfile::tempdir().unwrap();
        let a = tmp.path().join("a");
        let b = tmp.path().join("b");
        fs::create_dir_all(a.join("nested")).unwrap();
        fs::create_dir_all(&b).unwrap();

        fs::write(a.join("one"), b"1").unwrap();
        fs::write(a.join("two"), b"22").unwrap();
        fs::write(a.join("nested").join("three"), b"333").unwrap();
        fs::write(a.join("empty"), b"").unwrap();
        fs::write(b.join("four"), b"4").unwrap();
        fs::write(b.join("five"), b"5").unwrap();

        assert_eq!(count_seeds(&[a, b]).unwrap(), 5);
    }

    #[test]
    fn missing_dir_counts_zero() {
        let tmp = tempfile::tempdir().unwrap();
        assert_eq!(count_seeds(&[tmp.path().join("absent")]).unwrap(), 0);
    }
}
