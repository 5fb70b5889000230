//! Crash-safe writes for the client's state files (the session record and
//! the per-tab one-shot code).
//!
//! A state file is replaced by renaming a sibling temp file over it, so a
//! reader sees either the previous record or the new one.

use std::{
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

use anyhow::{bail, Context, Result};

use crate::time_utils::current_unix_timestamp_ms;

static TEMP_SEQUENCE: AtomicU64 = AtomicU64::new(0);

fn sibling_temp_path(directory: &Path, target: &Path) -> PathBuf {
    let stem = target
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("lens-state");
    directory.join(format!(
        ".{stem}.{}-{}-{}.partial",
        std::process::id(),
        current_unix_timestamp_ms(),
        TEMP_SEQUENCE.fetch_add(1, Ordering::Relaxed)
    ))
}

/// Replaces `path` with `content`, creating parent directories as needed.
pub fn write_text_atomic(path: &Path, content: &str) -> Result<()> {
    if path.as_os_str().is_empty() {
        bail!("state file path cannot be empty");
    }
    if path.is_dir() {
        bail!("state file path '{}' is a directory", path.display());
    }

    let directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(directory)
        .with_context(|| format!("failed to create state directory {}", directory.display()))?;

    let staged = sibling_temp_path(directory, path);
    std::fs::write(&staged, content)
        .with_context(|| format!("failed to stage {}", staged.display()))?;
    if let Err(error) = std::fs::rename(&staged, path) {
        let _ = std::fs::remove_file(&staged);
        return Err(error).with_context(|| {
            format!("failed to move {} into place at {}", staged.display(), path.display())
        });
    }
    Ok(())
}

/// Removes `path`; `Ok(false)` when there was nothing to remove.
pub fn remove_file_if_exists(path: &Path) -> Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(error) => Err(error).with_context(|| format!("failed to remove {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::{remove_file_if_exists, write_text_atomic};

    #[test]
    fn functional_overwrite_leaves_no_staging_files_behind() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("state").join("session.json");

        write_text_atomic(&path, "{\"v\":1}").expect("first write");
        write_text_atomic(&path, "{\"v\":2}").expect("second write");

        assert_eq!(std::fs::read_to_string(&path).expect("read"), "{\"v\":2}");
        let entries = std::fs::read_dir(path.parent().expect("parent"))
            .expect("read dir")
            .count();
        assert_eq!(entries, 1);
    }

    #[test]
    fn regression_directory_target_is_rejected() {
        let temp = tempdir().expect("tempdir");
        let error = write_text_atomic(temp.path(), "x").expect_err("directory target");
        assert!(error.to_string().contains("is a directory"));
    }

    #[test]
    fn unit_remove_reports_whether_a_file_existed() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("oneshot-code.json");
        std::fs::write(&path, "{}").expect("seed");

        assert!(remove_file_if_exists(&path).expect("remove"));
        assert!(!remove_file_if_exists(&path).expect("second remove"));
    }
}
