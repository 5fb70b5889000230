//! Tab-scoped storage for a single-use authorization code.

use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
};

use anyhow::{bail, Context, Result};
use lens_core::{current_unix_timestamp_ms, remove_file_if_exists, write_text_atomic};
use serde::{Deserialize, Serialize};

const ONESHOT_STORE_SCHEMA_VERSION: u32 = 1;
pub const ONESHOT_CODE_FILE_NAME: &str = "oneshot-code.json";

static CLAIM_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Holds a one-shot code until its first read.
pub trait OneShotTokenStore: Send + Sync {
    fn put_code(&self, code: &str) -> Result<()>;

    /// Reads and removes the code; every later call returns `None`.
    fn take_code(&self) -> Option<String>;
}

#[derive(Debug, Serialize, Deserialize)]
struct OneShotCodeFile {
    schema_version: u32,
    code: String,
}

fn normalize_code(code: &str) -> Result<String> {
    let trimmed = code.trim();
    if trimmed.is_empty() {
        bail!("one-shot code must not be empty");
    }
    Ok(trimmed.to_string())
}

/// Sanitizes a tab identifier into a single path component.
pub fn sanitize_tab_id(raw: &str) -> String {
    let sanitized = raw
        .trim()
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect::<String>();
    if sanitized.is_empty() {
        "default".to_string()
    } else {
        sanitized
    }
}

/// File-backed one-shot store living in `<state_dir>/tabs/<tab_id>/`.
#[derive(Debug, Clone)]
pub struct FileOneShotTokenStore {
    path: PathBuf,
}

impl FileOneShotTokenStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn for_tab(state_dir: &Path, tab_id: &str) -> Self {
        Self::new(
            state_dir
                .join("tabs")
                .join(sanitize_tab_id(tab_id))
                .join(ONESHOT_CODE_FILE_NAME),
        )
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn claim_path(&self) -> PathBuf {
        let file_name = format!(
            ".{}.claim-{}-{}-{}",
            ONESHOT_CODE_FILE_NAME,
            std::process::id(),
            current_unix_timestamp_ms(),
            CLAIM_COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        match self.path.parent() {
            Some(parent) => parent.join(file_name),
            None => PathBuf::from(file_name),
        }
    }
}

impl OneShotTokenStore for FileOneShotTokenStore {
    fn put_code(&self, code: &str) -> Result<()> {
        let payload = OneShotCodeFile {
            schema_version: ONESHOT_STORE_SCHEMA_VERSION,
            code: normalize_code(code)?,
        };
        let encoded = serde_json::to_string(&payload).context("failed to encode one-shot code")?;
        write_text_atomic(&self.path, &encoded)
            .with_context(|| format!("failed to persist one-shot code to {}", self.path.display()))
    }

    fn take_code(&self) -> Option<String> {
        // Renaming claims the file; a concurrent taker sees NotFound.
        let claim_path = self.claim_path();
        match std::fs::rename(&self.path, &claim_path) {
            Ok(()) => {}
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return None,
            Err(error) => {
                tracing::warn!(
                    path = %self.path.display(),
                    %error,
                    "one-shot code could not be claimed"
                );
                return None;
            }
        }

        let raw = std::fs::read_to_string(&claim_path);
        if let Err(error) = remove_file_if_exists(&claim_path) {
            tracing::warn!(path = %claim_path.display(), %error, "failed to remove claimed code");
        }
        let raw = match raw {
            Ok(raw) => raw,
            Err(error) => {
                tracing::warn!(path = %claim_path.display(), %error, "claimed code unreadable");
                return None;
            }
        };
        match serde_json::from_str::<OneShotCodeFile>(&raw) {
            Ok(file) if file.schema_version == ONESHOT_STORE_SCHEMA_VERSION => {
                normalize_code(&file.code).ok()
            }
            Ok(file) => {
                tracing::warn!(
                    found = file.schema_version,
                    "unsupported one-shot code schema; discarding"
                );
                None
            }
            Err(error) => {
                tracing::warn!(%error, "one-shot code malformed; discarding");
                None
            }
        }
    }
}

/// Process-local one-shot store.
#[derive(Debug, Default)]
pub struct MemoryOneShotTokenStore {
    code: Mutex<Option<String>>,
}

impl MemoryOneShotTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_code(code: &str) -> Self {
        Self {
            code: Mutex::new(normalize_code(code).ok()),
        }
    }
}

impl OneShotTokenStore for MemoryOneShotTokenStore {
    fn put_code(&self, code: &str) -> Result<()> {
        let code = normalize_code(code)?;
        let mut guard = self.code.lock().unwrap_or_else(|poison| poison.into_inner());
        *guard = Some(code);
        Ok(())
    }

    fn take_code(&self) -> Option<String> {
        let mut guard = self.code.lock().unwrap_or_else(|poison| poison.into_inner());
        guard.take()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{
        sanitize_tab_id, FileOneShotTokenStore, MemoryOneShotTokenStore, OneShotTokenStore,
    };

    #[test]
    fn functional_file_oneshot_store_returns_code_exactly_once() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileOneShotTokenStore::for_tab(temp.path(), "tab-1");
        store.put_code(" abc123 ").expect("put");

        assert_eq!(store.take_code().as_deref(), Some("abc123"));
        assert_eq!(store.take_code(), None);
        assert!(!store.path().exists());
    }

    #[test]
    fn functional_file_oneshot_store_is_scoped_per_tab() {
        let temp = tempfile::tempdir().expect("tempdir");
        let first = FileOneShotTokenStore::for_tab(temp.path(), "tab-1");
        let second = FileOneShotTokenStore::for_tab(temp.path(), "tab-2");
        first.put_code("code-1").expect("put");

        assert_eq!(second.take_code(), None);
        assert_eq!(first.take_code().as_deref(), Some("code-1"));
    }

    #[test]
    fn regression_file_oneshot_store_discards_malformed_payload() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileOneShotTokenStore::for_tab(temp.path(), "tab-1");
        std::fs::create_dir_all(store.path().parent().expect("parent")).expect("mkdir");
        std::fs::write(store.path(), "garbage").expect("seed");

        assert_eq!(store.take_code(), None);
        assert!(!store.path().exists(), "malformed code must still be consumed");
    }

    #[test]
    fn integration_file_oneshot_store_concurrent_takers_see_single_code() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(FileOneShotTokenStore::for_tab(temp.path(), "tab-1"));
        store.put_code("abc123").expect("put");

        let handles = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || store.take_code())
            })
            .collect::<Vec<_>>();
        let taken = handles
            .into_iter()
            .filter_map(|handle| handle.join().expect("join"))
            .collect::<Vec<_>>();
        assert_eq!(taken, vec!["abc123".to_string()]);
    }

    #[test]
    fn unit_put_code_rejects_blank_code() {
        let store = MemoryOneShotTokenStore::new();
        assert!(store.put_code("   ").is_err());
        assert_eq!(store.take_code(), None);
    }

    #[test]
    fn unit_memory_oneshot_store_take_is_single_use() {
        let store = MemoryOneShotTokenStore::with_code("abc123");
        assert_eq!(store.take_code().as_deref(), Some("abc123"));
        assert_eq!(store.take_code(), None);
    }

    #[test]
    fn unit_sanitize_tab_id_flattens_path_characters() {
        assert_eq!(sanitize_tab_id("../tab 1"), "___tab_1");
        assert_eq!(sanitize_tab_id("  "), "default");
    }
}
