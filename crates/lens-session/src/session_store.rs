//! Device-scoped persistence for the authoritative [`Session`].

use std::{
    path::{Path, PathBuf},
    sync::Mutex,
};

use anyhow::{Context, Result};
use lens_core::{remove_file_if_exists, write_text_atomic};
use serde::{Deserialize, Serialize};

use crate::session::Session;

const SESSION_STORE_SCHEMA_VERSION: u32 = 1;
pub const SESSION_STORE_FILE_NAME: &str = "session.json";

/// Durable storage for the authoritative session.
///
/// `load` never fails: unreadable or malformed data is reported as `None`.
pub trait PersistentSessionStore: Send + Sync {
    fn load(&self) -> Option<Session>;
    fn save(&self, session: &Session) -> Result<()>;
    fn clear(&self) -> Result<()>;
}

#[derive(Debug, Serialize, Deserialize)]
struct SessionStoreFile {
    schema_version: u32,
    session: Session,
}

/// Session store backed by one JSON file under the state directory.
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    path: PathBuf,
}

impl FileSessionStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn in_state_dir(state_dir: &Path) -> Self {
        Self::new(state_dir.join(SESSION_STORE_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PersistentSessionStore for FileSessionStore {
    fn load(&self) -> Option<Session> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return None,
            Err(error) => {
                tracing::warn!(
                    path = %self.path.display(),
                    %error,
                    "session store unreadable; treating as signed out"
                );
                return None;
            }
        };
        let parsed = match serde_json::from_str::<SessionStoreFile>(&raw) {
            Ok(parsed) => parsed,
            Err(error) => {
                tracing::warn!(
                    path = %self.path.display(),
                    %error,
                    "session store malformed; treating as signed out"
                );
                return None;
            }
        };
        if parsed.schema_version != SESSION_STORE_SCHEMA_VERSION {
            tracing::warn!(
                path = %self.path.display(),
                expected = SESSION_STORE_SCHEMA_VERSION,
                found = parsed.schema_version,
                "unsupported session store schema; treating as signed out"
            );
            return None;
        }
        if !parsed.session.is_valid() {
            tracing::warn!(path = %self.path.display(), "stored session incomplete; ignoring");
            return None;
        }
        Some(parsed.session)
    }

    fn save(&self, session: &Session) -> Result<()> {
        let payload = SessionStoreFile {
            schema_version: SESSION_STORE_SCHEMA_VERSION,
            session: session.clone(),
        };
        let encoded =
            serde_json::to_string_pretty(&payload).context("failed to encode session store")?;
        write_text_atomic(&self.path, &encoded)
            .with_context(|| format!("failed to persist session to {}", self.path.display()))
    }

    fn clear(&self) -> Result<()> {
        remove_file_if_exists(&self.path)?;
        Ok(())
    }
}

/// Process-local session store.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    session: Mutex<Option<Session>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session(session: Session) -> Self {
        Self {
            session: Mutex::new(Some(session)),
        }
    }
}

impl PersistentSessionStore for MemorySessionStore {
    fn load(&self) -> Option<Session> {
        let guard = self.session.lock().unwrap_or_else(|poison| poison.into_inner());
        guard.clone().filter(Session::is_valid)
    }

    fn save(&self, session: &Session) -> Result<()> {
        let mut guard = self.session.lock().unwrap_or_else(|poison| poison.into_inner());
        *guard = Some(session.clone());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let mut guard = self.session.lock().unwrap_or_else(|poison| poison.into_inner());
        *guard = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{FileSessionStore, MemorySessionStore, PersistentSessionStore};
    use crate::session::{Session, SessionCredential};

    fn sample_session() -> Session {
        Session::new("user-7", SessionCredential::new("token-7"), 1_700_000_000_000)
    }

    #[test]
    fn functional_file_session_store_round_trips_and_clears() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileSessionStore::in_state_dir(temp.path());
        assert!(store.load().is_none());

        store.save(&sample_session()).expect("save");
        assert_eq!(store.load(), Some(sample_session()));

        store.clear().expect("clear");
        assert!(store.load().is_none());
        store.clear().expect("clearing twice is harmless");
    }

    #[test]
    fn regression_file_session_store_treats_malformed_json_as_absent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileSessionStore::in_state_dir(temp.path());
        std::fs::write(store.path(), "{not json").expect("seed");
        assert!(store.load().is_none());
    }

    #[test]
    fn regression_file_session_store_rejects_partial_session() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileSessionStore::in_state_dir(temp.path());
        std::fs::write(
            store.path(),
            r#"{"schema_version":1,"session":{"user_id":"","credential":"t","issued_at_unix_ms":1}}"#,
        )
        .expect("seed");
        assert!(store.load().is_none());
    }

    #[test]
    fn regression_file_session_store_rejects_unknown_schema_version() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileSessionStore::in_state_dir(temp.path());
        std::fs::write(
            store.path(),
            r#"{"schema_version":99,"session":{"user_id":"u","credential":"t","issued_at_unix_ms":1}}"#,
        )
        .expect("seed");
        assert!(store.load().is_none());
    }

    #[test]
    fn unit_memory_session_store_saves_and_clears() {
        let store = MemorySessionStore::new();
        assert!(store.load().is_none());
        store.save(&sample_session()).expect("save");
        assert_eq!(store.load(), Some(sample_session()));
        store.clear().expect("clear");
        assert!(store.load().is_none());
    }
}
