use std::fmt;

use serde::{Deserialize, Serialize};

/// Bearer credential issued by the backend. Never printed.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionCredential(String);

impl SessionCredential {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Returns the plaintext credential for explicit use sites.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for SessionCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl fmt::Display for SessionCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

/// Authenticated identity shared by every backend read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub user_id: String,
    pub credential: SessionCredential,
    pub issued_at_unix_ms: u64,
}

impl Session {
    pub fn new(
        user_id: impl Into<String>,
        credential: SessionCredential,
        issued_at_unix_ms: u64,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            credential,
            issued_at_unix_ms,
        }
    }

    /// A session missing its user id or credential is never authoritative.
    pub fn is_valid(&self) -> bool {
        !self.user_id.trim().is_empty() && !self.credential.is_blank()
    }
}
