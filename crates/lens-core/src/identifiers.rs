use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Backend identifier of an analysed repository.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RepositoryId(String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryIdParseError(String);

impl fmt::Display for RepositoryIdParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid repository id '{}'", self.0)
    }
}

impl std::error::Error for RepositoryIdParseError {}

impl RepositoryId {
    pub fn new(raw: impl Into<String>) -> Result<Self, RepositoryIdParseError> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.contains('/') || trimmed.chars().any(char::is_whitespace)
        {
            return Err(RepositoryIdParseError(raw));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for RepositoryId {
    type Err = RepositoryIdParseError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Self::new(raw)
    }
}

impl fmt::Display for RepositoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
