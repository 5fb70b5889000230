use lens_core::RepositoryId;
use lens_poller::JobState;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ApiError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageInfo {
    pub page: u32,
    pub page_size: u32,
    #[serde(default)]
    pub total_items: u64,
    #[serde(default)]
    pub has_next: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page_info: PageInfo,
}

impl<T> Page<T> {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositorySummary {
    pub id: RepositoryId,
    pub name: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub default_branch: Option<String>,
    #[serde(default)]
    pub analysis_state: Option<JobState>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    pub name: String,
    #[serde(default)]
    pub is_default: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub sha: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub committed_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    pub title: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub author: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryFile {
    pub id: String,
    pub path: String,
    #[serde(default)]
    pub language: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    pub id: String,
    pub body: String,
    #[serde(default)]
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub message: String,
    #[serde(default)]
    pub read: bool,
    #[serde(default)]
    pub repository_id: Option<RepositoryId>,
}

/// Aggregated repository metrics; the shape is owned by the backend.
pub type Analytics = Value;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryStatus {
    pub repository_id: RepositoryId,
    pub state: JobState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshAccepted {
    pub accepted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ExchangeResponse {
    #[serde(default)]
    pub(crate) user_id: String,
    #[serde(default)]
    pub(crate) token: String,
    #[serde(default)]
    pub(crate) issued_at_unix_ms: Option<u64>,
}

/// Result of asking the backend for access to a repository URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RepositoryAccessOutcome {
    AlreadyHasAccess { repository_id: RepositoryId },
    AccessGranted { repository_id: RepositoryId },
    AnalysisStarted { repository_id: RepositoryId },
    #[serde(other)]
    Unrecognized,
}

impl RepositoryAccessOutcome {
    pub fn repository_id(&self) -> Option<&RepositoryId> {
        match self {
            Self::AlreadyHasAccess { repository_id }
            | Self::AccessGranted { repository_id }
            | Self::AnalysisStarted { repository_id } => Some(repository_id),
            Self::Unrecognized => None,
        }
    }

    /// True when the backend started a job the caller should poll.
    pub fn starts_analysis(&self) -> bool {
        matches!(self, Self::AnalysisStarted { .. })
    }
}

/// Decodes an access outcome, rejecting missing or unknown tags instead of
/// guessing their meaning.
pub(crate) fn decode_access_outcome(raw: Value) -> Result<RepositoryAccessOutcome, ApiError> {
    let tag = match raw.get("outcome").and_then(Value::as_str) {
        Some(tag) => tag.to_string(),
        None => return Err(ApiError::UnrecognizedOutcome("<missing>".to_string())),
    };
    let outcome = serde_json::from_value::<RepositoryAccessOutcome>(raw).map_err(|error| {
        ApiError::Decode {
            operation: "repository access".to_string(),
            message: error.to_string(),
        }
    })?;
    match outcome {
        RepositoryAccessOutcome::Unrecognized => Err(ApiError::UnrecognizedOutcome(tag)),
        known => Ok(known),
    }
}
