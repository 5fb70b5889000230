use async_trait::async_trait;
use lens_cache::FetchError;
use lens_core::RepositoryId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Backend-reported analysis job state.
pub enum JobState {
    Queued,
    Analyzing,
    Ready,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ready | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Analyzing => "analyzing",
            Self::Ready => "ready",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    pub repository_id: RepositoryId,
    pub state: JobState,
    pub last_observed_unix_ms: u64,
}

/// Where job states come from. Implemented by the HTTP client.
#[async_trait]
pub trait JobStatusSource: Send + Sync {
    async fn fetch_status(&self, repository: &RepositoryId) -> Result<JobState, FetchError>;
}
