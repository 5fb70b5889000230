//! Analysis-job status polling for RepoLens.
//!
//! [`AnalysisJobPoller`] checks a repository's analysis job until it reaches a
//! terminal state, then invalidates that repository's cached views once.

mod job;
mod poller;

pub use job::{JobState, JobStatus, JobStatusSource};
pub use poller::{AnalysisJobPoller, PollHandle, PollOutcome, PollPhase, PollSettings, PollSnapshot};
