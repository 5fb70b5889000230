use thiserror::Error;

/// Failure of a cache-mediated backend read.
///
/// Cloneable so one failed fetch can be reported to every requester that
/// shared it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Network(String),
    #[error("backend returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("failed to decode response: {0}")]
    Decode(String),
    #[error("session rejected by backend")]
    Unauthorized,
    #[error("fetch aborted: {0}")]
    Aborted(String),
}
