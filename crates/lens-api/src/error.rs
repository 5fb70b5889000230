use lens_auth::AuthExchangeError;
use lens_cache::FetchError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("backend rejected the session credential")]
    Unauthorized,
    #[error("backend {operation} failed with status {status}: {body}")]
    Status {
        operation: String,
        status: u16,
        body: String,
    },
    #[error("backend {operation} request failed: {message}")]
    Transport { operation: String, message: String },
    #[error("failed to decode backend {operation}: {message}")]
    Decode { operation: String, message: String },
    #[error("backend returned unrecognized repository access outcome '{0}'")]
    UnrecognizedOutcome(String),
}

impl ApiError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Unauthorized => Some(401),
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<ApiError> for FetchError {
    fn from(error: ApiError) -> Self {
        match error {
            ApiError::Unauthorized => FetchError::Unauthorized,
            ApiError::Status { status, body, .. } => FetchError::Status { status, body },
            ApiError::Transport { message, .. } => FetchError::Network(message),
            ApiError::Decode { message, .. } => FetchError::Decode(message),
            ApiError::UnrecognizedOutcome(tag) => {
                FetchError::Decode(format!("unrecognized outcome '{tag}'"))
            }
        }
    }
}

impl From<ApiError> for AuthExchangeError {
    fn from(error: ApiError) -> Self {
        match error {
            ApiError::Unauthorized => AuthExchangeError::InvalidCode("unauthorized".to_string()),
            ApiError::Status { status, body, .. } if (400..500).contains(&status) => {
                AuthExchangeError::InvalidCode(format!("status {status}: {body}"))
            }
            ApiError::Status { status, body, .. } => {
                AuthExchangeError::Network(format!("status {status}: {body}"))
            }
            ApiError::Transport { message, .. } => AuthExchangeError::Network(message),
            ApiError::Decode { message, .. } => AuthExchangeError::MalformedResponse(message),
            ApiError::UnrecognizedOutcome(tag) => AuthExchangeError::MalformedResponse(tag),
        }
    }
}
