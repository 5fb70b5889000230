use thiserror::Error;

/// Failure of a single `/auth/exchange` call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthExchangeError {
    #[error("authorization code rejected: {0}")]
    InvalidCode(String),
    #[error("exchange request failed: {0}")]
    Network(String),
    #[error("malformed exchange response: {0}")]
    MalformedResponse(String),
}

/// Terminal authentication failure surfaced to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("no session available; sign in required")]
    Unauthenticated,
    #[error("code exchange failed and no trusted session exists: {0}")]
    ExchangeFailed(AuthExchangeError),
}
