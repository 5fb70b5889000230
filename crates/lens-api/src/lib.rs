//! HTTP client for the RepoLens backend.
//!
//! [`BackendClient`] implements the exchange seam used by `lens-auth` and the
//! status seam used by `lens-poller`, and exposes the list and resource reads
//! the client facade caches.

mod client;
mod error;
pub mod retry;
mod types;

pub use client::{BackendClient, BackendClientConfig};
pub use error::ApiError;
pub use types::*;
