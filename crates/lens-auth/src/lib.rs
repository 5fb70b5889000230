//! One-shot authorization code exchange for RepoLens.
//!
//! [`AuthExchangeCoordinator`] turns a captured one-shot code into a
//! [`lens_session::Session`] at most once per code value, falling back to the
//! previously trusted session when the exchange fails.

mod coordinator;
mod error;
mod registry;

pub use coordinator::*;
pub use error::*;
pub use registry::*;
