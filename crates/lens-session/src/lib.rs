//! Durable session and one-shot authorization code storage for RepoLens.
//!
//! The session store is device-scoped and survives restarts; the one-shot
//! store is tab-scoped and hands its code out exactly once. Both absorb
//! storage corruption and report it as absence.

mod oneshot_store;
mod session;
mod session_store;

pub use oneshot_store::*;
pub use session::*;
pub use session_store::*;
