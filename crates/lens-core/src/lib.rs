//! Foundational utilities shared across RepoLens crates.
//!
//! Atomic file writes and repository identifiers, plus the cooperative
//! cancellation token that owns background loops.

pub mod atomic_io;
pub mod cancellation;
pub mod identifiers;
pub mod time_utils;

pub use atomic_io::{remove_file_if_exists, write_text_atomic};
pub use cancellation::CooperativeCancellationToken;
pub use identifiers::{RepositoryId, RepositoryIdParseError};
pub use time_utils::current_unix_timestamp_ms;
