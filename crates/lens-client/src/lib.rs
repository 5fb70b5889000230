//! RepoLens client: authentication, cached repository views, and analysis
//! refresh tracking behind one facade.

pub mod bootstrap;
pub mod cli;
mod client;
mod config;
mod view_state;

pub use client::LensClient;
pub use config::{ClientConfig, DEFAULT_CONFIG_FILE, DEFAULT_STATE_DIR, DEFAULT_TAB_ID};
pub use view_state::ViewState;
