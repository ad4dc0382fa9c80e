//! Daemon composition for mirage
//!
//! Loads a [`DaemonConfig`], opens the item state, and runs the scheduler
//! and change monitors for one sync root against any `RemoteStore`.

pub mod config;
pub mod daemon;
pub mod logging;

pub use config::{default_state_path, get_config_path, DaemonConfig};
pub use daemon::Daemon;
pub use logging::{env_filter, init_logging, DEFAULT_FILTER};
