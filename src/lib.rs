//! mirage workspace root
//!
//! Re-exports the member crates so the workspace-level scenario tests can
//! drive the whole engine through one dependency.

pub use mirage_daemon as daemon;
pub use mirage_index as index;
pub use mirage_sync as sync;
