use tracing_subscriber::EnvFilter;

/// Default directive when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str = "info,mirage_sync=info,mirage_index=warn";

/// Build the filter from `RUST_LOG`, falling back to `default`
pub fn env_filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Install the global fmt subscriber
///
/// Returns false when a subscriber was already installed, which happens
/// when the daemon is embedded in a host that set up its own.
pub fn init_logging(default: &str) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(default))
        .try_init()
        .is_ok()
}
