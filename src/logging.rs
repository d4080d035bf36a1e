//! Process-wide tracing setup.

use tracing_subscriber::EnvFilter;

/// Install the global subscriber: `RUST_LOG` when set, otherwise `info`
/// (`debug` with `verbose`). Safe to call more than once; later calls
/// keep the subscriber that is already installed.
pub fn init(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    if let Err(err) = tracing_subscriber::fmt().with_env_filter(filter).try_init() {
        tracing::debug!(error = %err, "Tracing subscriber already installed");
    }
}
