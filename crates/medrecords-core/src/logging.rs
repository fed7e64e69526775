//! Log output for the host app.

use tracing_subscriber::EnvFilter;

/// Install a formatted subscriber filtered by `filter` (e.g. `"medrecords_core=debug"`).
///
/// An invalid filter falls back to `info`. Returns false if a subscriber was
/// already installed.
pub fn init(filter: &str) -> bool {
    let filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));

    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok();

    if installed {
        tracing::info!("logging initialized");
    }
    installed
}
