// Tracing setup for the bridge daemon. Libraries only emit events; the
// binary decides where they go.
use tracing_subscriber::EnvFilter;

/// Install the global subscriber: env-filtered, formatted to stderr.
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
