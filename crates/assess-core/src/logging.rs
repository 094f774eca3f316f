use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "ASSESS_LOG";

/// Installs the process-wide fmt subscriber, logging to stderr.
///
/// The filter comes from `ASSESS_LOG`, then `RUST_LOG`, then `default_directive`.
/// Later calls are no-ops.
pub fn init_tracing(default_directive: &str) {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
