//! Helpers shared across the test suite.

/// Route tracing output into the test harness, honouring `RUST_LOG`.
/// Repeated calls are fine; only the first installs the subscriber.
pub(crate) fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
