//! Logging setup for examples and tests.

/// Initialize a tracing subscriber tuned for the pipe server.
///
/// `RUST_LOG` takes precedence when set. Without it, warnings from the
/// manifold crates are still shown, so demo output surfaces loop and
/// transport failures without drowning the echo traffic in
/// per-completion traces. Safe to call more than once; later calls are
/// no-ops.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new("manifold=warn,manifold_core=warn")
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
