//! Opt-in log output for tests and debugging sessions.

/// Install a `tracing` fmt subscriber filtered by `RUST_LOG`.
///
/// Does nothing unless `RUST_LOG` is present in the environment, and
/// quietly yields if some other subscriber won the race, so every test
/// can call it unconditionally from its first line.
pub fn init_tracing() {
    if std::env::var("RUST_LOG").is_err() {
        return;
    }
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}
