use tracing_subscriber::EnvFilter;

/// Route relay logs through the test harness; `RUST_LOG` picks the level
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_test_writer()
        .try_init()
        .ok();
}
