use tracing_subscriber::EnvFilter;

/// Initialize tracing. `default_level` comes from the server config and
/// seeds the filter; `RUST_LOG` directives override it, so per-module
/// levels like `omnibus::durable=debug` work without touching config.
pub fn init(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    // try_init so tests and embedding applications can call this repeatedly
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
