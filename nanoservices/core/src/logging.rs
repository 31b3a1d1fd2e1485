use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber, filtering by `RUST_LOG` (default
/// `info`). Safe to call more than once; later calls are ignored.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Like [`init`], but `RUST_LOG` only overrides `level` when it is set.
pub fn init_with(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
