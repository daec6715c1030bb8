use tracing_subscriber::EnvFilter;

/// Initializes the global tracing subscriber. `level` is the configured
/// `logging.level` directive; `RUST_LOG` in the environment still overrides it
/// per `EnvFilter`'s usual precedence.
pub fn init(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}
