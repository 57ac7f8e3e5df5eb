use tracing_subscriber::EnvFilter;

/// Initialize structured logging on stderr.
///
/// `RUST_LOG` wins when set; otherwise `log_level` applies. Stdout is left alone so
/// `--dry-run` output stays machine-readable.
pub fn init(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
