use std::path::Path;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize tracing with a file writer in `log_dir`.
///
/// The terminal belongs to the map view, so nothing is written to stdout.
/// Default level: INFO for dependencies, DEBUG for this crate; override via
/// `RUST_LOG`.
pub fn init(log_dir: &Path, file_name: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,deal_atlas=debug"));

    let file_layer = fmt::layer()
        .with_writer(tracing_appender::rolling::never(log_dir, file_name))
        .with_ansi(false)
        .with_target(true)
        .with_line_number(true)
        .compact();

    // A second init (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .try_init();

    tracing::debug!("Tracing initialized");
}
