use std::env;
use std::fs;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Console output plus daily-rolling JSON files. `GIGDEX_LOG_DIR` overrides
/// where the files land (default `logs/`); `RUST_LOG` overrides the default
/// `gigdex=info` filter.
pub fn init_logging() {
    let log_dir = env::var("GIGDEX_LOG_DIR").unwrap_or_else(|_| "logs".to_string());
    let _ = fs::create_dir_all(&log_dir);

    let file_appender = tracing_appender::rolling::daily(&log_dir, "gigdex.log");
    let (non_blocking_writer, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer().json().with_writer(non_blocking_writer);
    let console_layer = fmt::layer().with_writer(std::io::stdout);

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("gigdex=info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(console_layer)
        .init();

    // The guard must outlive main so buffered lines flush on exit.
    std::mem::forget(guard);
}
