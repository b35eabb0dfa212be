//! Logging setup.
//!
//! Initialisation is idempotent: the embedding application may have already
//! installed a logger, and the node starter calls this on every start, so a
//! second attempt is simply ignored.

/// Initialises logging from the `RUST_LOG` environment variable. Without
/// directives no logger is installed.
pub fn init_logging() {
    if let Ok(directives) = ::std::env::var("RUST_LOG") {
        init_logging_with_directives(&directives);
    }
}

/// Initialises logging with explicit `directives`.
pub fn init_logging_with_directives(directives: &str) {
    let installed = pretty_env_logger::formatted_timed_builder()
        .parse_filters(directives)
        .format_timestamp_millis()
        .try_init();
    if installed.is_ok() {
        log::info!("Logging enabled with directives: {directives}");
    }
}
