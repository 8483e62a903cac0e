use tracing::Level;

/// Maps a configured level name to a tracing level. Unknown names fall back
/// to `INFO`.
#[must_use]
pub fn parse_level(level: &str) -> Level {
    match level.trim().to_ascii_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Installs the global fmt subscriber at the given level.
///
/// # Panics
/// Panics if a global subscriber has already been installed.
pub fn init(level: &str) {
    tracing_subscriber::fmt()
        .with_max_level(parse_level(level))
        .init();
}
