use std::str::FromStr;
use tracing::Level;

/// Install the fmt subscriber at INFO. Safe to call more than once.
pub fn init_tracing() {
    init_tracing_with_level(Level::INFO);
}

/// Logs go to stderr: stdout of a worker process carries the online handshake.
pub fn init_tracing_with_level(level: Level) {
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Parse a level name, falling back to INFO
pub fn parse_level(name: &str) -> Level {
    Level::from_str(name).unwrap_or(Level::INFO)
}
