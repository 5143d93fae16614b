/// Install the fmt subscriber at `level` (`error|warn|info|debug|trace`; anything else means info).
///
/// Uses `try_init`, so a second call (tests, embedding) is a no-op.
pub fn init(level: &str) {
    let lvl = match level.to_lowercase().as_str() {
        "error" => tracing::Level::ERROR,
        "warn" | "warning" => tracing::Level::WARN,
        "debug" => tracing::Level::DEBUG,
        "trace" => tracing::Level::TRACE,
        _ => tracing::Level::INFO,
    };

    let _ = tracing_subscriber::fmt()
        .with_max_level(lvl)
        .with_target(false)
        .try_init();
}
