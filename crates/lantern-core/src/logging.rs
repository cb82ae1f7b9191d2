use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "LANTERN_LOG";

/// Installs a fmt subscriber filtered by `LANTERN_LOG`, then `RUST_LOG`, then `info`.
/// Returns `false` when a global subscriber was already set.
pub fn init_tracing() -> bool {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .is_ok()
}
