use anyhow::Result;
use tracing_subscriber::EnvFilter;

const LEVELS: [&str; 6] = ["off", "error", "warn", "info", "debug", "trace"];

/// Install the global fmt subscriber. `RUST_LOG` takes precedence over `level`.
pub fn init(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("logging already initialised: {e}"))
}

/// Map a 0..=5 verbosity onto a level name; anything above 5 is `trace`.
pub fn level_for_verbosity(verbosity: u8) -> &'static str {
    LEVELS[usize::from(verbosity).min(LEVELS.len() - 1)]
}

/// Install the subscriber at a numeric verbosity.
pub fn set_verbosity(verbosity: u8) -> Result<()> {
    init(level_for_verbosity(verbosity))
}
