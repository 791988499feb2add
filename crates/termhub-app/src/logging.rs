use anyhow::{anyhow, Context, Result};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install the global subscriber.
///
/// Logs go to stderr so they never interleave with terminal output on stdout.
pub fn init(filter: &str) -> Result<()> {
    let filter = EnvFilter::try_new(filter).with_context(|| format!("Invalid log filter: {}", filter))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_target(true))
        .with(filter)
        .try_init()
        .map_err(|e| anyhow!("Failed to install log subscriber: {}", e))
}
