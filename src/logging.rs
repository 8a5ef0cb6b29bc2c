//! Diagnostic logging via `tracing`, written to stderr so it never mixes
//! with shell output.

use anyhow::{anyhow, Result};
use tracing_subscriber::EnvFilter;

/// Environment variable holding a tracing filter, e.g. `medadmin=debug`
pub const LOG_ENV: &str = "MEDADMIN_LOG";

pub fn default_filter(verbose: bool, debug: bool) -> &'static str {
    if debug {
        "medadmin=debug"
    } else if verbose {
        "medadmin=info"
    } else {
        "warn"
    }
}

/// Install the global subscriber. `MEDADMIN_LOG` wins over the flags.
pub fn init(verbose: bool, debug: bool) -> Result<()> {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_new(default_filter(verbose, debug)))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(debug)
        .try_init()
        .map_err(|e| anyhow!("Failed to init logging: {}", e))
}
