use anyhow::{anyhow, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable that overrides the log filter.
pub const LOG_ENV_VAR: &str = "RUST_LOG";

/// Default filter directive for the given verbosity.
pub fn default_directive(debug_mode: bool) -> &'static str {
    if debug_mode {
        "debug"
    } else {
        "warn"
    }
}

/// Setup logging to stderr.
///
/// `RUST_LOG` wins when set; otherwise `debug_mode` picks between debug and
/// warn level. Stdout is left to the console transcript.
pub fn setup_logging(debug_mode: bool) -> Result<()> {
    let env_filter = EnvFilter::try_from_env(LOG_ENV_VAR)
        .unwrap_or_else(|_| EnvFilter::new(default_directive(debug_mode)));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(debug_mode)
                .with_thread_ids(debug_mode),
        )
        .try_init()
        .map_err(|e| anyhow!("Failed to initialise logging: {}", e))?;

    tracing::debug!(debug = debug_mode, "logging initialized");
    Ok(())
}
