//! Logging configuration using tracing.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use super::env_flag;

/// Picks the level from the CLI flags and the `TRACE`/`DEBUG` environment
/// switches; trace beats debug.
pub fn resolve_level(trace: bool, debug: bool, level: &str) -> String {
    if trace || env_flag("TRACE") {
        "trace".to_string()
    } else if debug || env_flag("DEBUG") {
        "debug".to_string()
    } else {
        level.to_string()
    }
}

/// Colour is on unless `--no-color`, `NOCOLOR` or `nocolor` says otherwise.
pub fn use_colour(no_color: bool) -> bool {
    !(no_color || env_flag("NOCOLOR") || env_flag("nocolor"))
}

/// Initialize logging on stderr. `RUST_LOG` wins over `level`.
pub fn init(level: &str, ansi: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(ansi),
        )
        .try_init()?;

    Ok(())
}
