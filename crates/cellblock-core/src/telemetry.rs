//! Tracing setup for the `cellblock` binary.
//!
//! Log lines go to stderr: stdout may be carrying a live terminal session.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

/// Install the global subscriber. `RUST_LOG` wins over `level` when set.
///
/// Only the first call in a process has any effect.
pub fn init_tracing(json: bool, level: Level) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},bollard=warn", level.as_str())));

    let output = fmt::layer().with_writer(std::io::stderr).with_target(false);
    let output = if json {
        output.json().flatten_event(true).boxed()
    } else {
        output.compact().boxed()
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(output)
        .try_init();
}

/// Level from a config string such as `"debug"`; unknown names mean `INFO`.
pub fn parse_level(name: &str) -> Level {
    name.parse().unwrap_or(Level::INFO)
}
