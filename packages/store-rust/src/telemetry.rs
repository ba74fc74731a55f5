//! Tracing subscriber setup for binaries embedding the store.
//!
//! The filter comes from `RUST_LOG` when set, otherwise from the level
//! passed in. Library code only emits events; installing a subscriber is
//! the host's call.

use tracing_subscriber::EnvFilter;

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Installs a global `fmt` subscriber.
///
/// Returns `false` when a subscriber was already installed, which is the
/// normal case in tests.
pub fn init_tracing(level: &str, format: LogFormat) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    match format {
        LogFormat::Text => builder.try_init().is_ok(),
        LogFormat::Json => builder.json().try_init().is_ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_rejected() {
        init_tracing("warn", LogFormat::Text);
        assert!(!init_tracing("debug", LogFormat::Json));
    }
}
