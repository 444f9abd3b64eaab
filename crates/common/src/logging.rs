//! Tracing setup for the VRR workspace crates.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install the global tracing subscriber with human-readable output.
///
/// Log levels come from the RUST_LOG environment variable, defaulting to
/// INFO. Later calls are no-ops once a subscriber is installed, so test
/// binaries may call this from every test.
pub fn init() {
    let _ = tracing_subscriber::registry()
        .with(fmt::layer())
        .with(env_filter())
        .try_init();
}

/// Like [`init`] but with JSON-formatted output for log collectors.
pub fn init_json() {
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().json())
        .with(env_filter())
        .try_init();
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_init_is_repeatable() {
        super::init();
        super::init();
        // A second flavor after a subscriber is installed is also a no-op.
        super::init_json();
    }
}
