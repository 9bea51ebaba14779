//! Tracing setup helpers.

use tracing_subscriber::EnvFilter;

/// Installs a global `tracing` subscriber for pipeline logs.
///
/// The filter is taken from `RUST_LOG` when set, falling back to
/// `default_filter` (e.g. `"conveyor=debug"`). Fails if a subscriber is
/// already installed.
pub fn init_tracing(default_filter: &str) -> anyhow::Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|error| anyhow::anyhow!("failed to install tracing subscriber: {error}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_fails() {
        // The first install may race with nothing else in this test binary;
        // the second must always be refused.
        let _ = init_tracing("conveyor=debug");
        assert!(init_tracing("conveyor=debug").is_err());
    }
}
