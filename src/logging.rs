//! Tracing subscriber setup.

use std::sync::OnceLock;

use tracing_subscriber::EnvFilter;

static TRACING: OnceLock<()> = OnceLock::new();

/// Install the global fmt subscriber. `RUST_LOG` wins over `default_filter`.
/// Safe to call more than once; only the first call has an effect.
pub fn init(default_filter: &str) {
    TRACING.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(default_filter))
            .unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .try_init();
        tracing::debug!("tracing initialized");
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init("debug");
        init("not a [valid filter");
        tracing::info!("still logging");
    }
}
