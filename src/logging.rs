//! Log setup for the `axiom` binary.
//!
//! Logs go to stderr so `query` and `ask` output on stdout stays clean.
//! Verbosity follows `RUST_LOG` (default `info`); `--verbose` raises the
//! crate's own events to `debug`.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

fn filter(verbose: bool) -> EnvFilter {
    let fallback = if verbose { "info,axiom_rag=debug" } else { "info" };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback))
}

/// Install the global subscriber. Safe to call more than once; later
/// calls are ignored.
pub fn init(verbose: bool) {
    let layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    let _ = tracing_subscriber::registry()
        .with(filter(verbose))
        .with(layer)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice_is_harmless() {
        init(false);
        init(true);
        tracing::info!("still logging");
    }
}
