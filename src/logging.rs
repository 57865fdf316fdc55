//! Tracing subscriber setup for the exporter binary.

use anyhow::Result;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is not set.
pub fn default_directive(debug: bool, verbose: bool) -> &'static str {
    if debug {
        "debug"
    } else if verbose {
        "info"
    } else {
        "warn,apprelease_exporter=info"
    }
}

/// Installs the global subscriber. Must be called once, before anything logs.
///
/// `RUST_LOG` overrides the level derived from `debug` and `verbose`. With
/// `json` every event is written as one JSON object per line.
pub fn init_tracing(debug: bool, verbose: bool, json: bool) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(debug, verbose)));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .map_err(|e| anyhow::anyhow!("failed to initialize JSON tracing subscriber: {}", e))?;
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(debug))
            .try_init()
            .map_err(|e| anyhow::anyhow!("failed to initialize tracing subscriber: {}", e))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directive() {
        assert_eq!(default_directive(true, true), "debug");
        assert_eq!(default_directive(false, true), "info");
        assert_eq!(default_directive(false, false), "warn,apprelease_exporter=info");
    }
}
