//! Subscriber setup for the `tracing` output of drainflow.
//!
//! Every component logs through `tracing` macros with structured fields
//! (`unit`, `round`, `kind`). Nothing is printed until the host installs a
//! subscriber, either its own or the one from [`init_tracing`].

use tracing_subscriber::fmt;
use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset or invalid.
pub const DEFAULT_FILTER: &str = "drainflow=info";

/// Builds the filter from `RUST_LOG`, falling back to [`DEFAULT_FILTER`].
#[must_use]
pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Installs a global formatting subscriber.
///
/// With `json` set, each event is written as one JSON object per line.
/// Returns false if a global subscriber was already installed.
pub fn init_tracing(json: bool) -> bool {
    let builder = fmt().with_env_filter(env_filter()).with_thread_names(true);
    let result = if json {
        builder.json().with_current_span(false).try_init()
    } else {
        builder.with_target(true).try_init()
    };
    match result {
        Ok(()) => {
            tracing::debug!(json, "Tracing subscriber installed");
            true
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_refused() {
        init_tracing(false);
        assert!(!init_tracing(true));
    }

    #[test]
    fn test_default_filter_parses() {
        assert!(EnvFilter::try_new(DEFAULT_FILTER).is_ok());
    }
}
