//! Tracing subscriber setup and span timing for the orchestration core.

use std::time::Instant;
use tracing_subscriber::EnvFilter;

/// Installs the global tracing subscriber.
///
/// Filter directives come from `RUST_LOG`; when the variable is unset or
/// unparsable, `default_directive` applies (e.g. `"conveyor=info"`).
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn try_init_tracing(
    default_directive: &str,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
}

/// Installs the global tracing subscriber, ignoring an already-installed one.
///
/// Embedders and test harnesses often install their own subscriber first;
/// this variant lets them win.
pub fn init_tracing(default_directive: &str) {
    let _ = try_init_tracing(default_directive);
}

/// Simple span timing helper.
#[derive(Debug)]
pub struct SpanTimer {
    start: Instant,
}

impl SpanTimer {
    /// Starts a new span timer.
    #[must_use]
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Returns the elapsed time in milliseconds.
    #[must_use]
    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }
}
