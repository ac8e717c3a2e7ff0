//! Log output for a meshtrack node.
//!
//! Events come from `tracing`. The CLI's `-v`/`-q` flags choose how much of
//! meshtrack's own output is shown; `RUST_LOG`, when set, replaces that choice
//! entirely.

use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// How much of the node's own activity to print.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verbosity {
    /// Errors only.
    Quiet,
    /// Cycle summaries, discovered peers and startup (info).
    #[default]
    Normal,
    /// Adds per-page merges and per-peer results (debug).
    Verbose,
    /// Everything.
    Trace,
}

impl Verbosity {
    /// Resolve the CLI flags. `quiet` wins over any number of `-v`.
    #[must_use]
    pub fn from_flags(quiet: bool, verbose: u8) -> Self {
        match (quiet, verbose) {
            (true, _) => Self::Quiet,
            (false, 0) => Self::Normal,
            (false, 1) => Self::Verbose,
            (false, _) => Self::Trace,
        }
    }

    /// The most detailed level shown for meshtrack's own events.
    #[must_use]
    pub fn level(self) -> Level {
        match self {
            Self::Quiet => Level::ERROR,
            Self::Normal => Level::INFO,
            Self::Verbose => Level::DEBUG,
            Self::Trace => Level::TRACE,
        }
    }
}

/// The filter used when `RUST_LOG` is not set.
///
/// hyper, reqwest and axum stay at warnings whatever the verbosity.
#[must_use]
pub fn default_filter(verbosity: Verbosity) -> String {
    format!("warn,meshtrack={}", verbosity.level())
}

/// Install the global subscriber. Call once, early in `main`.
///
/// ```no_run
/// use meshtrack::{init_logging, logging::Verbosity};
///
/// init_logging(Verbosity::from_flags(false, 1));
/// ```
pub fn init_logging(verbosity: Verbosity) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(verbosity)));

    let subscriber = tracing_subscriber::registry().with(filter).with(
        fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false),
    );

    // A subscriber may already be installed (tests, embedding).
    let _ = subscriber.try_init();
}

/// Route test output through the test harness, warnings and up unless
/// `RUST_LOG` says otherwise.
#[cfg(test)]
pub fn init_test_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_flags() {
        assert_eq!(Verbosity::from_flags(false, 0), Verbosity::Normal);
        assert_eq!(Verbosity::from_flags(false, 1), Verbosity::Verbose);
        assert_eq!(Verbosity::from_flags(false, 2), Verbosity::Trace);
        assert_eq!(Verbosity::from_flags(false, 9), Verbosity::Trace);
        assert_eq!(Verbosity::from_flags(true, 2), Verbosity::Quiet);
    }

    #[test]
    fn test_levels() {
        assert_eq!(Verbosity::Quiet.level(), Level::ERROR);
        assert_eq!(Verbosity::default().level(), Level::INFO);
        assert_eq!(Verbosity::Verbose.level(), Level::DEBUG);
        assert_eq!(Verbosity::Trace.level(), Level::TRACE);
    }

    #[test]
    fn test_default_filter_targets_crate() {
        assert_eq!(default_filter(Verbosity::Normal), "warn,meshtrack=INFO");
        assert_eq!(default_filter(Verbosity::Trace), "warn,meshtrack=TRACE");
        assert!(EnvFilter::try_new(default_filter(Verbosity::Verbose)).is_ok());
    }

    #[test]
    fn test_init_is_idempotent() {
        init_test_logging();
        init_logging(Verbosity::Quiet);
        init_logging(Verbosity::Trace);
    }
}
