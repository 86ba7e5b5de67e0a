//! Structured logging via `tracing`, with a reloadable level filter so the
//! `--log-level` CLI flag can be re-applied without restarting.

use std::fmt;

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::Layer as FmtLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::reload::{self, Handle};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

/// The running logger's reload handle.
pub struct Logger {
    filter: Handle<EnvFilter, Registry>,
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger").finish_non_exhaustive()
    }
}

impl Logger {
    /// Install the global subscriber. Panics if one is already installed.
    pub fn launch(level: LevelFilter) -> &'static Logger {
        let filter = EnvFilter::default().add_directive(level.into());
        let (filter, handle) = reload::Layer::new(filter);

        let layer = FmtLayer::new().with_writer(std::io::stderr);
        tracing_subscriber::registry().with(filter).with(layer).init();

        Box::leak(Box::new(Logger { filter: handle }))
    }

    pub fn set_level(&self, level: LevelFilter) -> Result<(), String> {
        self.filter
            .reload(EnvFilter::default().add_directive(level.into()))
            .map_err(|e| e.to_string())
    }
}

/// Parse a `--log-level` value: `0` is errors only, increasing verbosity
/// up to `4` (trace).
pub fn level_from_verbosity(n: u8) -> LevelFilter {
    match n {
        0 => LevelFilter::ERROR,
        1 => LevelFilter::WARN,
        2 => LevelFilter::INFO,
        3 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}
