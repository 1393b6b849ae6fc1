//! Host diagnostics.
//!
//! Weft runs many VMs at once: the main driver, one `weft-child` driver
//! thread per spawned runtime, and the `weft-worker-*` pool. Those threads
//! are named at spawn time, and the subscriber prints the emitting thread's
//! name on every line, so a log trace stays attributable when several
//! runtimes are making progress at the same moment.
//!
//! Diagnostics go to stderr; stdout belongs to the scripts (`print` and
//! module output must stay machine-readable).

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer, Registry};

/// Verbosity of host-side diagnostics. Script-raised errors and stack
/// traces bypass the logger entirely and always reach stderr.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    /// Quiet enough that a clean run prints nothing but script output.
    #[default]
    Warn,
    Error,
}

impl LogLevel {
    fn as_filter(self) -> LevelFilter {
        match self {
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

/// Install the global subscriber at the default level.
pub fn init() {
    init_with_level(LogLevel::default());
}

/// Install the global subscriber. Lines render as
/// `LEVEL ThreadName message`; the thread name is the runtime identity.
/// Installing twice is a no-op, so embedders that bring their own
/// subscriber win.
pub fn init_with_level(level: LogLevel) {
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .without_time()
        .with_target(false)
        .with_thread_names(true)
        .compact()
        .with_filter(level.as_filter());

    let _ = Registry::default().with(layer).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_level_keeps_clean_runs_silent() {
        assert_eq!(LogLevel::default(), LogLevel::Warn);
    }

    #[test]
    fn levels_map_to_matching_filters() {
        assert_eq!(LogLevel::Debug.as_filter(), LevelFilter::DEBUG);
        assert_eq!(LogLevel::Error.as_filter(), LevelFilter::ERROR);
    }

    #[test]
    fn reinitialization_is_tolerated() {
        init_with_level(LogLevel::Warn);
        init();
    }
}
