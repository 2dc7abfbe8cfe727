use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{Layer, Registry};

/// Console logging setup for binaries embedding the sink.
///
/// The library itself only emits `tracing` events; nothing is printed
/// unless the host installs a subscriber, either its own or this one.
#[derive(Clone, Debug)]
pub struct LogConfig {
    /// Most verbose level that is printed.
    pub level: Level,
    /// Include the event target (module path) in each line.
    pub with_target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            with_target: true,
        }
    }
}

/// Install a global `fmt` subscriber according to `config`.
///
/// Fails if a global subscriber was already set.
pub fn init_logging_with_config(
    config: LogConfig,
) -> Result<(), tracing::subscriber::SetGlobalDefaultError> {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(config.with_target)
        .with_filter(tracing_subscriber::filter::LevelFilter::from_level(config.level));
    let subscriber = Registry::default().with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber)
}

/// Install a global `fmt` subscriber printing events up to `level`.
pub fn init_logging(level: Level) -> Result<(), tracing::subscriber::SetGlobalDefaultError> {
    init_logging_with_config(LogConfig {
        level,
        ..LogConfig::default()
    })
}
