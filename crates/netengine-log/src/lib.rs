//! Structured logging for NetEngine.
//!
//! Installs a `tracing` subscriber with a human-readable console layer and,
//! when a log directory is configured, a JSON file layer for post-mortem
//! analysis. `RUST_LOG` takes precedence over the configured level.

use std::fs::File;
use std::path::Path;

use netengine_config::LoggingConfig;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Name of the JSON log file inside the configured log directory.
pub const LOG_FILE_NAME: &str = "netengine.log";

const DEFAULT_FILTER: &str = "info";

/// Install the global subscriber.
///
/// Returns `false` if a global subscriber was already installed (the
/// existing one stays). A log directory that cannot be created only
/// disables the file layer.
///
/// ```no_run
/// use netengine_config::LoggingConfig;
/// use netengine_log::init_logging;
///
/// init_logging(&LoggingConfig::default());
/// ```
pub fn init_logging(config: &LoggingConfig) -> bool {
    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_names(true)
        .with_level(true)
        .with_timer(fmt::time::uptime());

    let file_layer = config.log_dir.as_deref().and_then(|dir| match json_file_layer(dir) {
        Ok(layer) => Some(layer),
        Err(e) => {
            eprintln!("file logging disabled: {e}");
            None
        }
    });

    // The file layer sits directly on the registry; the filter still applies to it.
    tracing_subscriber::registry()
        .with(file_layer)
        .with(env_filter(config))
        .with(console_layer)
        .try_init()
        .is_ok()
}

/// `RUST_LOG` if set, otherwise the configured level, otherwise `info`.
pub fn env_filter(config: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = config.level.trim();
        if level.is_empty() {
            default_env_filter()
        } else {
            EnvFilter::new(level)
        }
    })
}

pub fn default_env_filter() -> EnvFilter {
    EnvFilter::new(DEFAULT_FILTER)
}

/// JSON layer appending to `<dir>/netengine.log`, creating `dir` if needed.
pub fn json_file_layer(dir: &Path) -> std::io::Result<Box<dyn Layer<Registry> + Send + Sync>> {
    std::fs::create_dir_all(dir)?;
    let file = File::options()
        .create(true)
        .append(true)
        .open(dir.join(LOG_FILE_NAME))?;

    Ok(fmt::layer()
        .with_writer(file)
        .with_ansi(false)
        .with_target(true)
        .with_timer(fmt::time::uptime())
        .json()
        .boxed())
}
