//! Configuration for NetEngine servers and clients.
//!
//! Settings persist to disk as a RON file and can be overridden from the
//! command line via clap.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{ClientConfig, Config, LoggingConfig, ServerConfig, TlsConfig, default_config_dir};
pub use error::ConfigError;
