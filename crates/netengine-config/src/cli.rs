//! Command-line argument parsing.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// NetEngine command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug, Default)]
#[command(name = "netengine", about = "NetEngine message server")]
pub struct CliArgs {
    /// Address to bind.
    #[arg(long)]
    pub bind: Option<String>,

    /// Port to bind (server) or dial (client).
    #[arg(long)]
    pub port: Option<u16>,

    /// Server host for clients.
    #[arg(long)]
    pub server: Option<String>,

    /// Target tick rate in Hz.
    #[arg(long)]
    pub tick_frequency: Option<u32>,

    /// Pending-authentication TTL in milliseconds.
    #[arg(long)]
    pub auth_ttl_ms: Option<u64>,

    /// Maximum simultaneous connections (0 = unlimited).
    #[arg(long)]
    pub max_connections: Option<u32>,

    /// Require authentication before content is accepted.
    #[arg(long)]
    pub authentication_mandatory: Option<bool>,

    /// Enable TLS.
    #[arg(long)]
    pub tls: Option<bool>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(ref bind) = args.bind {
            self.server.bind_address = bind.clone();
        }
        if let Some(port) = args.port {
            self.server.port = port;
            self.client.server_port = port;
        }
        if let Some(ref server) = args.server {
            self.client.server_address = server.clone();
        }
        if let Some(hz) = args.tick_frequency {
            self.server.tick_frequency = hz;
        }
        if let Some(ttl) = args.auth_ttl_ms {
            self.server.auth_ttl_ms = ttl;
        }
        if let Some(max) = args.max_connections {
            self.server.max_connections = max;
        }
        if let Some(mandatory) = args.authentication_mandatory {
            self.server.authentication_mandatory = mandatory;
        }
        if let Some(tls) = args.tls {
            self.tls.enabled = tls;
        }
        if let Some(ref level) = args.log_level {
            self.logging.level = level.clone();
        }
    }
}
