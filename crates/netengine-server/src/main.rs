//! NetEngine server binary.
//!
//! Loads `config.ron` (creating it on first run), applies CLI overrides and
//! serves until Ctrl-C. Authentication accepts any non-empty username.
//!
//! Run with: `cargo run -p netengine-server -- --port 7777`

use std::process::ExitCode;

use clap::Parser;
use netengine_config::{CliArgs, Config, default_config_dir};
use netengine_net::{Message, MessageKind};
use netengine_server::{Server, ServerError, ServerEvent, ServerOptions};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> ExitCode {
    let args = CliArgs::parse();

    let config_dir = args.config.clone().or_else(default_config_dir);
    let mut config = match config_dir.as_deref().map(Config::load_or_create) {
        Some(Ok(config)) => config,
        Some(Err(e)) => {
            eprintln!("config unreadable, using defaults: {e}");
            Config::default()
        }
        None => Config::default(),
    };
    config.apply_cli_overrides(&args);

    netengine_log::init_logging(&config.logging);
    info!(config_dir = ?config_dir, "NetEngine server");

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "server failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> Result<(), ServerError> {
    config.validate()?;
    let server = Server::new(ServerOptions::from_config(&config)?)?;

    server.attach_handler(MessageKind::Authentication, |server, incoming| {
        let id = incoming.connection_id;
        let Message::Authentication(auth) = incoming.message else {
            return;
        };

        let reply = if auth.username.trim().is_empty() {
            "[SERVER] Bad credentials"
        } else {
            match server.authenticate_client(id, auth.username) {
                Ok(_) => "[SERVER] You are authenticated",
                Err(e) => {
                    warn!(connection = %id, error = %e, "authentication refused");
                    "[SERVER] Bad credentials"
                }
            }
        };
        if let Err(e) = server.send(id, &Message::content(reply)) {
            warn!(connection = %id, error = %e, "reply not sent");
        }
    })?;

    server.attach_handler(MessageKind::Content, |_, incoming| {
        if let Message::Content(content) = incoming.message {
            info!(connection = %incoming.connection_id, content = %content.content, "content");
        }
    })?;

    server.attach_handler(MessageKind::EndOfStream, |_, incoming| {
        info!(connection = %incoming.connection_id, "end of stream");
    })?;

    let events = server.subscribe();
    tokio::task::spawn_blocking(move || {
        for event in events {
            match event {
                ServerEvent::ClientEvicted(client) => {
                    warn!(connection = %client.id, address = %client.address, "evicted")
                }
                ServerEvent::Stopped => break,
                other => info!(event = ?other, "server event"),
            }
        }
    });

    server.run()?;

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "cannot listen for Ctrl-C, shutting down");
    }
    info!("shutting down");
    server.stop()
}
