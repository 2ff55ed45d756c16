//! evtunnel server
//!
//! Accepts client channels over TCP, authenticates them against the
//! configured users and echoes every data event back to its sender.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use evtunnel::{
    config::{generate_secret, Config, LoggingConfig},
    event::{Event, EventKind},
    server::{ConnContext, RequestHandler, Server},
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// evtunnel server - encrypted multiplexed event channels
#[derive(Parser, Debug)]
#[command(name = "evtunnel-server")]
#[command(about = "evtunnel server - encrypted multiplexed event channels")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Generate a new shared secret and exit
    #[arg(long)]
    generate_secret: bool,

    /// Listen address (overrides config)
    #[arg(short, long)]
    listen: Option<String>,

    /// Log level (trace, debug, info, warn, error; overrides config)
    #[arg(short = 'v', long)]
    log_level: Option<String>,
}

/// Sends data events back on the session they arrived on
struct EchoHandler;

impl RequestHandler for EchoHandler {
    fn handle(&self, ctx: &ConnContext, event: Event) -> Vec<Event> {
        match event.kind {
            EventKind::Data(_) => {
                debug!(user = %ctx.user, session = event.session_id, "echo");
                vec![event]
            }
            EventKind::Close => {
                debug!(user = %ctx.user, session = event.session_id, "session closed");
                Vec::new()
            }
            _ => Vec::new(),
        }
    }
}

/// Set up tracing from the command line level, falling back to `[logging]`
fn init_logging(level: Option<&str>, logging: &LoggingConfig) {
    let builder = tracing_subscriber::fmt().with_env_filter(logging.filter(level));
    if logging.format == "compact" {
        builder.compact().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.generate_secret {
        let secret = generate_secret()?;
        println!("Add to both [server] and [client] in config.toml:");
        println!("  secret = \"{}\"", secret);
        return Ok(());
    }

    let mut config = Config::load(&args.config).context("Failed to load configuration")?;
    init_logging(args.log_level.as_deref(), &config.logging);
    let server_config = config
        .server
        .as_mut()
        .ok_or_else(|| anyhow!("No [server] section in config file"))?;

    // No secret configured - generate one and save it to config
    if server_config.secret.is_empty() {
        info!("No secret configured - generating new secret...");
        server_config.secret = generate_secret()?;
        config
            .save(&args.config)
            .context("Failed to save config with new secret")?;
        info!("Generated and saved new secret to config file; copy it to the client config");
    }
    let server_config = config
        .server
        .clone()
        .ok_or_else(|| anyhow!("No [server] section in config file"))?;

    if server_config.allowed_users.is_empty() {
        warn!("No allowed_users configured - every user is accepted");
    } else {
        info!("Loaded {} allowed user(s)", server_config.allowed_users.len());
    }

    let server = Arc::new(
        Server::from_config(&server_config, Arc::new(EchoHandler)).context("Failed to build server")?,
    );

    let listen_addr = args.listen.unwrap_or_else(|| server_config.listen.clone());
    info!("evtunnel server v{}", evtunnel::VERSION);

    let listener = TcpListener::bind(&listen_addr)
        .await
        .context("Failed to bind to address")?;

    tokio::select! {
        res = server.run(listener) => {
            if let Err(e) = res {
                error!("Server stopped: {}", e);
                return Err(e.into());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
        }
    }

    Ok(())
}
