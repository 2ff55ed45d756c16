//! evtunnel client
//!
//! Opens a pool of channels to the server and runs a line echo session:
//! every stdin line is sent as a data event and whatever the server sends
//! back is printed.

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use clap::Parser;
use evtunnel::{
    channel::{ChannelTable, RemoteChannel},
    config::{generate_secret, Config, LoggingConfig},
    event::{Event, EventCodec, EventKind},
    session::SessionRegistry,
    transport::TcpRemote,
};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// evtunnel client - encrypted multiplexed event channels
#[derive(Parser, Debug)]
#[command(name = "evtunnel-client")]
#[command(about = "evtunnel client - encrypted multiplexed event channels")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Generate a new shared secret and exit
    #[arg(long)]
    generate_secret: bool,

    /// Server address (overrides config)
    #[arg(short, long)]
    server: Option<String>,

    /// User name (overrides config)
    #[arg(short, long)]
    user: Option<String>,

    /// Log level (trace, debug, info, warn, error; overrides config)
    #[arg(short = 'v', long)]
    log_level: Option<String>,
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
        println!("{}", generate_secret()?);
        return Ok(());
    }

    let config = Config::load(&args.config).context("Failed to load configuration")?;
    init_logging(args.log_level.as_deref(), &config.logging);
    let mut client_config = config
        .client
        .ok_or_else(|| anyhow!("No [client] section in config file"))?;
    if let Some(server) = args.server {
        client_config.server = server;
    }
    if let Some(user) = args.user {
        client_config.user = user;
    }

    let secret = client_config.secret_bytes().context("Invalid client secret")?;
    let codec = Arc::new(EventCodec::new(&secret)?);
    let sessions = SessionRegistry::new();
    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<Event>();
    let handler = Arc::new(events_tx);

    info!("evtunnel client v{}", evtunnel::VERSION);
    info!("Connecting to {} as {}", client_config.server, client_config.user);

    let table = Arc::new(ChannelTable::new());
    for index in 0..client_config.channels.max(1) as i64 {
        let transport = Arc::new(TcpRemote::new(
            client_config.server.clone(),
            client_config.transport_config(),
        ));
        let channel = RemoteChannel::new(
            client_config.channel_options(index),
            transport,
            Arc::clone(&codec),
            Arc::clone(&sessions),
            handler.clone(),
        );
        channel
            .init()
            .await
            .with_context(|| format!("Channel {} failed to start", index))?;
        table.add(channel);
    }
    info!("{} channel(s) ready", table.len());

    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            print_event(&event);
        }
    });

    // One session carries the whole echo run and keeps the channels connected.
    let session = sessions.open_random()?;
    let direct = client_config.direct_io;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break;
                };
                let event = Event::data(session.id(), Bytes::from(line.into_bytes()));
                if let Err(e) = send(&table, event, direct).await {
                    warn!("send failed: {}", e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
        }
    }

    drop(session);
    table.stop_all().await;
    Ok(())
}

async fn send(table: &ChannelTable, event: Event, direct: bool) -> Result<()> {
    if !direct {
        table.write(event).await?;
        return Ok(());
    }

    let channel = table.select().ok_or_else(|| anyhow!("No channel available"))?;
    let response = channel.request(event).await?;
    print_event(&response);
    Ok(())
}

fn print_event(event: &Event) {
    match &event.kind {
        EventKind::Data(payload) => {
            println!("[{}] {}", event.session_id, String::from_utf8_lossy(payload));
        }
        EventKind::Close => info!(session = event.session_id, "session closed by server"),
        _ => debug!(kind = ?event.event_type(), "ignoring event"),
    }
}
