//! CLI for streamhub
//!
//! Subcommands:
//! - `server`: run the WebSocket server with the simulated market routes
//! - `client`: subscribe to one topic and print what arrives

use std::sync::Arc;

use clap::Parser;
use serde_json::{Map, Value};
use streamhub::broker::Engine;
use streamhub::broker::source::{SimulatedBars, SimulatedQuotes};
use streamhub::client::{ClientConnection, ClientEvent};
use streamhub::config::{Settings, load_config};
use streamhub::transport::websocket::start_websocket_server;
use streamhub::utils::error::{EngineError, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "streamhub")]
enum Command {
    /// Start the WebSocket server
    Server {
        /// Overrides `logging.level`
        #[arg(long)]
        log_level: Option<String>,
    },
    /// Subscribe to a topic and print its updates
    Client {
        /// Server URL (defaults to `client.url`)
        #[arg(long)]
        url: Option<String>,
        #[arg(long, default_value = "bars")]
        route: String,
        /// Topic parameter as `key=value`, repeatable
        #[arg(long = "param", value_parser = parse_param)]
        params: Vec<(String, Value)>,
        #[arg(long)]
        log_level: Option<String>,
    },
}

/// `k=v`; values that parse as JSON scalars keep their type.
fn parse_param(raw: &str) -> std::result::Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))?;
    let value = match serde_json::from_str::<Value>(value) {
        Ok(parsed @ (Value::Number(_) | Value::Bool(_))) => parsed,
        _ => Value::String(value.to_string()),
    };
    Ok((key.to_string(), value))
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cmd = Command::parse();

    let result = match cmd {
        Command::Server { log_level } => run_server(log_level).await,
        Command::Client {
            url,
            route,
            params,
            log_level,
        } => run_client(url, route, params, log_level).await,
    };

    if let Err(e) = result {
        error!("streamhub failed: {e}");
        std::process::exit(1);
    }
}

fn init_logging(config: &Settings, log_level: Option<String>) {
    let mut logging = config.logging.clone();
    if let Some(level) = log_level {
        logging.level = level;
    }
    streamhub::utils::logging::init(&logging);
}

async fn run_server(log_level: Option<String>) -> Result<()> {
    let config = load_config()?;
    init_logging(&config, log_level);

    let engine = Arc::new(
        Engine::builder(config.engine.clone())
            .route("bars", SimulatedBars)
            .route("quotes", SimulatedQuotes)
            .build()?,
    );
    let shutdown = CancellationToken::new();
    let mut server = tokio::spawn({
        let engine = engine.clone();
        let config = config.clone();
        let shutdown = shutdown.clone();
        async move { start_websocket_server(engine, &config, shutdown).await }
    });

    let joined = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
            shutdown.cancel();
            server.await
        }
        joined = &mut server => joined,
    };
    let served = joined.unwrap_or_else(|e| {
        error!("WebSocket server task failed: {e}");
        Ok(())
    });
    engine.shutdown().await;
    served
}

async fn run_client(
    url: Option<String>,
    route: String,
    params: Vec<(String, Value)>,
    log_level: Option<String>,
) -> Result<()> {
    let config = load_config()?;
    init_logging(&config, log_level);

    let mut settings = config.client;
    if let Some(url) = url {
        settings.url = url;
    }
    let params = Value::Object(params.into_iter().collect::<Map<String, Value>>());

    let client = ClientConnection::connect(settings);
    let mut subscription = client.subscribe(&route, params)?;
    info!(topic = %subscription.topic(), "subscribed");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = subscription.next() => match event {
                Some(ClientEvent::Update(value)) => println!("{value}"),
                Some(ClientEvent::Rejected(message)) | Some(ClientEvent::Failed(message)) => {
                    warn!(topic = %subscription.topic(), "subscription ended: {message}");
                    break;
                }
                None => {
                    client.shutdown().await;
                    return Err(EngineError::ClientClosed);
                }
            },
        }
    }

    client.shutdown().await;
    Ok(())
}
