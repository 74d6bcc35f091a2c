use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use fastirl_core::{
    bootstrap::load_config,
    logging,
    signaling::WsConnector,
    Config, EventBus, RemoteControlClient, SignalingChannel,
};

#[derive(Parser, Debug)]
#[command(name = "fastirl")]
#[command(about = "FastIRL media delivery diagnostics", long_about = None)]
struct Args {
    /// Config file (falls back to FASTIRL_CONFIG_PATH, then ./fastirl.yaml or ./fastirl.toml)
    #[arg(long, short)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the effective configuration as JSON
    Config,

    /// Hold a signaling connection open and log what happens on it
    Signal {
        /// Signaling URL (defaults to signaling.url)
        #[arg(long)]
        url: Option<String>,
    },

    /// Send one request to the remote-control server and print the response
    Remote {
        /// Request type, e.g. GetSceneList
        request_type: String,

        /// Request data as a JSON object
        #[arg(long)]
        data: Option<String>,

        /// Server URL (defaults to remote_control.url)
        #[arg(long)]
        url: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load and validate configuration
    let config = load_config(args.config.as_deref())?;

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;

    // 3. Run the command
    match args.command {
        Command::Config => print_config(&config),
        Command::Signal { url } => run_signal(&config, url).await,
        Command::Remote {
            request_type,
            data,
            url,
        } => run_remote(&config, &request_type, data.as_deref(), url).await,
    }
}

fn print_config(config: &Config) -> Result<()> {
    let mut shown = config.clone();
    if !shown.remote_control.password.is_empty() {
        shown.remote_control.password = "********".to_string();
    }
    println!("{}", serde_json::to_string_pretty(&shown)?);
    Ok(())
}

async fn run_signal(config: &Config, url: Option<String>) -> Result<()> {
    let url = url.unwrap_or_else(|| config.signaling.url.clone());
    let connector = Arc::new(WsConnector::new(config.signaling.connect_timeout()));
    let channel = SignalingChannel::new(&config.signaling, connector);

    let mut status = channel.subscribe_status();
    let mut messages = channel.subscribe_messages();

    channel
        .connect(&url)
        .await
        .with_context(|| format!("Failed to connect to {url}"))?;
    info!("Connected to {url}, press Ctrl-C to quit");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                channel.disconnect();
                return Ok(());
            }
            changed = status.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                let current = status.borrow_and_update().clone();
                info!(status = %current, "Signaling status changed");
            }
            received = messages.recv() => match received {
                Ok(message) => info!(message_type = message.kind(), ?message, "Signaling message"),
                Err(e) => warn!(error = %e, "Message stream interrupted"),
            },
        }
    }
}

async fn run_remote(
    config: &Config,
    request_type: &str,
    data: Option<&str>,
    url: Option<String>,
) -> Result<()> {
    let data = data
        .map(serde_json::from_str::<serde_json::Value>)
        .transpose()
        .context("--data must be valid JSON")?;
    let url = url.unwrap_or_else(|| config.remote_control.url.clone());

    let connector = Arc::new(WsConnector::new(config.remote_control.request_timeout()));
    let client = RemoteControlClient::new(&config.remote_control, connector, EventBus::new());
    client
        .connect(&url)
        .await
        .with_context(|| format!("Failed to connect to {url}"))?;

    let response = client.request(request_type, data).await;
    client.disconnect();
    let response = response.with_context(|| format!("{request_type} failed"))?;

    if !response.request_status.result {
        warn!(
            code = response.request_status.code,
            comment = response.request_status.comment.as_deref().unwrap_or(""),
            "Request was rejected"
        );
    }
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}
