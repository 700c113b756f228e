//! mqttc - command line front end for the MQTT client engine

use clap::{Parser, Subcommand};
use mqtt_client_engine::observability::{init_default_logging, init_logging, LogFormat};
use mqtt_client_engine::{Client, ClientConfig, ClientEvent, ProtocolVersion, QoS, SupervisorState};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::process;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, Level};

#[derive(Parser)]
#[command(name = "mqttc")]
#[command(about = "Session-preserving MQTT client")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Broker URL, overrides the configuration file
    #[arg(short, long, env = "MQTT_BROKER_URL")]
    broker: Option<String>,

    #[arg(long)]
    client_id: Option<String>,

    /// Use MQTT 5 instead of 3.1.1
    #[arg(long)]
    v5: bool,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Publish a message and wait for its acknowledgement
    Publish {
        topic: String,
        message: String,
        #[arg(short, long, default_value_t = 1, value_parser = clap::value_parser!(u8).range(0..=2))]
        qos: u8,
        #[arg(short, long)]
        retain: bool,
        /// Publish the message this many times
        #[arg(long, default_value_t = 1)]
        count: u32,
    },
    /// Print messages matching the filters as JSON lines until interrupted
    Subscribe {
        #[arg(required = true)]
        filters: Vec<String>,
        #[arg(short, long, default_value_t = 1, value_parser = clap::value_parser!(u8).range(0..=2))]
        qos: u8,
    },
    /// Validate configuration
    Config {
        /// Print the effective configuration with secrets redacted
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.verbose {
        0 => init_default_logging(),
        level => {
            let level = if level == 1 { Level::DEBUG } else { Level::TRACE };
            let format = LogFormat::parse(&std::env::var("LOG_FORMAT").unwrap_or_default());
            init_logging(level, format, false);
        }
    }

    let config = match load_configuration(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Publish {
            topic,
            message,
            qos,
            retain,
            count,
        } => run_publish(config, topic, message, qos, retain, count).await,
        Commands::Subscribe { filters, qos } => run_subscribe(config, filters, qos).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(cli: &Cli) -> Result<ClientConfig, Box<dyn std::error::Error>> {
    let mut config = match (&cli.config, &cli.broker) {
        (Some(path), _) => {
            info!("Loading configuration from: {}", path.display());
            ClientConfig::load_from_file(path)?
        }
        (None, Some(broker)) => ClientConfig::new(broker.clone()),
        (None, None) => {
            let path = ["mqttc.toml", "config/mqttc.toml"]
                .iter()
                .map(Path::new)
                .find(|path| path.exists())
                .ok_or("no broker given; use --broker, MQTT_BROKER_URL or -c/--config")?;
            info!("Loading configuration from: {}", path.display());
            ClientConfig::load_from_file(path)?
        }
    };

    if let Some(broker) = &cli.broker {
        config.broker_url = broker.clone();
    }
    if let Some(client_id) = &cli.client_id {
        config.client_id = client_id.clone();
    }
    if cli.v5 {
        config.protocol = ProtocolVersion::V5;
    }
    config.validate()?;
    Ok(config)
}

async fn run_publish(
    config: ClientConfig,
    topic: String,
    message: String,
    qos: u8,
    retain: bool,
    count: u32,
) -> Result<(), Box<dyn std::error::Error>> {
    let qos = QoS::try_from(qos)?;
    let (client, events) = Client::channel(config)?;
    tokio::spawn(log_events(events));

    client.connect().await?;
    for n in 1..=count {
        client.publish(topic.clone(), message.clone(), qos, retain).await?;
        info!(topic = %topic, n, "Published");
    }
    client.disconnect().await?;

    let metrics = client.metrics();
    info!(
        published = metrics.messages.published,
        acknowledged = metrics.messages.acknowledged,
        "Done"
    );
    Ok(())
}

async fn run_subscribe(
    config: ClientConfig,
    filters: Vec<String>,
    qos: u8,
) -> Result<(), Box<dyn std::error::Error>> {
    let qos = QoS::try_from(qos)?;
    let (client, mut events) = Client::channel(config)?;

    client.connect().await?;
    for filter in &filters {
        let granted = client.subscribe(filter.clone(), qos).await?;
        info!(filter = %filter, granted = u8::from(granted), "Subscribed");
    }

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    let mut state = client.state_changes();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event @ (ClientEvent::Message { .. } | ClientEvent::Error { .. })) => {
                    println!("{}", json!({ "event": event.name(), "data": event.payload() }));
                }
                Some(event) => info!(event = event.name(), data = %event.payload(), "Client event"),
                None => break,
            },
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                if let SupervisorState::GivenUp { attempts } = state.borrow().supervisor {
                    return Err(format!("gave up reconnecting after {attempts} attempts").into());
                }
            }
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down gracefully...");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down gracefully...");
                break;
            }
        }
    }

    client.disconnect().await?;
    Ok(())
}

async fn log_events(mut events: mpsc::Receiver<ClientEvent>) {
    while let Some(event) = events.recv().await {
        info!(event = event.name(), data = %event.payload(), "Client event");
    }
}

fn handle_config_command(config: &ClientConfig, show: bool) -> Result<(), Box<dyn std::error::Error>> {
    let address = config.broker_address()?;
    if show {
        println!("{}", toml::to_string_pretty(&config.redacted())?);
    }
    info!(broker = %address, client_id = %config.client_id, "Configuration is valid");
    Ok(())
}
