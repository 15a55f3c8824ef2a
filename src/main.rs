//! mqtt-session command line entry point

use clap::{Parser, Subcommand};
use mqtt_session::config::ClientConfig;
use mqtt_session::engine::MqttEngineFactory;
use mqtt_session::observability::init_default_logging;
use mqtt_session::settings::{
    remember_connection, remember_subscription, FileSettingsStore, MemorySecretStore,
    SettingsStore,
};
use mqtt_session::{
    format_uptime, ConnectionManager, ConnectionState, QoS, SessionParameters, StateChange,
    Subscription,
};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::broadcast::Receiver;
use tokio::{
    signal,
    time::{sleep, timeout, Duration, Instant},
};
use tracing::{error, info, warn};

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const PUBLISH_ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Client-side MQTT session tool
#[derive(Parser)]
#[command(name = "mqtt-session")]
#[command(about = "Connect to an MQTT broker, watch a topic or publish a message")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and log incoming messages until Ctrl-C
    Watch {
        /// Topic filter to subscribe to
        #[arg(short, long)]
        topic: Option<String>,
        /// Subscription QoS (0, 1 or 2)
        #[arg(short, long, default_value_t = 0)]
        qos: u8,
        /// Seconds between statistics lines
        #[arg(long, default_value_t = 30)]
        stats_interval: u64,
    },
    /// Publish one message and wait for its acknowledgment
    Publish {
        #[arg(short, long)]
        topic: String,
        #[arg(short, long)]
        message: String,
        #[arg(short, long, default_value_t = 0)]
        qos: u8,
        #[arg(short, long)]
        retain: bool,
    },
    /// Print stored connection and subscription history
    History {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Validate configuration
    Config {
        /// Show the effective configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    info!("Starting mqtt-session v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Watch {
            topic,
            qos,
            stats_interval,
        } => run_watch(config, topic, QoS::from_level(qos), stats_interval).await,
        Commands::Publish {
            topic,
            message,
            qos,
            retain,
        } => run_publish(config, topic, message, QoS::from_level(qos), retain).await,
        Commands::History { json } => show_history(config, json).await,
        Commands::Config { show } => handle_config_command(config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(config_path: &Option<PathBuf>) -> CliResult<ClientConfig> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(ClientConfig::load_from_file(path)?);
    }

    for path_str in ["mqtt-session.toml", "config/mqtt-session.toml"] {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(ClientConfig::load_from_file(&path)?);
        }
    }

    Err("No configuration file found; pass -c/--config or create mqtt-session.toml".into())
}

fn settings_store(config: &ClientConfig) -> Option<FileSettingsStore> {
    config
        .settings
        .history_path
        .as_ref()
        .map(|path| FileSettingsStore::with_max_history(path, config.settings.max_history))
}

fn build_manager(config: &ClientConfig) -> ConnectionManager {
    let factory = Arc::new(MqttEngineFactory::new(config.engine_options()));
    ConnectionManager::new(factory, config.session_settings())
}

/// Start a session and wait until it is connected or has failed
async fn connect(
    manager: &ConnectionManager,
    changes: &mut Receiver<StateChange>,
    params: SessionParameters,
) -> CliResult<()> {
    info!(host = %params.host, port = params.port, client_id = %params.client_id, "Connecting");
    manager.start_connect(params)?;

    let deadline = Instant::now() + CONNECT_TIMEOUT;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let change = match timeout(remaining, changes.recv()).await {
            Err(_) => {
                manager.cancel_or_disconnect();
                return Err("Timed out waiting for the broker".into());
            }
            Ok(Err(RecvError::Lagged(_))) => {
                if manager.is_connected() {
                    return Ok(());
                }
                continue;
            }
            Ok(Err(RecvError::Closed)) => return Err("Connection manager stopped".into()),
            Ok(Ok(change)) => change,
        };

        match change.state {
            ConnectionState::Connected => return Ok(()),
            ConnectionState::Connecting => {}
            ConnectionState::Disconnected => {
                // Release a session the engine would otherwise keep retrying
                manager.cancel_or_disconnect();
                return Err(match change.error() {
                    Some(e) => e.into(),
                    None => change.reason.into(),
                });
            }
        }
    }
}

async fn record_connection(store: Option<&FileSettingsStore>, params: &SessionParameters) {
    let Some(store) = store else {
        return;
    };
    // Credentials come from the environment, so none are kept
    let secrets = MemorySecretStore::new();
    if let Err(e) = remember_connection(store, &secrets, params, false).await {
        warn!("Failed to record connection history: {}", e);
    }
}

async fn run_watch(
    config: ClientConfig,
    topic: Option<String>,
    qos: QoS,
    stats_interval: u64,
) -> CliResult<()> {
    let store = settings_store(&config);
    let params = config.to_session_parameters()?;
    let manager = build_manager(&config);
    let mut changes = manager.subscribe_changes();
    let mut message_signal = manager.message_signal();

    connect(&manager, &mut changes, params.clone()).await?;
    record_connection(store.as_ref(), &params).await;

    if let Some(topic) = topic {
        manager.subscribe(&topic, qos)?;
        info!(topic = %topic, qos = qos.level(), "Subscribed");
        if let Some(store) = store.as_ref() {
            if let Err(e) = remember_subscription(store, &Subscription { topic, qos }).await {
                warn!("Failed to record subscription history: {}", e);
            }
        }
    }

    let mut stats_tick = tokio::time::interval(Duration::from_secs(stats_interval.max(1)));
    stats_tick.tick().await;
    let mut seen = 0u64;

    info!("Watching; press Ctrl-C to stop");
    let outcome: CliResult<()> = loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Received Ctrl-C, disconnecting");
                break Ok(());
            }
            changed = message_signal.changed() => {
                if changed.is_err() {
                    break Err("Connection manager stopped".into());
                }
                manager.take_new_message();
                seen = log_new_messages(&manager, seen);
            }
            change = changes.recv() => match change {
                Ok(change) => {
                    if let Some(e) = change.error() {
                        break Err(e.into());
                    }
                    if change.state == ConnectionState::Disconnected && manager.current_session().is_none() {
                        break Err(change.reason.into());
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "State notifications lagged"),
                Err(RecvError::Closed) => break Err("Connection manager stopped".into()),
            },
            _ = stats_tick.tick() => log_stats(&manager),
        }
    };

    manager.cancel_or_disconnect();
    outcome
}

/// Log messages received since `seen` and return the new total
fn log_new_messages(manager: &ConnectionManager, seen: u64) -> u64 {
    let Some(stats) = manager.stats() else {
        return seen;
    };
    let fresh = stats.messages_received.saturating_sub(seen) as usize;

    for record in manager.messages().into_iter().take(fresh).rev() {
        let body = record
            .text
            .clone()
            .unwrap_or_else(|| format!("<{} bytes>", record.payload.len()));
        info!(
            topic = %record.topic,
            qos = record.qos.level(),
            message_id = record.message_id,
            received_at = %record.received_at.format("%H:%M:%S"),
            "{}",
            body
        );
    }
    stats.messages_received
}

fn log_stats(manager: &ConnectionManager) {
    let Some(stats) = manager.stats() else {
        return;
    };
    info!(
        state = %manager.state(),
        sent = stats.messages_sent,
        received = stats.messages_received,
        buffered = stats.buffered_messages,
        uptime = %stats.uptime_secs.map(format_uptime).unwrap_or_else(|| "--:--:--".to_string()),
        "Session statistics"
    );
}

async fn run_publish(
    config: ClientConfig,
    topic: String,
    message: String,
    qos: QoS,
    retain: bool,
) -> CliResult<()> {
    let store = settings_store(&config);
    let params = config.to_session_parameters()?;
    let manager = build_manager(&config);
    let mut changes = manager.subscribe_changes();

    connect(&manager, &mut changes, params.clone()).await?;
    record_connection(store.as_ref(), &params).await;

    let message_id = manager.publish(&topic, message.into_bytes(), qos, retain)?;
    info!(topic = %topic, qos = qos.level(), retain, message_id, "Published");

    let acknowledged = wait_for_ack(&manager).await;
    manager.cancel_or_disconnect();

    if acknowledged {
        info!(message_id, "Publish acknowledged");
        Ok(())
    } else {
        Err(format!("No acknowledgment for message {message_id}").into())
    }
}

async fn wait_for_ack(manager: &ConnectionManager) -> bool {
    let deadline = Instant::now() + PUBLISH_ACK_TIMEOUT;
    while Instant::now() < deadline {
        if manager.stats().is_some_and(|s| s.messages_sent > 0) {
            return true;
        }
        sleep(Duration::from_millis(50)).await;
    }
    false
}

async fn show_history(config: ClientConfig, json: bool) -> CliResult<()> {
    let Some(store) = settings_store(&config) else {
        println!("History is disabled; set [settings] history_path to enable it");
        return Ok(());
    };

    let connections = store.retrieve_connection_history().await?;
    let subscriptions = store.retrieve_subscription_history().await?;

    if json {
        let document = serde_json::json!({
            "connections": connections,
            "subscriptions": subscriptions,
        });
        println!("{}", serde_json::to_string_pretty(&document)?);
        return Ok(());
    }

    println!("Connections (newest first):");
    for record in connections {
        println!(
            "  {}:{} client_id={} user={} clean_session={}",
            record.hostname,
            record.port,
            record.client_id,
            record.username.as_deref().unwrap_or("-"),
            record.clean_session
        );
    }

    println!("Subscriptions (newest first):");
    for record in subscriptions {
        println!("  {} ({})", record.topic, record.qos);
    }
    Ok(())
}

fn handle_config_command(config: ClientConfig, show: bool) -> CliResult<()> {
    if show {
        println!("{}", config.to_toml()?);
    }

    info!("Configuration validation complete");
    Ok(())
}
