//! agentlink command line client
//!
//! Sends requests, publishes messages and listens on the broker as one
//! agent identity.

use agentlink::config::{ClientConfig, ConnectionSection, IdentitySection};
use agentlink::connection::{self, Connection, PublishOptions, RequestOptions};
use agentlink::observability::{init_default_logging, init_logging, LogFormat};
use agentlink::protocol::{Account, ConnectionMode, IncomingMessage, Properties};
use agentlink::transport::mqtt::MqttTransport;
use agentlink::transport::{qos_from_level, QoS};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::process;
use tracing::{error, info, Level};

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Config file picked up from the working directory when `--config` is absent
const DEFAULT_CONFIG_PATH: &str = "agentlink.toml";

/// Request/response client for agents on an MQTT broker
#[derive(Parser)]
#[command(name = "agentlink")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Broker host
    #[arg(long)]
    host: Option<String>,

    /// Broker port
    #[arg(long)]
    port: Option<u16>,

    /// Agent label
    #[arg(long)]
    label: Option<String>,

    /// Account label
    #[arg(long)]
    account: Option<String>,

    /// Account audience
    #[arg(long)]
    audience: Option<String>,

    /// Connection mode: default, service, bridge or observer
    #[arg(long)]
    mode: Option<ConnectionMode>,

    /// Receive/request timeout in seconds
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a request and print the response
    Request {
        /// Method name, e.g. room.create
        method: String,
        /// Label of the receiving account
        #[arg(long)]
        to_account: String,
        /// Audience of the receiving account
        #[arg(long)]
        to_audience: String,
        /// JSON payload
        #[arg(long, default_value = "{}")]
        payload: String,
        /// Extra property as key=value, repeatable
        #[arg(long = "property", value_name = "KEY=VALUE", value_parser = parse_property)]
        properties: Vec<(String, Value)>,
        /// Fail unless the response carries this status
        #[arg(long)]
        expect_status: Option<String>,
    },
    /// Publish a single message
    Publish {
        topic: String,
        /// JSON payload
        #[arg(long, default_value = "{}")]
        payload: String,
        /// Property as key=value, repeatable
        #[arg(long = "property", value_name = "KEY=VALUE", value_parser = parse_property)]
        properties: Vec<(String, Value)>,
        #[arg(long)]
        retain: bool,
        /// QoS level 0, 1 or 2
        #[arg(long, default_value_t = 0)]
        qos: u8,
    },
    /// Print received messages until the count is reached or the timeout elapses
    Listen {
        /// Extra topic filter besides the inbox, repeatable
        #[arg(long = "topic")]
        topics: Vec<String>,
        /// Stop after this many messages
        #[arg(long)]
        count: Option<usize>,
    },
    /// Validate configuration
    Config {
        /// Show the effective configuration
        #[arg(long)]
        show: bool,
    },
}

/// `key=value`; the value is taken as JSON when it parses, as a string otherwise
fn parse_property(s: &str) -> Result<(String, Value), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{s}'"))?;
    if key.is_empty() {
        return Err(format!("empty property key in '{s}'"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let logging = match cli.verbose {
        0 => init_default_logging(LogFormat::Compact),
        1 => init_logging(Level::DEBUG, LogFormat::Compact, false),
        _ => init_logging(Level::TRACE, LogFormat::Compact, true),
    };
    if let Err(e) = logging {
        eprintln!("Failed to initialize logging: {e}");
    }

    let config = match load_configuration(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Request {
            method,
            to_account,
            to_audience,
            payload,
            properties,
            expect_status,
        } => {
            let to = Account::new(to_account, to_audience);
            run_request(&config, &method, &to, &payload, properties, expect_status).await
        }
        Commands::Publish {
            topic,
            payload,
            properties,
            retain,
            qos,
        } => run_publish(&config, &topic, &payload, properties, retain, qos).await,
        Commands::Listen { topics, count } => run_listen(&config, &topics, count).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn load_configuration(cli: &Cli) -> CliResult<ClientConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            ClientConfig::load_from_file(path)?
        }
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
            info!("Loading configuration from: {}", DEFAULT_CONFIG_PATH);
            ClientConfig::load_from_file(Path::new(DEFAULT_CONFIG_PATH))?
        }
        None => {
            let (Some(label), Some(account), Some(audience)) =
                (&cli.label, &cli.account, &cli.audience)
            else {
                return Err(
                    "No configuration file found. Provide one with -c/--config or pass --label, --account and --audience"
                        .into(),
                );
            };
            ClientConfig {
                identity: IdentitySection {
                    label: label.clone(),
                    account: account.clone(),
                    audience: audience.clone(),
                },
                connection: ConnectionSection::default(),
            }
        }
    };

    apply_overrides(&mut config, cli);
    config.validate()?;
    Ok(config)
}

fn apply_overrides(config: &mut ClientConfig, cli: &Cli) {
    if let Some(host) = &cli.host {
        config.connection.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.connection.port = port;
    }
    if let Some(label) = &cli.label {
        config.identity.label = label.clone();
    }
    if let Some(account) = &cli.account {
        config.identity.account = account.clone();
    }
    if let Some(audience) = &cli.audience {
        config.identity.audience = audience.clone();
    }
    if let Some(mode) = cli.mode {
        config.connection.mode = mode;
    }
    if let Some(timeout) = cli.timeout {
        config.connection.timeout_secs = timeout;
    }
}

fn parse_payload(payload: &str) -> CliResult<Value> {
    serde_json::from_str(payload).map_err(|e| format!("Invalid JSON payload: {e}").into())
}

fn print_message(message: &IncomingMessage) {
    println!(
        "{}",
        json!({
            "topic": message.topic,
            "payload": message.payload,
            "properties": message.properties,
        })
    );
}

async fn run_request(
    config: &ClientConfig,
    method: &str,
    to: &Account,
    payload: &str,
    properties: Vec<(String, Value)>,
    expect_status: Option<String>,
) -> CliResult<()> {
    let payload = parse_payload(payload)?;
    let options = RequestOptions {
        properties: properties.into_iter().collect::<Properties>(),
        ..RequestOptions::default()
    };

    let mut conn = connection::connect(config).await?;
    let result = conn.request_with(method, to, &payload, options).await;
    let response = finish(&mut conn, result).await?;

    print_message(&response);
    if let Some(expected) = expect_status {
        response.ensure_status(&expected)?;
    }
    Ok(())
}

async fn run_publish(
    config: &ClientConfig,
    topic: &str,
    payload: &str,
    properties: Vec<(String, Value)>,
    retain: bool,
    qos: u8,
) -> CliResult<()> {
    let payload = parse_payload(payload)?;
    let properties: Properties = properties.into_iter().collect();
    let options = PublishOptions {
        retain,
        qos: qos_from_level(qos)?,
    };

    let mut conn = connection::connect(config).await?;
    let result = conn.publish_with(topic, &payload, &properties, options).await;
    finish(&mut conn, result).await
}

async fn run_listen(config: &ClientConfig, topics: &[String], count: Option<usize>) -> CliResult<()> {
    let mut conn = connection::connect(config).await?;
    let result = listen(&mut conn, topics, count).await;
    finish(&mut conn, result).await
}

async fn listen(
    conn: &mut Connection<MqttTransport>,
    topics: &[String],
    count: Option<usize>,
) -> agentlink::ClientResult<()> {
    for topic in topics {
        conn.subscribe(topic, QoS::AtMostOnce).await?;
    }

    let timeout = conn.default_timeout();
    let mut received = 0usize;
    while count.map_or(true, |count| received < count) {
        match conn.receive(timeout).await {
            Ok(message) => {
                print_message(&message);
                received += 1;
            }
            // Without a count, going quiet is the normal way to stop
            Err(e) if e.is_timeout() && count.is_none() => break,
            Err(e) => return Err(e),
        }
    }

    info!(received, "Listening finished");
    Ok(())
}

/// Disconnect, then surface the operation's own result
async fn finish<T>(
    conn: &mut Connection<MqttTransport>,
    result: agentlink::ClientResult<T>,
) -> CliResult<T> {
    if let Err(e) = conn.disconnect().await {
        error!("Error during disconnect: {}", e);
    }
    Ok(result?)
}

fn handle_config_command(config: &ClientConfig, show: bool) -> CliResult<()> {
    info!("Configuration is valid");
    info!("Agent: {}", config.agent());
    info!("Client id: {}", config.client_identity().client_id());

    if show {
        println!("{}", toml::to_string_pretty(config)?);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_property() {
        assert_eq!(
            parse_property("priority=3").unwrap(),
            ("priority".to_string(), json!(3))
        );
        assert_eq!(
            parse_property("agent_id=web").unwrap(),
            ("agent_id".to_string(), json!("web"))
        );
        assert_eq!(
            parse_property("note=a=b").unwrap(),
            ("note".to_string(), json!("a=b"))
        );
        assert!(parse_property("novalue").is_err());
        assert!(parse_property("=1").is_err());
    }

    #[test]
    fn test_cli_parses_request() {
        let cli = Cli::try_parse_from([
            "agentlink",
            "--label",
            "web",
            "--account",
            "fey",
            "--audience",
            "dev.usr.example.org",
            "--mode",
            "service",
            "request",
            "room.create",
            "--to-account",
            "conference",
            "--to-audience",
            "dev.svc.example.org",
            "--property",
            "priority=1",
        ])
        .unwrap();

        assert_eq!(cli.mode, Some(ConnectionMode::Service));
        match cli.command {
            Commands::Request {
                method, properties, ..
            } => {
                assert_eq!(method, "room.create");
                assert_eq!(properties, vec![("priority".to_string(), json!(1))]);
            }
            _ => panic!("Expected request command"),
        }
    }

    #[test]
    fn test_overrides_apply_to_config() {
        let cli = Cli::try_parse_from([
            "agentlink",
            "--label",
            "web",
            "--account",
            "fey",
            "--audience",
            "dev.usr.example.org",
            "--host",
            "broker.example.org",
            "--timeout",
            "9",
            "config",
        ])
        .unwrap();

        let mut config = ClientConfig {
            identity: IdentitySection {
                label: "other".to_string(),
                account: "acc".to_string(),
                audience: "aud".to_string(),
            },
            connection: ConnectionSection::default(),
        };
        apply_overrides(&mut config, &cli);

        assert_eq!(config.identity.label, "web");
        assert_eq!(config.connection.host, "broker.example.org");
        assert_eq!(config.connection.timeout_secs, 9);
        assert_eq!(config.connection.port, 1883);
    }
}
