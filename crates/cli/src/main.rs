//! Command-line interface for ringmq brokers.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use ringmq_broker::{Broker, BrokerConfig, BrokerError};
use ringmq_client::{Client, ClientError, Message, handler_fn};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// CLI-specific error type
#[derive(Debug, thiserror::Error)]
enum Error {
    /// Broker failed to start or stop
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// Client call failed
    #[error(transparent)]
    Client(#[from] ClientError),

    /// Signal handling failed
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Parser)]
#[command(name = "ringmq", version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start a broker node and run until interrupted
    Start {
        /// JSON configuration file
        #[arg(short, long)]
        config: PathBuf,

        /// Ring address of a node to join through (repeatable)
        #[arg(short = 'b', long = "base")]
        base: Vec<String>,

        /// More seed ring addresses
        #[arg(value_name = "BASE")]
        bases: Vec<String>,
    },

    /// Publish one message
    Publish {
        /// Broker port
        #[arg(short, long)]
        port: u16,

        /// Broker host
        #[arg(short = 'H', long, default_value = "127.0.0.1")]
        host: String,

        /// Topic to publish to
        #[arg(short, long)]
        topic: String,

        /// Message payload
        #[arg(short, long, default_value = "")]
        message: String,
    },

    /// Print every message published to a topic
    Subscribe {
        /// Broker port
        #[arg(short, long)]
        port: u16,

        /// Broker host
        #[arg(short = 'H', long, default_value = "127.0.0.1")]
        host: String,

        /// Topic to subscribe to
        #[arg(short, long)]
        topic: String,
    },

    /// Print the version
    Version,
}

fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Seeds given on the command line replace the configured ones.
fn apply_seeds(config: &mut BrokerConfig, base: Vec<String>, bases: Vec<String>) {
    let seeds: Vec<String> = base.into_iter().chain(bases).collect();
    if !seeds.is_empty() {
        config.base = seeds;
    }
}

async fn start(config: PathBuf, base: Vec<String>, bases: Vec<String>) -> Result<(), Error> {
    let mut config = BrokerConfig::from_file(&config)?;
    init_tracing(config.log_level.as_deref().unwrap_or("info"));
    apply_seeds(&mut config, base, bases);

    let broker = Broker::new(config);
    broker.start().await?;

    if let Some(ring) = broker.ring_address() {
        info!(
            "ringmq ready: clients on {:?}, ring on {}",
            broker.local_addrs(),
            ring
        );
    }

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("shutting down...");
            broker.stop().await?;
        }
        () = broker.wait() => {}
    }

    info!("ringmq stopped");
    Ok(())
}

async fn publish(host: &str, port: u16, topic: &str, message: String) -> Result<(), Error> {
    init_tracing("warn");
    let client = Client::connect(&format!("{host}:{port}")).await?;
    let result = client.emit(topic, message).await;
    client.close().await;
    result?;

    println!("published to {topic}");
    Ok(())
}

async fn subscribe(host: &str, port: u16, topic: &str) -> Result<(), Error> {
    init_tracing("warn");
    let client = Client::connect(&format!("{host}:{port}")).await?;

    client
        .on(
            topic,
            handler_fn(|message: Message| async move {
                println!(
                    "{}: {}",
                    message.topic,
                    String::from_utf8_lossy(&message.payload)
                );
                Ok(())
            }),
        )
        .await?;
    println!("subscribed to {topic}");

    tokio::select! {
        signal = tokio::signal::ctrl_c() => signal?,
        () = client.closed() => eprintln!("broker closed the connection"),
    }

    client.close().await;
    Ok(())
}

async fn run(command: Command) -> Result<(), Error> {
    match command {
        Command::Start {
            config,
            base,
            bases,
        } => start(config, base, bases).await,
        Command::Publish {
            port,
            host,
            topic,
            message,
        } => publish(&host, port, &topic, message).await,
        Command::Subscribe { port, host, topic } => subscribe(&host, port, &topic).await,
        Command::Version => {
            println!("ringmq {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    match run(args.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use clap::CommandFactory;
    use clap::error::ErrorKind;

    use super::*;

    #[test]
    fn test_cli_definition() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_start_requires_config() {
        let error = Args::try_parse_from(["ringmq", "start"]).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::MissingRequiredArgument);
        assert!(error.use_stderr());
    }

    #[test]
    fn test_start_collects_seeds() {
        let args = Args::try_parse_from([
            "ringmq",
            "start",
            "-c",
            "broker.json",
            "-b",
            "127.0.0.1:5001",
            "127.0.0.1:5002",
        ])
        .unwrap();

        assert_matches!(
            args.command,
            Command::Start { config, base, bases }
                if config == PathBuf::from("broker.json")
                    && base == vec!["127.0.0.1:5001".to_string()]
                    && bases == vec!["127.0.0.1:5002".to_string()]
        );
    }

    #[test]
    fn test_cli_seeds_replace_configured_ones() {
        let mut config = BrokerConfig {
            base: vec!["10.0.0.1:5000".to_string()],
            ..BrokerConfig::default()
        };
        apply_seeds(&mut config, vec![], vec![]);
        assert_eq!(config.base, vec!["10.0.0.1:5000".to_string()]);

        apply_seeds(&mut config, vec!["a:1".to_string()], vec!["b:2".to_string()]);
        assert_eq!(config.base, vec!["a:1".to_string(), "b:2".to_string()]);
    }

    #[test]
    fn test_publish_flags() {
        let args = Args::try_parse_from([
            "ringmq", "publish", "-p", "4000", "-t", "orders", "-m", "hello",
        ])
        .unwrap();

        assert_matches!(
            args.command,
            Command::Publish { port: 4000, host, topic, message }
                if host == "127.0.0.1" && topic == "orders" && message == "hello"
        );
    }

    #[test]
    fn test_subscribe_requires_topic() {
        let error = Args::try_parse_from(["ringmq", "subscribe", "-p", "4000"]).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::MissingRequiredArgument);
    }

    #[tokio::test]
    async fn test_start_with_empty_interfaces_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broker.json");
        std::fs::write(&path, r#"{ "interfaces": [] }"#).unwrap();

        let result = start(path, vec![], vec![]).await;

        assert_matches!(
            result,
            Err(Error::Broker(BrokerError::Configuration(message))) if message == "missing interfaces"
        );
    }
}
