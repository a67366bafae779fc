//! Standalone event bus server
//!
//! Owns one event bus, creates the well-known topics and keeps the bus
//! running until SIGINT or SIGTERM.

use clap::Parser;
use forge_events::{build_bus, BusConfig, BusKind, EventBusServer, WELL_KNOWN_TOPICS};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Standalone event bus server", long_about = None)]
struct Args {
    /// Backend to run (memory, kafka, redis)
    #[arg(short, long, env = "EVENT_BUS_IMPLEMENTATION")]
    implementation: Option<BusKind>,

    /// Topic to create at startup; repeat or comma separate. Defaults to the well-known topics
    #[arg(short, long = "topic", env = "EVENT_BUS_TOPICS", value_delimiter = ',')]
    topics: Vec<String>,

    /// Kafka client id
    #[arg(long, env = "KAFKA_CLIENT_ID", default_value = "verseforge-server")]
    client_id: String,

    /// Kafka consumer group
    #[arg(long, env = "KAFKA_GROUP_ID", default_value = "verseforge-server-group")]
    group_id: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_tracing(args.debug);

    let mut config = BusConfig::from_env()?.with_kafka_identity(args.client_id, args.group_id);
    if let Some(implementation) = args.implementation {
        config.implementation = implementation;
    }

    let topics: Vec<String> = if args.topics.is_empty() {
        WELL_KNOWN_TOPICS.iter().map(|t| t.to_string()).collect()
    } else {
        args.topics
            .into_iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect()
    };

    info!(implementation = %config.implementation, topics = ?topics, "Starting event bus server");

    let bus = build_bus(&config)?;
    let server = EventBusServer::new(bus).with_topics(topics);

    if let Err(e) = server.run_until_signal().await {
        error!(error = %e, "Event bus server failed");
        return Err(e.into());
    }

    info!("Event bus server shut down cleanly");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_defaults() {
        let args = Args::try_parse_from(["forge-events-server"]).unwrap();
        assert!(!args.debug);
        if std::env::var_os("EVENT_BUS_TOPICS").is_none() {
            assert!(args.topics.is_empty());
        }
    }

    #[test]
    fn test_args_repeated_and_comma_separated_topics() {
        let args = Args::try_parse_from([
            "forge-events-server",
            "--implementation",
            "Redis",
            "--topic",
            "plot_events,scene_events",
            "--topic",
            "qa_events",
        ])
        .unwrap();

        assert_eq!(args.implementation, Some(BusKind::Redis));
        assert_eq!(args.topics, vec!["plot_events", "scene_events", "qa_events"]);
    }

    #[test]
    fn test_unknown_implementation_is_rejected() {
        assert!(Args::try_parse_from(["forge-events-server", "--implementation", "nats"]).is_err());
    }
}
