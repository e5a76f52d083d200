//! Roomcast server binary.
//!
//! # Usage
//!
//! ```bash
//! # Rooms and presence on the default port
//! roomcast-server --bind 0.0.0.0:8080
//!
//! # Broadcast only, custom channel namespace
//! roomcast-server --no-presence --channel-prefix chat-rooms-
//! ```

use std::time::Duration;

use clap::Parser;
use roomcast_core::{PresenceConfig, RegistryConfig};
use roomcast_server::{
    HubConfig, Server, ServerError, ServerRuntimeConfig, install_demo_protocol,
};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Roomcast gateway
#[derive(Parser, Debug)]
#[command(name = "roomcast-server")]
#[command(about = "Room broadcast and presence gateway over WebSockets")]
#[command(version)]
struct Args {
    /// Address to bind to
    #[arg(short, long, default_value = "0.0.0.0:8080")]
    bind: String,

    /// Prefix for room broadcast bus channels
    #[arg(long, default_value = roomcast_core::registry::DEFAULT_CHANNEL_PREFIX)]
    channel_prefix: String,

    /// Presence heartbeat interval in seconds
    #[arg(long, default_value = "15")]
    heartbeat_secs: u64,

    /// Disable presence counting
    #[arg(long)]
    no_presence: bool,

    /// Maximum concurrent connections
    #[arg(long, default_value = "10000")]
    max_connections: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn hub_config(&self) -> Result<HubConfig, ServerError> {
        if self.heartbeat_secs == 0 {
            return Err(ServerError::Config("--heartbeat-secs must be at least 1".to_string()));
        }

        let presence = (!self.no_presence).then(|| PresenceConfig {
            heartbeat_interval: Duration::from_secs(self.heartbeat_secs),
            ..PresenceConfig::default()
        });

        let config = HubConfig {
            registry: RegistryConfig { channel_prefix: self.channel_prefix.clone() },
            presence,
            max_connections: self.max_connections,
        };
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!("Roomcast server starting");
    tracing::info!("Binding to {}", args.bind);

    if args.no_presence {
        tracing::info!("Presence counting disabled");
    }

    let config = ServerRuntimeConfig { bind_address: args.bind.clone(), hub: args.hub_config()? };

    let mut server = Server::bind(config).await?;
    install_demo_protocol(server.hub_mut());

    tracing::info!("Server listening on {}", server.local_addr()?);

    server.run().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("roomcast-server").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn defaults_build_a_valid_config() {
        let config = parse(&[]).hub_config().unwrap();
        assert_eq!(config.registry.channel_prefix, "socket-rooms-");
        assert_eq!(config.presence.unwrap().heartbeat_interval, Duration::from_secs(15));
    }

    #[test]
    fn prefixes_overlapping_presence_are_rejected() {
        for prefix in ["numPresent-rooms-", "numPresent-", "num", ""] {
            let err = parse(&["--channel-prefix", prefix]).hub_config().unwrap_err();
            assert!(matches!(err, ServerError::Config(_)), "prefix {prefix:?}");
        }
    }

    #[test]
    fn zero_heartbeat_is_rejected() {
        assert!(parse(&["--heartbeat-secs", "0"]).hub_config().is_err());
        assert!(parse(&["--heartbeat-secs", "0", "--no-presence"]).hub_config().is_err());
    }
}
