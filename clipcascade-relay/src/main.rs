use clap::Parser;
use clipcascade_core::{DEFAULT_MAX_MESSAGE_BYTES, DEFAULT_MAX_PEERS_PER_ROOM};
use clipcascade_relay::{AppState, RelayConfig, serve};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "clipcascade-relay")]
struct RelayArgs {
    #[arg(long, default_value = "0.0.0.0:8080")]
    bind_address: String,
    /// Largest clipboard message body forwarded by the broker, in bytes.
    #[arg(long, default_value_t = DEFAULT_MAX_MESSAGE_BYTES)]
    max_message_bytes: usize,
    #[arg(long, default_value_t = DEFAULT_MAX_PEERS_PER_ROOM)]
    max_peers_per_room: usize,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = RelayArgs::parse();
    let listener = match tokio::net::TcpListener::bind(&args.bind_address).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("failed to bind {}: {}", args.bind_address, err);
            std::process::exit(1);
        }
    };

    let config = RelayConfig {
        max_message_bytes: args.max_message_bytes,
        max_peers_per_room: args.max_peers_per_room,
    };
    info!(
        max_message_bytes = config.max_message_bytes,
        max_peers_per_room = config.max_peers_per_room,
        "relay starting on {}",
        args.bind_address
    );
    if let Err(err) = serve(listener, AppState::with_config(config)).await {
        warn!("relay server exited: {}", err);
    }
}
