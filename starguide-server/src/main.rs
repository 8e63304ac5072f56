use std::net::SocketAddr;

use clap::{ArgAction, Parser};
use log::info;
use starguide_relay::{RelayConfig, RelayError, RelayServer};

#[derive(Parser, Debug)]
#[command(name = "starguide-server")]
#[command(about = "Presence and message relay for StarGuide learners")]
struct Cli {
    /// WebSocket relay address
    #[arg(long, env = "STARGUIDE_WS_ADDR", default_value = "0.0.0.0:5001")]
    ws_addr: SocketAddr,

    /// HTTP API address
    #[arg(long, env = "STARGUIDE_HTTP_ADDR", default_value = "0.0.0.0:5000")]
    http_addr: SocketAddr,

    /// Overrides the HTTP API port only
    #[arg(long, env = "PORT")]
    port: Option<u16>,

    /// Frames buffered per connection before new ones are dropped
    #[arg(long, env = "STARGUIDE_OUTBOUND_CAPACITY", default_value_t = 256)]
    outbound_capacity: usize,

    /// Echo chat messages back to their sender
    #[arg(long, env = "STARGUIDE_ECHO_CHAT", default_value_t = true, action = ArgAction::Set)]
    echo_chat: bool,

    /// Tell senders when a battle invite could not be delivered
    #[arg(long, env = "STARGUIDE_NOTIFY_UNDELIVERED", default_value_t = false, action = ArgAction::Set)]
    notify_undelivered: bool,
}

impl Cli {
    fn into_config(self) -> RelayConfig {
        let mut http_addr = self.http_addr;
        if let Some(port) = self.port {
            http_addr.set_port(port);
        }
        RelayConfig {
            ws_bind_addr: self.ws_addr.to_string(),
            http_bind_addr: http_addr.to_string(),
            outbound_capacity: self.outbound_capacity,
            echo_chat_to_sender: self.echo_chat,
            notify_undelivered_invites: self.notify_undelivered,
        }
    }
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                log::error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> Result<(), RelayError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Cli::parse().into_config();
    info!("Starting StarGuide relay...");
    info!("{config:?}");

    RelayServer::new(config)?
        .bind()
        .await?
        .serve_until(shutdown_signal())
        .await
}
