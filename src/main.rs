//! framelink demo binary
//!
//! - `framelink server`: accepts connections and acknowledges every request
//! - `framelink client`: sends each stdin line as a request and prints acks;
//!   a line reading `q` disconnects
//!
//! Messages carry an `i16` kind (0 = request, 1 = ack) followed by the text.

use framelink::config::{Config, Mode};
use framelink::{Client, Packet, Peer, Server, Session};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const KIND_REQUEST: i16 = 0;
const KIND_ACK: i16 = 1;

/// Server-side peer: answers each request with an ack carrying the same text.
struct EchoPeer {
    session: Session,
}

impl Peer for EchoPeer {
    fn on_receive(&self, mut packet: Packet) {
        let (kind, text) = match (packet.pop_i16(), packet.pop_string()) {
            (Ok(kind), Ok(text)) => (kind, text),
            _ => {
                warn!(conn_id = self.session.id(), "malformed message, ignored");
                return;
            }
        };
        if kind != KIND_REQUEST {
            return;
        }

        info!(conn_id = self.session.id(), text = %text, "request");
        let mut reply = self.session.packet();
        reply.push_i16(KIND_ACK);
        reply.push_string(&text);
        self.session.send(reply);
    }

    fn on_removed(&self) {
        info!(conn_id = self.session.id(), peer = ?self.session.peer_addr(), "session removed");
    }
}

/// Client-side peer: prints acks.
struct ConsolePeer;

impl Peer for ConsolePeer {
    fn on_receive(&self, mut packet: Packet) {
        if let (Ok(KIND_ACK), Ok(text)) = (packet.pop_i16(), packet.pop_string()) {
            println!("ack: {text}");
        }
    }

    fn on_removed(&self) {
        info!("disconnected");
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        mode = ?config.mode,
        host = %config.host,
        port = config.port,
        buffer_size = config.buffer_size,
        heartbeat_interval_ms = config.heartbeat_interval.as_millis() as u64,
        heartbeat_lifetime_ms = config.heartbeat_lifetime.as_millis() as u64,
        "Starting framelink"
    );

    match config.mode {
        Mode::Server => run_server(config).await,
        Mode::Client => run_client(config).await,
    }
}

async fn run_server(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let server = Server::new(config.server_config())?;
    server.on_session_created(|session| {
        info!(conn_id = session.id(), peer = ?session.peer_addr(), "session created");
        session.set_peer(Arc::new(EchoPeer {
            session: session.clone(),
        }));
    });
    server.start()?;

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    server.close();
    Ok(())
}

async fn run_client(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let client = Arc::new(Client::new(config.client_config())?);
    client.on_connected(|session| {
        session.set_peer(Arc::new(ConsolePeer));
    });
    let session = client.start().await?;

    let ticker = Arc::clone(&client);
    let tick = config.heartbeat_interval.min(Duration::from_millis(100));
    let mut service = tokio::spawn(async move { ticker.run(tick).await });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    client.disconnect();
                    break;
                };
                if line.trim() == "q" {
                    client.disconnect();
                    break;
                }
                let mut packet = session.packet();
                if line.len() + 4 > packet.remaining() {
                    warn!(len = line.len(), "line too long for one frame, skipped");
                    continue;
                }
                packet.push_i16(KIND_REQUEST);
                packet.push_string(&line);
                if !session.send(packet) {
                    warn!("connection is gone");
                    break;
                }
            }
            _ = &mut service => return Ok(()),
        }
    }

    // Give the server a moment to finish the graceful close
    if tokio::time::timeout(Duration::from_secs(5), &mut service).await.is_err() {
        client.close();
    }
    Ok(())
}
