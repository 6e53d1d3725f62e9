//! The Java Edition relay front door.
//!
//! Players who cannot reach a world directly point their game client at
//! `<mnemonic>.<base address>`. The relay accepts that plain Minecraft
//! connection, reads the connection id out of the handshake's hostname, and
//! from then on shuttles raw bytes between the game client and the world
//! owner's control session as `ProxyC2SPacket`/`ProxyS2CPacket` frames. Each
//! accepted client is one circuit with a server-assigned id; the owner
//! addresses its replies by that id.
//!
//! The owner side of a circuit survives a brief control-session drop: chunk
//! delivery re-resolves the owner's connection id against the registry and
//! waits out a configurable grace window before giving up, so a reconnecting
//! host keeps its proxied players.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info};

use crate::protocol::{ConnectionId, ServerMessage};
use crate::server::game_codec::{self, GameFrameError, Handshake};
use crate::server::registry::ConnectionRegistry;
use crate::server::session::{is_disconnect, Session};

/// Read size for one relayed chunk.
const RELAY_CHUNK: usize = 64 * 1024;

/// Queued chunks per circuit before the owner-side sender awaits.
const CIRCUIT_QUEUE: usize = 64;

/// How often a chunk with no live owner re-checks the registry.
const RECONNECT_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CircuitError {
    #[error("circuit is owned by another session")]
    NotOwner,
    #[error("no such circuit")]
    Missing,
}

pub(crate) enum CircuitCommand {
    Data(Vec<u8>),
    Close,
}

struct Circuit {
    owner: ConnectionId,
    tx: mpsc::Sender<CircuitCommand>,
}

/// Live circuits, addressed by their server-assigned id.
///
/// The control-session router writes into circuits through this table; the
/// relay tasks insert and remove entries as game clients come and go.
#[derive(Default)]
pub struct RelayCircuits {
    circuits: DashMap<i64, Circuit>,
}

impl RelayCircuits {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(
        &self,
        circuit_id: i64,
        owner: ConnectionId,
        tx: mpsc::Sender<CircuitCommand>,
    ) {
        self.circuits.insert(circuit_id, Circuit { owner, tx });
    }

    fn remove(&self, circuit_id: i64) {
        self.circuits.remove(&circuit_id);
    }

    /// Clones the command sender if `sender` owns the circuit. Kept separate
    /// so the map guard is dropped before anything awaits.
    fn command_sender(
        &self,
        circuit_id: i64,
        sender: ConnectionId,
    ) -> Result<mpsc::Sender<CircuitCommand>, CircuitError> {
        let circuit = self.circuits.get(&circuit_id).ok_or(CircuitError::Missing)?;
        if circuit.owner != sender {
            return Err(CircuitError::NotOwner);
        }
        Ok(circuit.tx.clone())
    }

    /// Forwards owner bytes to the game client on one circuit.
    pub async fn send_to_client(
        &self,
        circuit_id: i64,
        sender: ConnectionId,
        data: Vec<u8>,
    ) -> Result<(), CircuitError> {
        let tx = self.command_sender(circuit_id, sender)?;
        // A send error means the circuit task already quit; its cleanup is
        // running, so this behaves like a concurrent close.
        let _ = tx.send(CircuitCommand::Data(data)).await;
        Ok(())
    }

    /// Disconnects the game client on one circuit. The circuit task removes
    /// the table entry as part of its teardown.
    pub async fn close(&self, circuit_id: i64, sender: ConnectionId) -> Result<(), CircuitError> {
        let tx = self.command_sender(circuit_id, sender)?;
        let _ = tx.send(CircuitCommand::Close).await;
        Ok(())
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.circuits.len()
    }
}

/// Accept loop and per-client plumbing for the relay port.
pub struct RelayServer {
    registry: Arc<ConnectionRegistry>,
    circuits: Arc<RelayCircuits>,
    base_addr: String,
    reconnect_grace: Duration,
    next_circuit: AtomicI64,
}

impl RelayServer {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        circuits: Arc<RelayCircuits>,
        base_addr: String,
        reconnect_grace: Duration,
    ) -> Self {
        Self {
            registry,
            circuits,
            base_addr,
            reconnect_grace,
            next_circuit: AtomicI64::new(0),
        }
    }

    pub async fn run(self: Arc<Self>, listener: TcpListener) {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    error!(%err, "Relay accept failed");
                    continue;
                }
            };
            let circuit_id = self.next_circuit.fetch_add(1, Ordering::Relaxed);
            info!(%peer, circuit = circuit_id, "Accepted relay connection");
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                server.serve_client(circuit_id, stream, peer).await;
                info!(circuit = circuit_id, "Relay connection closed");
            });
        }
    }

    /// Runs one game client's circuit to completion.
    pub async fn serve_client<S>(self: &Arc<Self>, circuit_id: i64, stream: S, peer: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut read, write) = tokio::io::split(stream);

        let blob = match game_codec::read_handshake_frame(&mut read).await {
            Ok(blob) => blob,
            Err(err) => return log_client_error(&err),
        };
        let handshake = match Handshake::parse(&blob) {
            Ok(handshake) => handshake,
            Err(err) => {
                error!(%err, "Error in relay client handling");
                return;
            }
        };

        let label = handshake
            .server_address
            .split('.')
            .next()
            .unwrap_or_default();
        let owner_id = match label.parse::<ConnectionId>() {
            Ok(id) => id,
            Err(err) => {
                let message = if handshake.server_address == self.base_addr {
                    "I'm a proxy server, not an engineer!".to_string()
                } else {
                    format!("Invalid ConnectionId: {err}")
                };
                return reject(write, handshake.next_state, &message).await;
            }
        };

        let Some(owner) = self.registry.by_id(owner_id).await else {
            return reject(write, handshake.next_state, "Couldn't find that server").await;
        };

        let (tx, rx) = mpsc::channel(CIRCUIT_QUEUE);
        self.circuits.insert(circuit_id, owner_id, tx);
        tokio::spawn(write_circuit(write, rx));

        owner
            .send(ServerMessage::ProxyConnect {
                circuit_id,
                remote_addr: peer.ip(),
            })
            .await;
        owner
            .send(ServerMessage::ProxyC2SPacket {
                circuit_id,
                data: game_codec::frame(&blob),
            })
            .await;
        drop(owner);

        let mut buf = vec![0u8; RELAY_CHUNK];
        loop {
            if self.registry.by_id(owner_id).await.is_none() {
                break;
            }
            let n = match read.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) => {
                    if !is_disconnect(&err) {
                        error!(%err, "Error in relay client handling");
                    }
                    break;
                }
            };
            let Some(owner) = self.owner_with_grace(owner_id).await else {
                break;
            };
            owner
                .send(ServerMessage::ProxyC2SPacket {
                    circuit_id,
                    data: buf[..n].to_vec(),
                })
                .await;
        }

        self.circuits.remove(circuit_id);
        if let Some(owner) = self.registry.by_id(owner_id).await {
            owner.send(ServerMessage::ProxyDisconnect { circuit_id }).await;
        }
    }

    /// Resolves the circuit owner's current session, waiting out the
    /// reconnect grace window if the id is momentarily unregistered.
    async fn owner_with_grace(&self, owner_id: ConnectionId) -> Option<Arc<Session>> {
        let deadline = Instant::now() + self.reconnect_grace;
        loop {
            if let Some(session) = self.registry.by_id(owner_id).await {
                return Some(session);
            }
            if Instant::now() >= deadline {
                return None;
            }
            sleep(RECONNECT_POLL).await;
        }
    }
}

fn log_client_error(err: &GameFrameError) {
    if let GameFrameError::Io(io_err) = err {
        if is_disconnect(io_err) {
            return;
        }
    }
    error!(%err, "Error in relay client handling");
}

/// Writes a state-appropriate disconnect screen and hangs up.
async fn reject<W>(mut writer: W, next_state: i32, message: &str)
where
    W: AsyncWrite + Unpin,
{
    let frames = game_codec::disconnect_frames(message, next_state);
    if writer.write_all(&frames).await.is_ok() {
        let _ = writer.shutdown().await;
    }
}

/// Owns one circuit's write half; consumes commands until the circuit
/// closes, then half-closes the socket so the game client sees a clean EOF.
async fn write_circuit<W>(mut writer: W, mut rx: mpsc::Receiver<CircuitCommand>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(command) = rx.recv().await {
        match command {
            CircuitCommand::Data(data) => {
                if let Err(err) = writer.write_all(&data).await {
                    if !is_disconnect(&err) {
                        debug!(%err, "relay circuit write failed");
                    }
                    break;
                }
            }
            CircuitCommand::Close => break,
        }
    }
    let _ = writer.shutdown().await;
}
