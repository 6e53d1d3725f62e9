//! Live session handles and per-session frame I/O.
//!
//! Every accepted control connection gets one [`Outbound`] handle backed by
//! a dedicated writer task. The writer owns the socket write half and the
//! outbound stream cipher, so concurrent fan-outs enqueue messages and
//! frames never interleave; order from any single sender is preserved by the
//! channel. The read half stays with the session's driver task, wrapped in a
//! [`FrameReader`] that owns the inbound cipher.
//!
//! Outbound version gating happens here, once: [`Outbound::send`] consults
//! [`ServerMessage::for_recipient`] and silently withholds (or downgrades)
//! messages the recipient's negotiated protocol version cannot understand.

use std::io;
use std::net::IpAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::config::ExternalProxy;
use crate::crypto::{StreamDecryptor, StreamEncryptor};
use crate::geo::CountryCode;
use crate::protocol::codec::{self, DecodeError};
use crate::protocol::{ConnectionId, SecurityLevel, ServerMessage};

/// Outbound queue depth per session. Senders await when it fills, which is
/// the backpressure that keeps one slow client from buffering unboundedly.
const OUTBOUND_QUEUE: usize = 64;

/// Failures while reading one frame off the socket.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("i/o error reading frame: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Protocol(#[from] DecodeError),
}

/// True for the error kinds an ordinary peer disconnect produces.
pub fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
    )
}

enum WriterCommand {
    Message(ServerMessage),
    /// Stop writing; optionally send one critical `Error` frame first.
    Close { error: Option<String> },
}

/// Cloneable sending side of one session's writer task.
#[derive(Clone)]
pub struct Outbound {
    tx: mpsc::Sender<WriterCommand>,
    negotiated: u32,
}

impl Outbound {
    /// Spawns the writer task for one connection and returns its handle.
    pub fn spawn<W>(writer: W, encryptor: Option<StreamEncryptor>, negotiated: u32) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        tokio::spawn(write_loop(writer, encryptor, rx));
        Self { tx, negotiated }
    }

    /// The protocol version negotiated for this connection.
    pub fn negotiated(&self) -> u32 {
        self.negotiated
    }

    /// Enqueues a message, applying outbound version gating. Sends to an
    /// already-closed session are dropped; the closing driver cleans up.
    pub async fn send(&self, message: ServerMessage) {
        let Some(message) = message.for_recipient(self.negotiated) else {
            trace!(version = self.negotiated, "withholding message from old client");
            return;
        };
        if self.tx.send(WriterCommand::Message(message)).await.is_err() {
            trace!("dropped message for closed session");
        }
    }

    /// Sends a critical `Error` frame best-effort, then closes the socket.
    pub async fn close_with_error(&self, message: impl Into<String>) {
        let _ = self
            .tx
            .send(WriterCommand::Close {
                error: Some(message.into()),
            })
            .await;
    }

    /// Closes the socket without an error frame.
    pub async fn close(&self) {
        let _ = self.tx.send(WriterCommand::Close { error: None }).await;
    }
}

async fn write_loop<W>(
    mut writer: W,
    mut encryptor: Option<StreamEncryptor>,
    mut rx: mpsc::Receiver<WriterCommand>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(command) = rx.recv().await {
        match command {
            WriterCommand::Message(message) => {
                if let Err(err) = write_frame(&mut writer, &mut encryptor, &message).await {
                    if !is_disconnect(&err) {
                        debug!(%err, "session write failed");
                    }
                    break;
                }
            }
            WriterCommand::Close { error } => {
                if let Some(message) = error {
                    let frame = ServerMessage::Error {
                        message,
                        critical: true,
                    };
                    let _ = write_frame(&mut writer, &mut encryptor, &frame).await;
                }
                break;
            }
        }
    }
    let _ = writer.shutdown().await;
}

async fn write_frame<W>(
    writer: &mut W,
    encryptor: &mut Option<StreamEncryptor>,
    message: &ServerMessage,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut frame = message.encode_frame();
    if let Some(cipher) = encryptor {
        cipher.encrypt(&mut frame);
    }
    writer.write_all(&frame).await
}

/// Reads length-prefixed frames off a session's read half, decrypting the
/// byte stream when a cipher is installed.
pub struct FrameReader<R> {
    reader: R,
    decryptor: Option<StreamDecryptor>,
}

impl<R> FrameReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(reader: R, decryptor: Option<StreamDecryptor>) -> Self {
        Self { reader, decryptor }
    }

    /// Next `(type id, payload)` pair, or `None` once the peer disconnects.
    /// Disconnects mid-frame count as disconnects, not protocol errors.
    pub async fn next_frame(&mut self) -> Result<Option<(u8, Vec<u8>)>, FrameError> {
        let mut len_buf = [0u8; 4];
        match self.reader.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(err) if is_disconnect(&err) => return Ok(None),
            Err(err) => return Err(err.into()),
        }
        self.decrypt(&mut len_buf);
        let len = u32::from_be_bytes(len_buf) as usize;
        codec::check_frame_len(len)?;

        let mut id_buf = [0u8; 1];
        match self.reader.read_exact(&mut id_buf).await {
            Ok(_) => {}
            Err(err) if is_disconnect(&err) => return Ok(None),
            Err(err) => return Err(err.into()),
        }
        self.decrypt(&mut id_buf);

        let mut payload = vec![0u8; len - 1];
        match self.reader.read_exact(&mut payload).await {
            Ok(_) => {}
            Err(err) if is_disconnect(&err) => return Ok(None),
            Err(err) => return Err(err.into()),
        }
        self.decrypt(&mut payload);

        Ok(Some((id_buf[0], payload)))
    }

    fn decrypt(&mut self, data: &mut [u8]) {
        if let Some(cipher) = &mut self.decryptor {
            cipher.decrypt(data);
        }
    }
}

/// One registered control connection.
///
/// Identity and negotiated parameters are fixed at registration; everything
/// mutable about a session lives in its driver task or in the shared stores.
pub struct Session {
    pub id: ConnectionId,
    pub ip: IpAddr,
    pub account: Uuid,
    pub protocol_version: u32,
    pub security: SecurityLevel,
    pub country: Option<CountryCode>,
    pub external_proxy: Option<Arc<ExternalProxy>>,
    outbound: Outbound,
}

impl Session {
    pub fn new(
        id: ConnectionId,
        ip: IpAddr,
        account: Uuid,
        security: SecurityLevel,
        country: Option<CountryCode>,
        external_proxy: Option<Arc<ExternalProxy>>,
        outbound: Outbound,
    ) -> Self {
        Self {
            id,
            ip,
            account,
            protocol_version: outbound.negotiated(),
            security,
            country,
            external_proxy,
            outbound,
        }
    }

    pub async fn send(&self, message: ServerMessage) {
        self.outbound.send(message).await;
    }

    pub async fn close_with_error(&self, message: impl Into<String>) {
        self.outbound.close_with_error(message).await;
    }

    pub async fn close(&self) {
        self.outbound.close().await;
    }
}
