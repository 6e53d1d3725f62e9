//! Session establishment: protocol version, identity, stream ciphers.
//!
//! Everything here happens before the frame codec starts, as raw
//! big-endian reads and writes. Legacy clients (pre new-auth) hand over a
//! bare `{uuid, connection id}` pair and stay unencrypted and untrusted.
//! Newer clients run the RSA challenge exchange, prove (or fail to prove)
//! their account through the identity service, and from the encrypted
//! protocol version onward wrap the rest of the stream in AES-CFB8.

use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::warn;
use uuid::Uuid;

use crate::crypto::{
    self, CryptoError, ServerKeyPair, StreamDecryptor, StreamEncryptor, CHALLENGE_BYTES,
};
use crate::identity::{AccountVerifier, VerifyError};
use crate::protocol::{
    ConnectionId, ConnectionIdError, SecurityLevel, ServerMessage, ENCRYPTED_PROTOCOL_VERSION,
    NEW_AUTH_PROTOCOL_VERSION,
};
use crate::server::session::is_disconnect;

/// Magic prefix announcing the RSA exchange to secure clients.
pub const KEY_PREFIX: u32 = 0xFAFA_0000;

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    InvalidConnectionId(#[from] ConnectionIdError),
    #[error("Challenge failed")]
    ChallengeFailed,
    #[error("Failed to verify username. Please restart your game and the launcher.")]
    VerificationRejected,
    #[error("Mismatched UUID. Client said {claimed}. Expected {expected}")]
    AccountMismatch { claimed: Uuid, expected: Uuid },
    #[error("Unsupported UUID version {0}")]
    UnsupportedUuidVersion(usize),
}

/// Everything the driver needs to build a session once the handshake is
/// done.
#[derive(Debug)]
pub struct Credentials {
    pub account: Uuid,
    pub connection_id: ConnectionId,
    pub security: SecurityLevel,
    /// Present from [`ENCRYPTED_PROTOCOL_VERSION`] onward.
    pub ciphers: Option<(StreamEncryptor, StreamDecryptor)>,
    /// Soft identity complaint to forward once the session is framed.
    pub warning: Option<String>,
}

/// Reads the four version bytes that open every connection. `None` is a
/// clean pre-handshake EOF, which monitoring probes produce all the time.
pub async fn read_protocol_version<R>(reader: &mut R) -> io::Result<Option<u32>>
where
    R: AsyncRead + Unpin,
{
    match reader.read_u32().await {
        Ok(version) => Ok(Some(version)),
        Err(err) if is_disconnect(&err) => Ok(None),
        Err(err) => Err(err),
    }
}

/// Writes a critical `Error` frame in plaintext and closes the socket.
/// For rejections before a session writer exists.
pub async fn write_raw_error<W>(writer: &mut W, message: impl Into<String>) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = ServerMessage::Error {
        message: message.into(),
        critical: true,
    }
    .encode_frame();
    writer.write_all(&frame).await?;
    writer.shutdown().await
}

/// Runs the version-appropriate identity exchange on a fresh connection.
pub async fn authenticate<R, W>(
    reader: &mut R,
    writer: &mut W,
    protocol_version: u32,
    keys: &ServerKeyPair,
    verifier: &dyn AccountVerifier,
) -> Result<Credentials, HandshakeError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    if protocol_version < NEW_AUTH_PROTOCOL_VERSION {
        let account = read_uuid(reader).await?;
        let connection_id = ConnectionId::new(reader.read_u64().await?)?;
        return Ok(Credentials {
            account,
            connection_id,
            security: SecurityLevel::Insecure,
            ciphers: None,
            warning: None,
        });
    }

    let challenge = crypto::generate_challenge()?;
    writer.write_u32(KEY_PREFIX).await?;
    let der = keys.public_key_der();
    writer.write_u16(der.len() as u16).await?;
    writer.write_all(der).await?;
    writer.write_u16(CHALLENGE_BYTES as u16).await?;
    writer.write_all(&challenge).await?;
    writer.flush().await?;

    let encrypted_challenge = read_short_blob(reader).await?;
    if keys.decrypt(&encrypted_challenge)? != challenge {
        return Err(HandshakeError::ChallengeFailed);
    }

    let encrypted_key = read_short_blob(reader).await?;
    let session_key = keys.decrypt_session_key(&encrypted_key)?;
    let auth_key = crypto::auth_digest("", &session_key, der);

    let claimed = read_uuid(reader).await?;
    let username = read_short_string(reader).await?;
    let connection_id = ConnectionId::new(reader.read_u64().await?)?;

    let (security, warning) = match claimed.get_version_num() {
        4 => match verifier.verify(&username, &auth_key).await {
            Ok(verified) if verified == claimed => (SecurityLevel::Secure, None),
            Ok(verified) => {
                return Err(HandshakeError::AccountMismatch {
                    claimed,
                    expected: verified,
                })
            }
            Err(VerifyError::Rejected) => return Err(HandshakeError::VerificationRejected),
            Err(VerifyError::Unavailable(reason)) => {
                warn!(
                    %username,
                    %reason,
                    "identity service unavailable, accepting claimed identity"
                );
                (SecurityLevel::Secure, None)
            }
        },
        3 => {
            let expected = crypto::offline_account_id(&username);
            let warning = (claimed != expected).then(|| {
                format!("Mismatched UUID. Client said {claimed}. Expected {expected}")
            });
            (SecurityLevel::Offline, warning)
        }
        other => return Err(HandshakeError::UnsupportedUuidVersion(other)),
    };

    let ciphers =
        (protocol_version >= ENCRYPTED_PROTOCOL_VERSION).then(|| crypto::stream_ciphers(&session_key));

    Ok(Credentials {
        account: claimed,
        connection_id,
        security,
        ciphers,
        warning,
    })
}

async fn read_uuid<R>(reader: &mut R) -> io::Result<Uuid>
where
    R: AsyncRead + Unpin,
{
    let mut bytes = [0u8; 16];
    reader.read_exact(&mut bytes).await?;
    Ok(Uuid::from_bytes(bytes))
}

async fn read_short_blob<R>(reader: &mut R) -> io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let len = usize::from(reader.read_u16().await?);
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

async fn read_short_string<R>(reader: &mut R) -> io::Result<String>
where
    R: AsyncRead + Unpin,
{
    let bytes = read_short_blob(reader).await?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}
