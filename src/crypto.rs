//! Handshake cryptography.
//!
//! Secure sessions start with a short RSA exchange: the server sends its
//! 1024-bit public key and a fresh 16-byte challenge, the client returns the
//! challenge and an AES-128 session key, both RSA-encrypted. The SHA-1 of
//! (server id, session key, public key DER), rendered in Java's
//! signed-magnitude hex, becomes the auth token the identity service checks.
//! Encrypted protocol versions then wrap the whole byte stream in AES-CFB8
//! with the session key doubling as IV, one cipher per direction.

use aes::cipher::inout::InOutBuf;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::Aes128;
use md5::{Digest as _, Md5};
use rand_core::OsRng;
use rsa::pkcs8::EncodePublicKey;
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey};
use sha1::Sha1;
use thiserror::Error;
use uuid::Uuid;

/// Size of the random handshake challenge.
pub const CHALLENGE_BYTES: usize = 16;

/// Size of the AES session key a client may install.
pub const SESSION_KEY_BYTES: usize = 16;

/// RSA modulus size for the server's handshake keypair.
pub const RSA_KEY_BITS: usize = 1024;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("failed to generate handshake keypair")]
    KeygenFailure,
    #[error("failed to encode handshake public key")]
    EncodeFailure,
    #[error("failed to obtain secure random bytes")]
    EntropyUnavailable,
    #[error("failed to decrypt handshake payload")]
    DecryptFailure,
    #[error("session key must be {SESSION_KEY_BYTES} bytes, got {0}")]
    BadSessionKeyLength(usize),
}

/// The server's long-lived handshake keypair, generated once at startup and
/// shared by every secure handshake.
pub struct ServerKeyPair {
    private_key: RsaPrivateKey,
    public_key_der: Vec<u8>,
}

impl ServerKeyPair {
    pub fn generate() -> Result<Self, CryptoError> {
        let private_key =
            RsaPrivateKey::new(&mut OsRng, RSA_KEY_BITS).map_err(|_| CryptoError::KeygenFailure)?;
        let public_key_der = private_key
            .to_public_key()
            .to_public_key_der()
            .map_err(|_| CryptoError::EncodeFailure)?
            .as_bytes()
            .to_vec();
        Ok(Self {
            private_key,
            public_key_der,
        })
    }

    /// The public key as SPKI DER, the encoding clients expect.
    pub fn public_key_der(&self) -> &[u8] {
        &self.public_key_der
    }

    /// Decrypts one PKCS#1 v1.5 blob from the client.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.private_key
            .decrypt(Pkcs1v15Encrypt, ciphertext)
            .map_err(|_| CryptoError::DecryptFailure)
    }

    /// Decrypts the client's chosen AES session key.
    pub fn decrypt_session_key(
        &self,
        ciphertext: &[u8],
    ) -> Result<[u8; SESSION_KEY_BYTES], CryptoError> {
        let key = self.decrypt(ciphertext)?;
        let len = key.len();
        key.try_into()
            .map_err(|_| CryptoError::BadSessionKeyLength(len))
    }
}

/// A fresh random challenge for one handshake.
pub fn generate_challenge() -> Result<[u8; CHALLENGE_BYTES], CryptoError> {
    let mut challenge = [0u8; CHALLENGE_BYTES];
    getrandom::fill(&mut challenge).map_err(|_| CryptoError::EntropyUnavailable)?;
    Ok(challenge)
}

/// Outbound half of the session stream cipher (AES-128-CFB8, IV = key).
#[derive(Debug)]
pub struct StreamEncryptor(cfb8::Encryptor<Aes128>);

/// Inbound half of the session stream cipher.
#[derive(Debug)]
pub struct StreamDecryptor(cfb8::Decryptor<Aes128>);

impl StreamEncryptor {
    pub fn encrypt(&mut self, data: &mut [u8]) {
        let (blocks, _rest) = InOutBuf::from(data).into_chunks();
        self.0.encrypt_blocks_inout_mut(blocks);
    }
}

impl StreamDecryptor {
    pub fn decrypt(&mut self, data: &mut [u8]) {
        let (blocks, _rest) = InOutBuf::from(data).into_chunks();
        self.0.decrypt_blocks_inout_mut(blocks);
    }
}

/// Builds the per-direction stream ciphers for one session key.
pub fn stream_ciphers(
    key: &[u8; SESSION_KEY_BYTES],
) -> (StreamEncryptor, StreamDecryptor) {
    (
        StreamEncryptor(cfb8::Encryptor::new(key.into(), key.into())),
        StreamDecryptor(cfb8::Decryptor::new(key.into(), key.into())),
    )
}

/// SHA-1 over `(server_id, secret, public_key_der)` rendered as Java's
/// signed-magnitude hex integer: two's-complement-negative digests print as
/// `-` plus the magnitude, leading zeros stripped.
pub fn auth_digest(server_id: &str, secret: &[u8], public_key_der: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(server_id.as_bytes());
    hasher.update(secret);
    hasher.update(public_key_der);
    let mut digest: [u8; 20] = hasher.finalize().into();

    let negative = digest[0] & 0x80 != 0;
    if negative {
        negate_in_place(&mut digest);
    }
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    let magnitude = hex.trim_start_matches('0');
    let magnitude = if magnitude.is_empty() { "0" } else { magnitude };
    if negative {
        format!("-{magnitude}")
    } else {
        magnitude.to_string()
    }
}

/// The deterministic offline account id for a username: the raw MD5 of
/// `OfflinePlayer:<name>` with the version-3 and variant bits forced, the
/// same construction Java's `UUID.nameUUIDFromBytes` uses.
pub fn offline_account_id(username: &str) -> Uuid {
    let mut hasher = Md5::new();
    hasher.update(b"OfflinePlayer:");
    hasher.update(username.as_bytes());
    let mut bytes: [u8; 16] = hasher.finalize().into();
    bytes[6] = (bytes[6] & 0x0f) | 0x30;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;
    Uuid::from_bytes(bytes)
}

/// Two's-complement negation, big-endian.
fn negate_in_place(bytes: &mut [u8; 20]) {
    let mut carry = 1u16;
    for byte in bytes.iter_mut().rev() {
        let value = u16::from(!*byte) + carry;
        *byte = value as u8;
        carry = value >> 8;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pkcs8::DecodePublicKey;
    use rsa::RsaPublicKey;

    #[test]
    fn auth_digest_matches_known_vectors() {
        // The classic reference vectors for this hash format.
        assert_eq!(
            auth_digest("Notch", &[], &[]),
            "4ed1f46bbe04bc756bcb17c0c7ce3e4632f06a48"
        );
        assert_eq!(
            auth_digest("jeb_", &[], &[]),
            "-7c9d5b0044c130109a5d7b5fb5c317c02b4e28c1"
        );
        assert_eq!(
            auth_digest("simon", &[], &[]),
            "88e16a1019277b15d58faf0541e11910eb756f6"
        );
    }

    #[test]
    fn auth_digest_covers_all_three_inputs() {
        assert_eq!(
            auth_digest("", &[1, 2, 3], &[0xff, 0xee]),
            "51d0256254a0a79e2716362bb0546022f0f0e391"
        );
    }

    #[test]
    fn offline_ids_are_version_3_and_deterministic() {
        let id = offline_account_id("Notch");
        assert_eq!(id.to_string(), "b50ad385-829d-3141-a216-7e7d7539ba7f");
        assert_eq!(id.get_version_num(), 3);
        assert_eq!(id, offline_account_id("Notch"));
        assert_ne!(id, offline_account_id("notch"));

        let other = offline_account_id("wb_test_user");
        assert_eq!(other.to_string(), "031abd7d-725c-3467-99b0-ea35efd3e429");
    }

    #[test]
    fn stream_ciphers_round_trip() {
        let key = [7u8; SESSION_KEY_BYTES];
        let (mut enc, mut dec) = stream_ciphers(&key);
        let mut data = b"frame one".to_vec();
        enc.encrypt(&mut data);
        assert_ne!(&data, b"frame one");
        dec.decrypt(&mut data);
        assert_eq!(&data, b"frame one");
    }

    #[test]
    fn stream_ciphers_survive_arbitrary_chunking() {
        let key = [0x42u8; SESSION_KEY_BYTES];
        let (mut enc_whole, _) = stream_ciphers(&key);
        let (mut enc_split, mut dec) = stream_ciphers(&key);

        let mut whole = (0u8..=255).collect::<Vec<u8>>();
        enc_whole.encrypt(&mut whole);

        let mut split = (0u8..=255).collect::<Vec<u8>>();
        for chunk in split.chunks_mut(7) {
            enc_split.encrypt(chunk);
        }
        assert_eq!(whole, split);

        for chunk in split.chunks_mut(3) {
            dec.decrypt(chunk);
        }
        assert_eq!(split, (0u8..=255).collect::<Vec<u8>>());
    }

    #[test]
    fn server_keys_decrypt_what_clients_encrypt() {
        let keys = ServerKeyPair::generate().expect("keygen");
        let public = RsaPublicKey::from_public_key_der(keys.public_key_der()).expect("spki der");
        let challenge = generate_challenge().expect("challenge");

        let encrypted_challenge = public
            .encrypt(&mut OsRng, Pkcs1v15Encrypt, &challenge)
            .expect("encrypt");
        assert_eq!(
            keys.decrypt(&encrypted_challenge).expect("decrypt"),
            challenge
        );

        let session_key = [9u8; SESSION_KEY_BYTES];
        let encrypted_key = public
            .encrypt(&mut OsRng, Pkcs1v15Encrypt, &session_key)
            .expect("encrypt");
        assert_eq!(
            keys.decrypt_session_key(&encrypted_key).expect("decrypt"),
            session_key
        );

        let wrong = keys.decrypt_session_key(&[0u8; 128]);
        assert!(wrong.is_err());
    }
}
