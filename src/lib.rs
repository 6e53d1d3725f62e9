#![cfg_attr(not(test), deny(clippy::panic))]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::too_many_arguments,
    clippy::too_many_lines,
    clippy::similar_names
)]

//! # World Beacon Server
//!
//! An in-memory rendezvous, relay, and NAT-traversal server for peer-hosted
//! game worlds. Each client keeps one authenticated TCP session through which
//! it publishes open worlds to friends, exchanges join requests, and
//! negotiates a direct, relayed, or hole-punched connection to a peer.
//!
//! No database, no cloud services. Run the binary and point clients at it.

/// Periodic connection-count reporting
pub mod analytics;

/// Server configuration and CLI arguments
pub mod config;

/// Handshake cryptography: RSA challenge, AES-CFB8 stream ciphers, auth digest
pub mod crypto;

/// IP geolocation lookup
pub mod geo;

/// Account identity verification
pub mod identity;

/// Structured logging configuration
pub mod logging;

/// Wire protocol: framing, field primitives, message types, identifiers
pub mod protocol;

/// Rate limiting implementation
pub mod rate_limit;

/// Main server orchestration
pub mod server;
