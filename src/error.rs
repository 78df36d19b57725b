//! src/error.rs
//!
//! Defines the library's custom, comprehensive `Error` enum using `thiserror`.

use crate::domain::PeerId;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize message: {0}")]
    BsonSer(#[from] bson::ser::Error),

    #[error("Failed to deserialize message: {0}")]
    BsonDe(#[from] bson::de::Error),

    #[error("PGP error: {0}")]
    Pgp(#[from] pgp::errors::Error),

    #[error("Invalid identity key file")]
    InvalidKeyFile,

    #[error("Tokio task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("Failed to initiate connection to {0}: {1}")]
    ConnectFailed(std::net::SocketAddr, #[source] quinn::ConnectError),

    #[error("Connection to {0} failed during establishment: {1}")]
    ConnectionEstablishFailed(std::net::SocketAddr, #[source] quinn::ConnectionError),

    #[error("An established connection failed: {0}")]
    Connection(#[from] quinn::ConnectionError),

    #[error("Failed to write to network stream: {0}")]
    WriteStream(#[from] quinn::WriteError),

    #[error("Failed to read from network stream: {0}")]
    ReadStream(String),

    #[error("Directory lookup failed: {0}")]
    Directory(#[from] reqwest::Error),

    /// No outbound path exists for `peer` and no directory entry resolved it either.
    #[error("No route to peer {0}")]
    NoRoute(PeerId),

    /// Mutual-authentication challenge failed: bad nonce echo, malformed key, or bad
    /// signature. Fatal to the connection attempt; never retried automatically.
    #[error("Handshake with remote failed: {0}")]
    HandshakeFailure(String),

    /// A frame could not be decoded as a well-formed `Message`, or an expected field was
    /// missing. Fatal to the receiving stream.
    #[error("Protocol violation on stream: {0}")]
    ProtocolViolation(String),

    /// An Application message payload could not be decrypted or its signature did not
    /// verify. The message is dropped, not propagated.
    #[error("Failed to decrypt application payload: {0}")]
    DecryptionFailure(String),

    /// Raw bytes handed to the signaling adapter were not parseable as a SIP message.
    #[error("Failed to parse signaling payload: {0}")]
    SignalingParseFailure(String),

    /// Outbound hub dial exceeded the configured timeout. Caller enqueues instead of
    /// treating this as a hard failure.
    #[error("Timed out dialing hub at {0}")]
    DialTimeout(std::net::SocketAddr),
}
