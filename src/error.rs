//! Error types for the broker messaging layer.
//!
//! The taxonomy separates failures that must surface immediately
//! ([`ConfigError`], [`ProtocolError`]) from transport failures that the
//! reconnect machinery absorbs ([`TransportError`]). Routing misses are not
//! errors at all; they are observability events.

use std::io;

use crate::envelope::PROTOCOL_VERSION;

/// Construction-time validation failures.
///
/// These are never retried and always surface synchronously to the caller.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// No broker host was provided.
    #[error("connection config requires a host")]
    MissingHost,
    /// The port was zero.
    #[error("connection config requires a port")]
    MissingPort,
    /// No virtual host was provided.
    #[error("connection config requires a virtual host")]
    MissingVirtualHost,
    /// No client identity was provided.
    #[error("connection config requires a client id")]
    MissingClientId,
    /// Another registered connection already uses this client identity.
    #[error("client id {0:?} is already registered")]
    DuplicateClientId(String),
    /// A topology element with this name was already registered.
    #[error("{kind} {name:?} is already registered")]
    DuplicateTopology {
        /// Element kind, e.g. `exchange` or `queue`.
        kind: &'static str,
        /// Name of the conflicting element.
        name: String,
    },
}

/// Envelope validation and encoding failures.
///
/// Raised before any network I/O on the outbound path and when an inbound
/// frame fails validation. Never retried.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// A mandatory broker-property header was absent.
    #[error("missing transport header: {0}")]
    MissingTransportHeader(&'static str),
    /// A mandatory application header was absent from the payload.
    #[error("missing application header: {0}")]
    MissingApplicationHeader(&'static str),
    /// The content-type tag did not name a known serialization.
    #[error("unrecognized content type: {0:?}")]
    UnsupportedContentType(String),
    /// The peer speaks a protocol version newer than this build supports.
    ///
    /// This is not a transient failure; the gateway software must be
    /// upgraded before these messages can be handled.
    #[error(
        "peer protocol version {advertised} exceeds supported version {supported}; upgrade required"
    )]
    UpgradeRequired {
        /// Version advertised by the peer.
        advertised: u32,
        /// Highest version this build understands ([`PROTOCOL_VERSION`]).
        supported: u32,
    },
    /// The reply correlation id failed basic sanity checks.
    #[error("invalid reply correlation id")]
    InvalidReplyCorrelation,
    /// A request message arrived without a `request_type` header.
    #[error("request message is missing request_type")]
    MissingRequestType,
    /// A response message arrived without a `response_type` header.
    #[error("response message is missing response_type")]
    MissingResponseType,
    /// An envelope was published without an exchange.
    #[error("publish requires an exchange")]
    MissingExchange,
    /// An envelope was built without a destination.
    #[error("message requires a destination")]
    MissingDestination,
    /// An envelope was built without a source.
    #[error("message requires a source")]
    MissingSource,
    /// An envelope reached `publish` without being finalized first.
    #[error("envelope must be finalized before publishing")]
    NotFinalized,
    /// Payload serialization failed.
    #[error("failed to encode payload")]
    Encode(#[source] bincode::error::EncodeError),
    /// Payload deserialization failed.
    #[error("failed to decode payload")]
    Decode(#[source] bincode::error::DecodeError),
    /// Payload compression failed.
    #[error("failed to compress payload")]
    Compress(#[source] io::Error),
    /// Payload decompression failed.
    #[error("failed to decompress payload")]
    Decompress(#[source] io::Error),
}

impl ProtocolError {
    /// Returns true when the failure signals that this software is too old
    /// to talk to the broker, as opposed to a malformed message.
    #[must_use]
    pub fn is_upgrade_required(&self) -> bool { matches!(self, Self::UpgradeRequired { .. }) }

    pub(crate) fn upgrade_required(advertised: u32) -> Self {
        Self::UpgradeRequired {
            advertised,
            supported: PROTOCOL_VERSION,
        }
    }
}

/// Link-level failures recovered by the reconnect state machine.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The underlying AMQP client reported a failure.
    #[error("broker error: {0}")]
    Broker(#[from] lapin::Error),
    /// An operation required a live link but the connection is down.
    #[error("not connected")]
    NotConnected,
    /// The outbound publish queue was full.
    #[error("publish queue full")]
    QueueFull,
    /// The connection actor has shut down.
    #[error("connection closed")]
    Closed,
}

/// Top-level error type exposed by `uplink`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Construction-time validation failure.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Envelope validation or encoding failure.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// Link-level failure.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// A registered handler rejected a message.
    #[error("handler failed: {0}")]
    Handler(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Wrap an arbitrary handler failure.
    #[must_use]
    pub fn handler<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Handler(Box::new(error))
    }
}

/// Canonical result alias used by `uplink` public APIs.
pub type Result<T> = std::result::Result<T, Error>;
