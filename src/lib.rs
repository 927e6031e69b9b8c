//! Public API for the `uplink` library.
//!
//! This crate provides the messaging layer of a gateway process: persistent
//! broker connections with automatic reconnect and topology replay, a
//! versioned message envelope protocol with correlation tracking and
//! compression, and routing of inbound traffic to registered subsystems.

mod backoff;
pub mod codec;
pub mod config;
pub mod connection;
pub mod correlation;
pub mod envelope;
pub mod error;
mod link;
pub mod metrics;
pub mod publish;
pub mod registry;
pub mod router;
pub mod topology;
pub mod uplink;

pub use codec::{COMPRESSION_THRESHOLD, EnvelopeCodec, ReceiptMeta};
pub use config::{BackoffConfig, ConnectionConfig, Credentials};
pub use connection::{Connection, ConnectionEvent, ConnectionState, PublishReceipt};
pub use correlation::{CorrelationEntry, CorrelationTracker};
pub use envelope::{
    Body,
    ContentType,
    DataType,
    Envelope,
    InboundDelivery,
    MessageType,
    NO_REPLY_PREFIX,
    PROTOCOL_VERSION,
};
pub use error::{ConfigError, Error, ProtocolError, Result, TransportError};
pub use publish::{PublishPolicy, PublishPriority};
pub use registry::ConnectionRegistry;
pub use router::{Handler, RouteOutcome, Router};
pub use topology::{
    BindingDeclaration,
    ExchangeDeclaration,
    ExchangeKind,
    QueueDeclaration,
    Subscription,
};
pub use uplink::{Uplink, UplinkConfig};
