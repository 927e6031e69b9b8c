//! The message envelope exchanged with the broker.
//!
//! An [`Envelope`] carries two header scopes that are never merged: transport
//! headers travel in the broker message properties and are unauthenticated,
//! while application headers live inside the serialized payload alongside the
//! body. Correlation identifiers link requests to their eventual responses;
//! identifiers carrying the reserved [`NO_REPLY_PREFIX`] mark requests that
//! expect no reply and must never be tracked.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ProtocolError;
use crate::publish::PublishPriority;

/// Version of the gateway messaging protocol this build implements.
pub const PROTOCOL_VERSION: u32 = 7;

/// Reserved correlation-id prefix meaning "no reply expected".
///
/// Identifiers beginning with this prefix are never inserted into, nor looked
/// up in, the correlation tracker.
pub const NO_REPLY_PREFIX: &str = "xx";

/// Transport header carrying the protocol version.
pub const HDR_VERSION: &str = "yombo_version";
/// Transport header carrying the ordered hop trail.
pub const HDR_ROUTE: &str = "route";
/// Transport header reserved for a body signature; may be empty.
pub const HDR_BODY_SIGNATURE: &str = "body_signature";
/// Transport header stamped with the send time at publish.
pub const HDR_SENT_AT: &str = "msg_sent_at";

/// Whether a message asks for work or answers a previous ask.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    /// A message that may expect a correlated response.
    Request,
    /// A message answering a previous request.
    Response,
}

impl MessageType {
    /// Wire tag for this message type.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Request => "request",
            MessageType::Response => "response",
        }
    }
}

/// Shape of the opaque body payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    /// A single serialized record.
    Object,
    /// An ordered batch of serialized records.
    Objects,
    /// A plain text payload.
    Text,
}

impl DataType {
    /// Wire tag for this data type.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            DataType::Object => "object",
            DataType::Objects => "objects",
            DataType::Text => "string",
        }
    }
}

/// Serialization + compression tag carried in the broker content-type
/// property.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContentType {
    /// Plain serialized payload.
    Bincode,
    /// Serialized payload recompressed with zstd.
    BincodeZstd,
}

impl ContentType {
    /// Wire tag for this content type.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ContentType::Bincode => "bincode",
            ContentType::BincodeZstd => "bincode+zstd",
        }
    }

    /// Parse a wire tag, rejecting anything unrecognized.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::UnsupportedContentType`] for unknown tags.
    pub fn parse(tag: &str) -> Result<Self, ProtocolError> {
        match tag {
            "bincode" => Ok(ContentType::Bincode),
            "bincode+zstd" => Ok(ContentType::BincodeZstd),
            other => Err(ProtocolError::UnsupportedContentType(other.to_owned())),
        }
    }

    /// Returns true when the payload was compressed.
    #[must_use]
    pub fn is_compressed(self) -> bool { matches!(self, ContentType::BincodeZstd) }
}

/// Opaque message body.
///
/// Subsystems serialize their own records; this layer only tags the shape so
/// the receiver knows what to expect. The variant determines the `data_type`
/// application header.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Body {
    /// One serialized record.
    Object(Vec<u8>),
    /// A batch of serialized records, order preserved.
    Objects(Vec<Vec<u8>>),
    /// A plain text payload.
    Text(String),
}

impl Body {
    /// The `data_type` header value implied by this body.
    #[must_use]
    pub fn data_type(&self) -> DataType {
        match self {
            Body::Object(_) => DataType::Object,
            Body::Objects(_) => DataType::Objects,
            Body::Text(_) => DataType::Text,
        }
    }

    /// Construct an empty object body.
    #[must_use]
    pub fn empty() -> Self { Body::Object(Vec::new()) }
}

/// Application headers carried inside the serialized payload.
///
/// Every field listed as mandatory by the wire contract is typed as
/// non-optional here; inbound validation happens before construction.
#[derive(Clone, Debug, PartialEq)]
pub struct AppHeaders {
    /// Originating component, suffixed with the client identity.
    pub source: String,
    /// Component the message is addressed to.
    pub destination: String,
    /// Request or response.
    pub message_type: MessageType,
    /// Protocol version the sender speaks.
    pub protocol_version: u32,
    /// Identifier linking this message to its eventual response.
    pub correlation_id: String,
    /// On responses, the correlation id of the originating request.
    pub reply_correlation_id: Option<String>,
    /// Seconds since the Unix epoch at message creation.
    pub created_at: f64,
    /// Shape of the body payload.
    pub data_type: DataType,
    /// Routing-table key for requests that are not tracked replies.
    pub gateway_routing: Option<String>,
    /// Request discriminator, mandatory on requests at dispatch time.
    pub request_type: Option<String>,
    /// Response discriminator, mandatory on responses at dispatch time.
    pub response_type: Option<String>,
    /// Free-form message-specific keys.
    pub extra: BTreeMap<String, String>,
}

/// Wire form of the application headers.
///
/// Everything is optional here so that presence of each mandatory header can
/// be validated by name rather than surfacing as an opaque decode failure.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct WireHeaders {
    pub source: Option<String>,
    pub destination: Option<String>,
    pub message_type: Option<MessageType>,
    pub protocol_version: Option<u32>,
    pub correlation_id: Option<String>,
    pub reply_correlation_id: Option<String>,
    pub msg_created_at: Option<f64>,
    pub data_type: Option<DataType>,
    pub gateway_routing: Option<String>,
    pub request_type: Option<String>,
    pub response_type: Option<String>,
    pub extra: BTreeMap<String, String>,
}

impl AppHeaders {
    pub(crate) fn to_wire(&self) -> WireHeaders {
        WireHeaders {
            source: Some(self.source.clone()),
            destination: Some(self.destination.clone()),
            message_type: Some(self.message_type),
            protocol_version: Some(self.protocol_version),
            correlation_id: Some(self.correlation_id.clone()),
            reply_correlation_id: self.reply_correlation_id.clone(),
            msg_created_at: Some(self.created_at),
            data_type: Some(self.data_type),
            gateway_routing: self.gateway_routing.clone(),
            request_type: self.request_type.clone(),
            response_type: self.response_type.clone(),
            extra: self.extra.clone(),
        }
    }

    pub(crate) fn from_wire(wire: WireHeaders) -> Result<Self, ProtocolError> {
        let missing = ProtocolError::MissingApplicationHeader;
        Ok(Self {
            source: wire.source.ok_or(missing("source"))?,
            destination: wire.destination.ok_or(missing("destination"))?,
            message_type: wire.message_type.ok_or(missing("message_type"))?,
            protocol_version: wire.protocol_version.ok_or(missing("protocol_version"))?,
            correlation_id: wire.correlation_id.ok_or(missing("correlation_id"))?,
            reply_correlation_id: wire.reply_correlation_id,
            created_at: wire.msg_created_at.ok_or(missing("msg_created_at"))?,
            data_type: wire.data_type.ok_or(missing("data_type"))?,
            gateway_routing: wire.gateway_routing,
            request_type: wire.request_type,
            response_type: wire.response_type,
            extra: wire.extra,
        })
    }
}

/// Unsigned headers carried in the broker message properties.
///
/// Used only for low-level routing decisions before the payload is trusted.
#[derive(Clone, Debug, PartialEq)]
pub struct TransportHeaders {
    /// Protocol version advertised to the broker side.
    pub version: u32,
    /// Ordered hop trail; each relay appends itself.
    pub route: Vec<String>,
    /// Reserved body-signature slot; empty when unsigned.
    pub body_signature: String,
    /// Seconds since the Unix epoch at send time; stamped at publish.
    pub sent_at: Option<f64>,
}

impl TransportHeaders {
    pub(crate) fn outbound(route: Vec<String>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            route,
            body_signature: String::new(),
            sent_at: None,
        }
    }
}

/// Result of finalizing an envelope: the bytes that go on the wire.
#[derive(Clone, Debug, PartialEq)]
pub struct Finalized {
    /// Content-type tag describing the payload encoding.
    pub content_type: ContentType,
    /// Serialized (and possibly compressed) payload.
    pub payload: bytes::Bytes,
    /// Payload size before compression was considered.
    pub uncompressed_size: usize,
    /// Final size as a percentage of the uncompressed size.
    pub compression_percent: f64,
}

/// The unit exchanged with the broker.
///
/// Built through the codec's request/response builders, finalized exactly
/// once before publish, and reconstructed from raw frames on the inbound
/// path.
#[derive(Clone, Debug)]
pub struct Envelope {
    /// Exchange the message is published to; empty on inbound envelopes.
    pub exchange: String,
    /// Broker routing key.
    pub routing_key: String,
    /// Outbound delivery priority.
    pub priority: PublishPriority,
    /// Unsigned broker-property headers.
    pub transport: TransportHeaders,
    /// Authenticated application headers.
    pub headers: AppHeaders,
    /// Opaque payload.
    pub body: Body,
    pub(crate) finalized: Option<Finalized>,
}

impl Envelope {
    /// The wire payload produced by finalization, if any.
    #[must_use]
    pub fn finalized(&self) -> Option<&Finalized> { self.finalized.as_ref() }

    /// Whether this message expects a correlated reply.
    #[must_use]
    pub fn expects_reply(&self) -> bool {
        self.headers.message_type == MessageType::Request
            && !is_no_reply(&self.headers.correlation_id)
    }
}

/// Generate a fresh, globally-unique correlation identifier.
#[must_use]
pub fn fresh_correlation_id() -> String { Uuid::new_v4().simple().to_string() }

/// Generate a correlation identifier marked as "no reply expected".
#[must_use]
pub fn no_reply_correlation_id() -> String {
    format!("{NO_REPLY_PREFIX}_{}", Uuid::new_v4().simple())
}

/// Whether a correlation identifier denotes "no reply expected".
#[must_use]
pub fn is_no_reply(correlation_id: &str) -> bool { correlation_id.starts_with(NO_REPLY_PREFIX) }

/// Sanity bounds for reply correlation ids arriving off the wire.
pub(crate) fn is_valid_reply_correlation_id(id: &str) -> bool {
    (15..=100).contains(&id.len())
        && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Seconds since the Unix epoch, as carried in message timestamps.
#[must_use]
pub fn epoch_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0.0, |d| d.as_secs_f64())
}

/// Raw transport header values extracted from broker message properties,
/// prior to validation.
#[derive(Clone, Debug, Default)]
pub struct TransportHeaderValues {
    /// `yombo_version`, if present.
    pub version: Option<i64>,
    /// `route`, if present.
    pub route: Option<Vec<String>>,
    /// `body_signature`, if present.
    pub body_signature: Option<String>,
    /// `msg_sent_at`, if present.
    pub sent_at: Option<f64>,
}

/// Broker message properties accompanying a raw inbound frame.
#[derive(Clone, Debug, Default)]
pub struct DeliveryProps {
    /// Content-type tag, if the sender set one.
    pub content_type: Option<String>,
    /// Correlation id mirrored into the broker properties, if any.
    pub correlation_id: Option<String>,
    /// Raw transport headers.
    pub headers: TransportHeaderValues,
}

/// A raw frame delivered by a broker subscription, before parsing.
#[derive(Clone, Debug)]
pub struct InboundDelivery {
    /// Routing key the broker delivered the message under.
    pub routing_key: String,
    /// Broker message properties.
    pub props: DeliveryProps,
    /// Raw payload bytes.
    pub body: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_ids_are_unique_and_not_no_reply() {
        let a = fresh_correlation_id();
        let b = fresh_correlation_id();
        assert_ne!(a, b);
        assert!(!is_no_reply(&a));
    }

    #[test]
    fn no_reply_ids_carry_the_reserved_prefix() {
        let id = no_reply_correlation_id();
        assert!(is_no_reply(&id));
        assert!(id.starts_with("xx_"));
    }

    #[test]
    fn reply_id_sanity_rejects_short_and_odd_values() {
        assert!(!is_valid_reply_correlation_id("short"));
        assert!(!is_valid_reply_correlation_id("has spaces in the middle"));
        assert!(is_valid_reply_correlation_id(&fresh_correlation_id()));
        assert!(is_valid_reply_correlation_id(&no_reply_correlation_id()));
    }

    #[test]
    fn wire_headers_round_trip_through_validation() {
        let headers = AppHeaders {
            source: "gateway.configs:gw_1".into(),
            destination: "server.configs".into(),
            message_type: MessageType::Request,
            protocol_version: PROTOCOL_VERSION,
            correlation_id: fresh_correlation_id(),
            reply_correlation_id: None,
            created_at: epoch_now(),
            data_type: DataType::Object,
            gateway_routing: Some("config".into()),
            request_type: Some("get_config".into()),
            response_type: None,
            extra: BTreeMap::new(),
        };
        let rebuilt = AppHeaders::from_wire(headers.to_wire()).expect("valid headers");
        assert_eq!(rebuilt, headers);
    }

    #[test]
    fn missing_mandatory_header_is_named() {
        let mut wire = AppHeaders {
            source: "s".into(),
            destination: "d".into(),
            message_type: MessageType::Request,
            protocol_version: PROTOCOL_VERSION,
            correlation_id: fresh_correlation_id(),
            reply_correlation_id: None,
            created_at: epoch_now(),
            data_type: DataType::Object,
            gateway_routing: None,
            request_type: None,
            response_type: None,
            extra: BTreeMap::new(),
        }
        .to_wire();
        wire.destination = None;
        let err = AppHeaders::from_wire(wire).expect_err("must reject");
        assert!(matches!(
            err,
            ProtocolError::MissingApplicationHeader("destination")
        ));
    }
}
