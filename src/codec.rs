//! Building, finalizing and parsing envelopes.
//!
//! The [`EnvelopeCodec`] is the single place where wire bytes are produced
//! and consumed. Outbound messages are assembled through the request and
//! response builders, then [`finalize`](EnvelopeCodec::finalize)d into a
//! serialized payload that is compressed when it exceeds
//! [`COMPRESSION_THRESHOLD`]. Inbound frames are validated header by header
//! before anything downstream may trust them. Both directions are pure:
//! no I/O happens here.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::envelope::{
    AppHeaders,
    Body,
    ContentType,
    DeliveryProps,
    Envelope,
    Finalized,
    InboundDelivery,
    MessageType,
    PROTOCOL_VERSION,
    TransportHeaders,
    WireHeaders,
    epoch_now,
    fresh_correlation_id,
    is_no_reply,
    is_valid_reply_correlation_id,
    no_reply_correlation_id,
};
use crate::error::ProtocolError;
use crate::metrics;
use crate::publish::PublishPriority;

/// Serialized payloads larger than this are recompressed before publish.
pub const COMPRESSION_THRESHOLD: usize = 900;

/// zstd level used when a payload crosses the threshold.
const COMPRESSION_LEVEL: i32 = 3;

/// Receipt metadata accompanying every parsed inbound message.
#[derive(Clone, Debug)]
pub struct ReceiptMeta {
    /// Monotonic receipt instant, used for round-trip timing.
    pub received_at: Instant,
    /// Wall-clock receipt time, seconds since the Unix epoch.
    pub received_at_epoch: f64,
    /// Payload encoding the sender declared.
    pub content_type: ContentType,
    /// Send time stamped by the sender's transport layer.
    pub sent_at: f64,
    /// Creation time from the application headers.
    pub created_at: f64,
    /// Raw payload size in bytes, before decompression.
    pub payload_size: usize,
    /// Elapsed time since the correlated request was sent, when this message
    /// resolved a tracked correlation.
    pub round_trip: Option<Duration>,
}

#[derive(Serialize)]
struct WirePayloadRef<'a> {
    headers: WireHeaders,
    body: &'a Body,
}

#[derive(Deserialize)]
struct WirePayload {
    headers: WireHeaders,
    body: Body,
}

/// How an outbound request's correlation identifier is chosen.
#[derive(Clone, Debug, Default)]
enum CorrelationMode {
    /// Generate a fresh unique id; a reply may be tracked.
    #[default]
    Fresh,
    /// Generate an id carrying the no-reply prefix; never tracked.
    Suppressed,
    /// Use the identifier supplied by the caller.
    Explicit(String),
}

/// Builds and parses envelopes on behalf of one client identity.
///
/// The identity is appended to the `source` header and to the route hop
/// trail of every message this codec produces.
#[derive(Clone, Debug)]
pub struct EnvelopeCodec {
    identity: String,
}

impl EnvelopeCodec {
    /// Create a codec for the given client identity.
    #[must_use]
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
        }
    }

    /// The client identity stamped on outbound messages.
    #[must_use]
    pub fn identity(&self) -> &str { &self.identity }

    fn route_hop(&self) -> String { format!("gw.uplink:{}", self.identity) }

    /// Start building a request envelope.
    #[must_use]
    pub fn request(
        &self,
        exchange: impl Into<String>,
        source: impl Into<String>,
        destination: impl Into<String>,
        body: Body,
    ) -> RequestBuilder<'_> {
        RequestBuilder {
            codec: self,
            exchange: exchange.into(),
            routing_key: "*".to_owned(),
            source: source.into(),
            destination: destination.into(),
            body,
            correlation: CorrelationMode::Fresh,
            gateway_routing: None,
            request_type: None,
            priority: PublishPriority::Normal,
            extra: BTreeMap::new(),
        }
    }

    /// Start building a response to a previously received request.
    ///
    /// The request's correlation id is copied into `reply_correlation_id`
    /// unless it carries the no-reply prefix, in which case the response is
    /// sent uncorrelated.
    #[must_use]
    pub fn response_to(
        &self,
        exchange: impl Into<String>,
        source: impl Into<String>,
        destination: impl Into<String>,
        body: Body,
        request: &AppHeaders,
    ) -> ResponseBuilder<'_> {
        let reply_correlation_id = if is_no_reply(&request.correlation_id) {
            None
        } else {
            Some(request.correlation_id.clone())
        };
        ResponseBuilder {
            codec: self,
            exchange: exchange.into(),
            routing_key: "*".to_owned(),
            source: source.into(),
            destination: destination.into(),
            body,
            reply_correlation_id,
            response_type: None,
            gateway_routing: None,
            priority: PublishPriority::Normal,
            extra: BTreeMap::new(),
        }
    }

    #[expect(
        clippy::too_many_arguments,
        reason = "internal assembly point shared by both builders"
    )]
    fn assemble(
        &self,
        exchange: String,
        routing_key: String,
        source: String,
        destination: String,
        message_type: MessageType,
        correlation_id: String,
        reply_correlation_id: Option<String>,
        gateway_routing: Option<String>,
        request_type: Option<String>,
        response_type: Option<String>,
        priority: PublishPriority,
        extra: BTreeMap<String, String>,
        body: Body,
    ) -> Result<Envelope, ProtocolError> {
        if exchange.is_empty() {
            return Err(ProtocolError::MissingExchange);
        }
        if source.is_empty() {
            return Err(ProtocolError::MissingSource);
        }
        if destination.is_empty() {
            return Err(ProtocolError::MissingDestination);
        }
        let data_type = body.data_type();
        Ok(Envelope {
            exchange,
            routing_key,
            priority,
            transport: TransportHeaders::outbound(vec![self.route_hop()]),
            headers: AppHeaders {
                source: format!("{source}:{}", self.identity),
                destination,
                message_type,
                protocol_version: PROTOCOL_VERSION,
                correlation_id,
                reply_correlation_id,
                created_at: epoch_now(),
                data_type,
                gateway_routing,
                request_type,
                response_type,
                extra,
            },
            body,
            finalized: None,
        })
    }

    /// Serialize an envelope's payload for the wire.
    ///
    /// Payloads above [`COMPRESSION_THRESHOLD`] bytes are recompressed and
    /// the content type switches to the compressed tag. Finalizing an
    /// already-finalized envelope is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::Encode`] or [`ProtocolError::Compress`] when
    /// serialization fails.
    pub fn finalize(&self, envelope: &mut Envelope) -> Result<(), ProtocolError> {
        if envelope.finalized.is_some() {
            return Ok(());
        }
        let payload = WirePayloadRef {
            headers: envelope.headers.to_wire(),
            body: &envelope.body,
        };
        let raw = bincode::serde::encode_to_vec(&payload, bincode::config::standard())
            .map_err(ProtocolError::Encode)?;
        let uncompressed_size = raw.len();
        let (bytes, content_type) = if uncompressed_size > COMPRESSION_THRESHOLD {
            let compressed =
                zstd::encode_all(&raw[..], COMPRESSION_LEVEL).map_err(ProtocolError::Compress)?;
            (compressed, ContentType::BincodeZstd)
        } else {
            (raw, ContentType::Bincode)
        };
        #[expect(clippy::cast_precision_loss, reason = "payload sizes fit f64 comfortably")]
        let compression_percent = if uncompressed_size == 0 {
            100.0
        } else {
            (bytes.len() as f64 / uncompressed_size as f64) * 100.0
        };
        metrics::observe_compression(compression_percent);
        envelope.finalized = Some(Finalized {
            content_type,
            payload: bytes::Bytes::from(bytes),
            uncompressed_size,
            compression_percent,
        });
        Ok(())
    }

    /// Validate and decode a raw inbound frame.
    ///
    /// Checks every mandatory transport header, rejects unknown content
    /// types and protocol versions newer than [`PROTOCOL_VERSION`], then
    /// decompresses and decodes the payload and checks every mandatory
    /// application header by name.
    ///
    /// # Errors
    ///
    /// Returns a [`ProtocolError`] naming the first failed check.
    /// [`ProtocolError::UpgradeRequired`] specifically means this software
    /// is too old for the peer, not that the message was malformed.
    pub fn parse_inbound(
        &self,
        delivery: &InboundDelivery,
    ) -> Result<(Envelope, ReceiptMeta), ProtocolError> {
        let received_at = Instant::now();
        let received_at_epoch = epoch_now();
        let props: &DeliveryProps = &delivery.props;

        let content_tag = props
            .content_type
            .as_deref()
            .ok_or(ProtocolError::MissingTransportHeader("content_type"))?;
        let content_type = ContentType::parse(content_tag)?;

        let raw = &props.headers;
        let advertised = raw
            .version
            .ok_or(ProtocolError::MissingTransportHeader("yombo_version"))?;
        let route = raw
            .route
            .clone()
            .ok_or(ProtocolError::MissingTransportHeader("route"))?;
        let body_signature = raw
            .body_signature
            .clone()
            .ok_or(ProtocolError::MissingTransportHeader("body_signature"))?;
        let sent_at = raw
            .sent_at
            .ok_or(ProtocolError::MissingTransportHeader("msg_sent_at"))?;

        let advertised = u32::try_from(advertised).unwrap_or(u32::MAX);
        if advertised > PROTOCOL_VERSION {
            return Err(ProtocolError::upgrade_required(advertised));
        }

        let payload_size = delivery.body.len();
        let decompressed;
        let raw_payload: &[u8] = if content_type.is_compressed() {
            decompressed =
                zstd::decode_all(&delivery.body[..]).map_err(ProtocolError::Decompress)?;
            &decompressed
        } else {
            &delivery.body
        };

        let (payload, _consumed): (WirePayload, usize) =
            bincode::serde::decode_from_slice(raw_payload, bincode::config::standard())
                .map_err(ProtocolError::Decode)?;
        let headers = AppHeaders::from_wire(payload.headers)?;

        if let Some(reply_id) = headers.reply_correlation_id.as_deref()
            && !is_valid_reply_correlation_id(reply_id)
        {
            return Err(ProtocolError::InvalidReplyCorrelation);
        }

        let created_at = headers.created_at;
        let envelope = Envelope {
            exchange: String::new(),
            routing_key: delivery.routing_key.clone(),
            priority: PublishPriority::Normal,
            transport: TransportHeaders {
                version: advertised,
                route,
                body_signature,
                sent_at: Some(sent_at),
            },
            headers,
            body: payload.body,
            finalized: None,
        };
        let receipt = ReceiptMeta {
            received_at,
            received_at_epoch,
            content_type,
            sent_at,
            created_at,
            payload_size,
            round_trip: None,
        };
        Ok((envelope, receipt))
    }
}

/// Builder for request envelopes; created by [`EnvelopeCodec::request`].
pub struct RequestBuilder<'a> {
    codec: &'a EnvelopeCodec,
    exchange: String,
    routing_key: String,
    source: String,
    destination: String,
    body: Body,
    correlation: CorrelationMode,
    gateway_routing: Option<String>,
    request_type: Option<String>,
    priority: PublishPriority,
    extra: BTreeMap<String, String>,
}

impl RequestBuilder<'_> {
    /// Override the broker routing key (defaults to `*`).
    #[must_use]
    pub fn routing_key(mut self, key: impl Into<String>) -> Self {
        self.routing_key = key.into();
        self
    }

    /// Set the request discriminator.
    #[must_use]
    pub fn request_type(mut self, request_type: impl Into<String>) -> Self {
        self.request_type = Some(request_type.into());
        self
    }

    /// Set the routing-table key for the receiving gateway.
    #[must_use]
    pub fn gateway_routing(mut self, key: impl Into<String>) -> Self {
        self.gateway_routing = Some(key.into());
        self
    }

    /// Mark this request as expecting no reply.
    ///
    /// The correlation id is generated with the reserved no-reply prefix and
    /// is never registered with the correlation tracker.
    #[must_use]
    pub fn no_reply(mut self) -> Self {
        self.correlation = CorrelationMode::Suppressed;
        self
    }

    /// Use a caller-chosen correlation id instead of generating one.
    #[must_use]
    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation = CorrelationMode::Explicit(id.into());
        self
    }

    /// Send this request ahead of queued normal-priority traffic.
    #[must_use]
    pub fn high_priority(mut self) -> Self {
        self.priority = PublishPriority::High;
        self
    }

    /// Attach a message-specific header.
    #[must_use]
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Assemble the envelope.
    ///
    /// # Errors
    ///
    /// Returns a [`ProtocolError`] when the exchange, source or destination
    /// is empty.
    pub fn build(self) -> Result<Envelope, ProtocolError> {
        let correlation_id = match self.correlation {
            CorrelationMode::Fresh => fresh_correlation_id(),
            CorrelationMode::Suppressed => no_reply_correlation_id(),
            CorrelationMode::Explicit(id) => id,
        };
        self.codec.assemble(
            self.exchange,
            self.routing_key,
            self.source,
            self.destination,
            MessageType::Request,
            correlation_id,
            None,
            self.gateway_routing,
            self.request_type,
            None,
            self.priority,
            self.extra,
            self.body,
        )
    }
}

/// Builder for response envelopes; created by [`EnvelopeCodec::response_to`].
pub struct ResponseBuilder<'a> {
    codec: &'a EnvelopeCodec,
    exchange: String,
    routing_key: String,
    source: String,
    destination: String,
    body: Body,
    reply_correlation_id: Option<String>,
    response_type: Option<String>,
    gateway_routing: Option<String>,
    priority: PublishPriority,
    extra: BTreeMap<String, String>,
}

impl ResponseBuilder<'_> {
    /// Override the broker routing key (defaults to `*`).
    #[must_use]
    pub fn routing_key(mut self, key: impl Into<String>) -> Self {
        self.routing_key = key.into();
        self
    }

    /// Set the response discriminator.
    #[must_use]
    pub fn response_type(mut self, response_type: impl Into<String>) -> Self {
        self.response_type = Some(response_type.into());
        self
    }

    /// Set the routing-table key for the receiving gateway.
    #[must_use]
    pub fn gateway_routing(mut self, key: impl Into<String>) -> Self {
        self.gateway_routing = Some(key.into());
        self
    }

    /// Send this response ahead of queued normal-priority traffic.
    #[must_use]
    pub fn high_priority(mut self) -> Self {
        self.priority = PublishPriority::High;
        self
    }

    /// Attach a message-specific header.
    #[must_use]
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Assemble the envelope.
    ///
    /// Responses get their own fresh correlation id; the originating
    /// request's id travels in `reply_correlation_id`.
    ///
    /// # Errors
    ///
    /// Returns a [`ProtocolError`] when the exchange, source or destination
    /// is empty.
    pub fn build(self) -> Result<Envelope, ProtocolError> {
        self.codec.assemble(
            self.exchange,
            self.routing_key,
            self.source,
            self.destination,
            MessageType::Response,
            fresh_correlation_id(),
            self.reply_correlation_id,
            self.gateway_routing,
            None,
            self.response_type,
            self.priority,
            self.extra,
            self.body,
        )
    }
}
