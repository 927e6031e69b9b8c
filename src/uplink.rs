//! The protocol-layer instance tying one connection to the envelope
//! machinery.
//!
//! An [`Uplink`] owns the codec, correlation tracker and router for one
//! broker link, subscribes the dedicated per-identity response queue and
//! runs the inbound pipeline: parse and validate, resolve the correlation,
//! dispatch. Outbound it offers the `publish_request` / `publish_response`
//! wrappers that every other subsystem builds on, and it announces the
//! gateway's presence whenever the link comes up.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::codec::{EnvelopeCodec, ReceiptMeta};
use crate::config::ConnectionConfig;
use crate::connection::{Connection, ConnectionEvent, PublishReceipt};
use crate::correlation::{CorrelationEntry, CorrelationTracker, DEFAULT_TRACKED_REPLIES};
use crate::envelope::{Body, Envelope, InboundDelivery, MessageType};
use crate::error::{Error, ProtocolError, Result};
use crate::metrics;
use crate::registry::ConnectionRegistry;
use crate::router::{Handler, Router};
use crate::topology::{DeliveryHandler, Subscription};

/// Default prefix of the dedicated per-identity response queue.
pub const RESPONSE_QUEUE_PREFIX: &str = "ygw.q.";

/// Configuration of one protocol-layer instance.
#[derive(Clone, Debug)]
pub struct UplinkConfig {
    /// Parameters of the underlying broker connection.
    pub connection: ConnectionConfig,
    /// Prefix of the dedicated response queue; the client identity is
    /// appended.
    pub response_queue_prefix: String,
    /// Exchange for system traffic (presence, disconnect notices).
    pub system_exchange: String,
    /// Destination component for system traffic.
    pub system_destination: String,
    /// Source component stamped on messages this instance originates.
    pub source_component: String,
    /// Key/value pairs announced as this gateway's presence.
    pub presence: BTreeMap<String, String>,
    /// Base interval between presence re-announcements; each period is
    /// randomized around this value.
    pub announce_interval: Duration,
    /// Capacity of the correlation tracker.
    pub tracked_replies: usize,
}

impl UplinkConfig {
    /// Create a config with defaults for everything but the connection.
    #[must_use]
    pub fn new(connection: ConnectionConfig) -> Self {
        Self {
            connection,
            response_queue_prefix: RESPONSE_QUEUE_PREFIX.to_owned(),
            system_exchange: "ysrv.e.gw_system".to_owned(),
            system_destination: "yombo.server.gw_system".to_owned(),
            source_component: "gateway.uplink".to_owned(),
            presence: BTreeMap::new(),
            announce_interval: Duration::from_secs(4 * 60 * 60),
            tracked_replies: DEFAULT_TRACKED_REPLIES,
        }
    }

    /// Replace the presence key/value map.
    #[must_use]
    pub fn presence(mut self, presence: BTreeMap<String, String>) -> Self {
        self.presence = presence;
        self
    }

    /// Override the correlation tracker capacity.
    #[must_use]
    pub fn tracked_replies(mut self, capacity: usize) -> Self {
        self.tracked_replies = capacity;
        self
    }
}

struct UplinkInner {
    connection: Connection,
    codec: EnvelopeCodec,
    tracker: CorrelationTracker,
    router: Router,
    config: UplinkConfig,
    cancel: CancellationToken,
}

/// One gateway's messaging client on its broker link.
#[derive(Clone)]
pub struct Uplink {
    inner: Arc<UplinkInner>,
}

impl Uplink {
    /// Create the instance and register its connection.
    ///
    /// Nothing connects yet; call [`start`](Self::start).
    ///
    /// # Errors
    ///
    /// Returns a [`crate::error::ConfigError`] when the connection config is
    /// invalid or its identity already registered.
    pub fn new(registry: &ConnectionRegistry, config: UplinkConfig) -> Result<Self> {
        let connection = registry.create(config.connection.clone())?;
        let codec = EnvelopeCodec::new(connection.client_id());
        Ok(Self {
            inner: Arc::new(UplinkInner {
                connection,
                codec,
                tracker: CorrelationTracker::new(config.tracked_replies),
                router: Router::new(),
                config,
                cancel: CancellationToken::new(),
            }),
        })
    }

    /// The underlying connection handle.
    #[must_use]
    pub fn connection(&self) -> &Connection { &self.inner.connection }

    /// The codec used to build and parse this link's envelopes.
    #[must_use]
    pub fn codec(&self) -> &EnvelopeCodec { &self.inner.codec }

    /// The correlation tracker shared across this instance.
    #[must_use]
    pub fn tracker(&self) -> &CorrelationTracker { &self.inner.tracker }

    /// Append a handler to the routing table under `key`.
    ///
    /// Used by subsystems at startup to receive inbound requests addressed
    /// to them.
    pub fn register_route(&self, key: impl Into<String>, handler: Handler) {
        self.inner.router.register_route(key, handler);
    }

    /// Subscribe the response queue, begin connecting and start the
    /// presence loop.
    ///
    /// # Errors
    ///
    /// Returns an error when the subscription cannot be registered or the
    /// connection actor is gone.
    pub async fn start(&self) -> Result<()> {
        let queue = format!(
            "{}{}",
            self.inner.config.response_queue_prefix,
            self.inner.codec.identity()
        );
        let subscription = Subscription {
            queue,
            auto_ack: false,
            on_message: self.dispatcher(),
            on_error: None,
        };
        self.inner.connection.subscribe(subscription, true).await?;
        // Subscribe to lifecycle events before connecting so the first
        // Connected notification cannot be missed.
        let events = self.inner.connection.events();
        self.inner.connection.connect()?;
        tokio::spawn(self.clone().run_presence(events));
        Ok(())
    }

    /// Finalize and publish a request, tracking the reply when one is
    /// expected.
    ///
    /// `on_reply` is invoked with the correlated response if it arrives
    /// while the correlation is still tracked; callers that do not care
    /// simply pass `None`.
    ///
    /// # Errors
    ///
    /// Returns a [`ProtocolError`] when finalization or publish-time
    /// validation fails, or a transport error when the publish queue
    /// rejects the envelope.
    pub async fn publish_request(
        &self,
        mut envelope: Envelope,
        on_reply: Option<Handler>,
    ) -> Result<PublishReceipt> {
        self.inner.codec.finalize(&mut envelope)?;
        let destination = envelope.headers.destination.clone();
        let receipt = self.inner.connection.publish(envelope).await?;
        if receipt.reply_expected {
            self.inner.tracker.expect_reply(CorrelationEntry::new(
                receipt.correlation_id.clone(),
                destination,
                on_reply,
            ));
        }
        Ok(receipt)
    }

    /// Finalize and publish a response.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`publish_request`](Self::publish_request).
    pub async fn publish_response(&self, mut envelope: Envelope) -> Result<PublishReceipt> {
        self.inner.codec.finalize(&mut envelope)?;
        self.inner.connection.publish(envelope).await
    }

    /// Publish a request and await its reply through a channel.
    ///
    /// The returned [`ReplyReceiver`] resolves with the correlated response;
    /// dropping it simply ignores the reply.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`publish_request`](Self::publish_request).
    pub async fn request_reply(&self, envelope: Envelope) -> Result<ReplyReceiver> {
        let (tx, rx) = oneshot::channel();
        let slot = Arc::new(Mutex::new(Some(tx)));
        let handler: Handler = Arc::new(move |envelope, receipt| {
            let slot = Arc::clone(&slot);
            Box::pin(async move {
                if let Some(tx) = slot.lock().expect("reply slot").take() {
                    let _ = tx.send((envelope, receipt));
                }
                Ok(())
            })
        });
        let receipt = self.publish_request(envelope, Some(handler)).await?;
        Ok(ReplyReceiver { receipt, rx })
    }

    /// Announce this gateway's presence to the broker side.
    ///
    /// Sent automatically on every connect and periodically afterwards;
    /// also callable when local details change.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`publish_request`](Self::publish_request).
    pub async fn announce(&self) -> Result<PublishReceipt> {
        let body = bincode::serde::encode_to_vec(
            &self.inner.config.presence,
            bincode::config::standard(),
        )
        .map_err(ProtocolError::Encode)?;
        let envelope = self
            .inner
            .codec
            .request(
                &self.inner.config.system_exchange,
                &self.inner.config.source_component,
                &self.inner.config.system_destination,
                Body::Object(body),
            )
            .request_type("connected")
            .high_priority()
            .build()?;
        self.publish_request(envelope, None).await
    }

    /// Send a disconnect notice, then take the link down for good.
    ///
    /// The notice is best-effort; the link closes shortly after regardless.
    pub async fn shutdown(&self) {
        if self.inner.connection.is_connected() {
            match self
                .inner
                .codec
                .request(
                    &self.inner.config.system_exchange,
                    &self.inner.config.source_component,
                    &self.inner.config.system_destination,
                    Body::empty(),
                )
                .request_type("disconnect")
                .no_reply()
                .high_priority()
                .build()
            {
                Ok(notice) => {
                    if let Err(error) = self.publish_request(notice, None).await {
                        warn!(%error, "disconnect notice not sent");
                    } else {
                        // Give the actor a moment to flush the notice.
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                }
                Err(error) => warn!(%error, "disconnect notice not built"),
            }
        }
        self.inner.cancel.cancel();
        if let Err(error) = self.inner.connection.disconnect() {
            debug!(%error, "connection already gone at shutdown");
        }
    }

    fn dispatcher(&self) -> DeliveryHandler {
        let this = self.clone();
        Arc::new(move |delivery: InboundDelivery| {
            let this = this.clone();
            Box::pin(async move { this.dispatch(delivery).await })
        })
    }

    async fn dispatch(&self, delivery: InboundDelivery) -> Result<()> {
        let (envelope, mut receipt) = self.inner.codec.parse_inbound(&delivery)?;
        match envelope.headers.message_type {
            MessageType::Request if envelope.headers.request_type.is_none() => {
                return Err(Error::Protocol(ProtocolError::MissingRequestType));
            }
            MessageType::Response if envelope.headers.response_type.is_none() => {
                return Err(Error::Protocol(ProtocolError::MissingResponseType));
            }
            _ => {}
        }
        let correlation = envelope
            .headers
            .reply_correlation_id
            .as_deref()
            .and_then(|id| self.inner.tracker.resolve(id));
        if let Some(entry) = &correlation {
            let round_trip = entry.round_trip(receipt.received_at);
            receipt.round_trip = Some(round_trip);
            metrics::observe_round_trip(round_trip.as_secs_f64());
            debug!(
                correlation_id = %entry.correlation_id,
                round_trip_ms = u64::try_from(round_trip.as_millis()).unwrap_or(u64::MAX),
                "response matched a tracked request"
            );
        }
        self.inner.router.route(envelope, correlation, receipt).await?;
        Ok(())
    }

    async fn run_presence(self, mut events: broadcast::Receiver<ConnectionEvent>) {
        loop {
            let period = self
                .inner
                .config
                .announce_interval
                .mul_f64(rand::thread_rng().gen_range(0.8..1.2));
            tokio::select! {
                () = self.inner.cancel.cancelled() => break,

                event = events.recv() => match event {
                    Ok(ConnectionEvent::Connected) => {
                        if let Err(error) = self.announce().await {
                            warn!(%error, "presence announcement failed");
                        }
                    }
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                },

                () = tokio::time::sleep(period) => {
                    if self.inner.connection.is_connected()
                        && let Err(error) = self.announce().await
                    {
                        warn!(%error, "periodic presence announcement failed");
                    }
                }
            }
        }
        debug!("presence loop stopped");
    }
}

impl std::fmt::Debug for Uplink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Uplink")
            .field("client_id", &self.inner.codec.identity())
            .finish_non_exhaustive()
    }
}

/// Pending reply to a request published with [`Uplink::request_reply`].
pub struct ReplyReceiver {
    /// Delivery metadata of the published request.
    pub receipt: PublishReceipt,
    rx: oneshot::Receiver<(Envelope, ReceiptMeta)>,
}

impl ReplyReceiver {
    /// Await the correlated response.
    ///
    /// Resolves to `None` when the correlation was evicted or the link shut
    /// down before a reply arrived.
    pub async fn reply(self) -> Option<(Envelope, ReceiptMeta)> { self.rx.await.ok() }
}
