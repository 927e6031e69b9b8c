//! Low-level broker channel operations.
//!
//! The connection actor drives the broker through the [`Link`] trait so its
//! state machine can be exercised without a broker; [`AmqpConnector`] is the
//! production implementation on top of the `lapin` AMQP client. One channel
//! per connection carries every declaration, consumer and publish.

use std::collections::HashMap;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions,
    BasicCancelOptions,
    BasicConsumeOptions,
    BasicNackOptions,
    BasicPublishOptions,
    BasicQosOptions,
    ExchangeDeclareOptions,
    QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldArray, FieldTable};
use lapin::{BasicProperties, Channel, ConnectionProperties};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::ConnectionConfig;
use crate::envelope::{
    DeliveryProps,
    Envelope,
    HDR_BODY_SIGNATURE,
    HDR_ROUTE,
    HDR_SENT_AT,
    HDR_VERSION,
    InboundDelivery,
    TransportHeaderValues,
    epoch_now,
};
use crate::error::TransportError;
use crate::metrics;
use crate::topology::{ExchangeKind, Subscription, TopologyItem};

/// Out-of-band notifications from a live link to its connection actor.
#[derive(Debug)]
pub(crate) enum LinkEvent {
    /// The link dropped unexpectedly.
    Lost(TransportError),
}

/// One established broker channel.
#[async_trait]
pub(crate) trait Link: Send {
    /// Apply a topology declaration.
    async fn apply(&mut self, item: &TopologyItem) -> Result<(), TransportError>;

    /// Start consuming a queue, invoking the subscription's handlers for
    /// every delivery.
    async fn consume(&mut self, subscription: Subscription) -> Result<(), TransportError>;

    /// Stop consuming a queue.
    async fn cancel(&mut self, queue: &str) -> Result<(), TransportError>;

    /// Publish a finalized envelope.
    async fn publish(&mut self, envelope: &Envelope) -> Result<(), TransportError>;

    /// Tear the channel down; never fails.
    async fn close(&mut self);
}

/// Establishes new [`Link`]s for a connection actor.
#[async_trait]
pub(crate) trait LinkConnector: Send + Sync {
    /// Open a socket, negotiate the broker handshake and return a ready
    /// channel.
    async fn connect(
        &self,
        config: &ConnectionConfig,
        events: mpsc::Sender<LinkEvent>,
    ) -> Result<Box<dyn Link>, TransportError>;
}

/// Production connector speaking AMQP 0.9.1 over TCP or TLS.
pub(crate) struct AmqpConnector;

fn broker_uri(config: &ConnectionConfig) -> String {
    let scheme = if config.use_tls { "amqps" } else { "amqp" };
    let auth = config
        .credentials
        .as_ref()
        .map(|c| format!("{}:{}@", c.username, c.password))
        .unwrap_or_default();
    format!(
        "{scheme}://{auth}{}:{}/{}?heartbeat={}",
        config.host, config.port, config.virtual_host, config.heartbeat
    )
}

#[async_trait]
impl LinkConnector for AmqpConnector {
    async fn connect(
        &self,
        config: &ConnectionConfig,
        events: mpsc::Sender<LinkEvent>,
    ) -> Result<Box<dyn Link>, TransportError> {
        let uri = broker_uri(config);
        let connection =
            lapin::Connection::connect(&uri, ConnectionProperties::default()).await?;
        let error_events = events.clone();
        connection.on_error(move |error| {
            let _ = error_events.try_send(LinkEvent::Lost(error.into()));
        });
        let channel = connection.create_channel().await?;
        channel
            .basic_qos(config.prefetch_count, BasicQosOptions::default())
            .await?;
        debug!(client_id = %config.client_id, "broker channel ready");
        Ok(Box::new(AmqpLink {
            _connection: connection,
            channel,
            client_id: config.client_id.clone(),
            username: config.username().map(ToOwned::to_owned),
            consumers: HashMap::new(),
            events,
        }))
    }
}

struct ConsumerState {
    tag: String,
    task: JoinHandle<()>,
}

struct AmqpLink {
    _connection: lapin::Connection,
    channel: Channel,
    client_id: String,
    username: Option<String>,
    consumers: HashMap<String, ConsumerState>,
    events: mpsc::Sender<LinkEvent>,
}

impl AmqpLink {
    fn properties(&self, envelope: &Envelope, content_type: &str) -> BasicProperties {
        let mut headers = FieldTable::default();
        headers.insert(
            HDR_VERSION.into(),
            AMQPValue::LongInt(i32::try_from(envelope.transport.version).unwrap_or(i32::MAX)),
        );
        let route: Vec<AMQPValue> = envelope
            .transport
            .route
            .iter()
            .map(|hop| AMQPValue::LongString(hop.as_str().into()))
            .collect();
        headers.insert(HDR_ROUTE.into(), AMQPValue::FieldArray(FieldArray::from(route)));
        headers.insert(
            HDR_BODY_SIGNATURE.into(),
            AMQPValue::LongString(envelope.transport.body_signature.as_str().into()),
        );
        headers.insert(HDR_SENT_AT.into(), AMQPValue::Double(epoch_now()));

        let mut properties = BasicProperties::default()
            .with_content_type(content_type.into())
            .with_correlation_id(envelope.headers.correlation_id.as_str().into())
            .with_headers(headers);
        if let Some(username) = &self.username {
            properties = properties.with_user_id(username.as_str().into());
        }
        properties
    }
}

#[async_trait]
impl Link for AmqpLink {
    async fn apply(&mut self, item: &TopologyItem) -> Result<(), TransportError> {
        match item {
            TopologyItem::Exchange(decl) => {
                let kind = match decl.kind {
                    ExchangeKind::Direct => lapin::ExchangeKind::Direct,
                    ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
                    ExchangeKind::Topic => lapin::ExchangeKind::Topic,
                    ExchangeKind::Headers => lapin::ExchangeKind::Headers,
                };
                self.channel
                    .exchange_declare(
                        &decl.name,
                        kind,
                        ExchangeDeclareOptions {
                            durable: decl.durable,
                            auto_delete: decl.auto_delete,
                            ..ExchangeDeclareOptions::default()
                        },
                        FieldTable::default(),
                    )
                    .await?;
            }
            TopologyItem::Queue(decl) => {
                let mut arguments = FieldTable::default();
                for (key, value) in &decl.arguments {
                    arguments.insert(
                        key.as_str().into(),
                        AMQPValue::LongString(value.as_str().into()),
                    );
                }
                self.channel
                    .queue_declare(
                        &decl.name,
                        QueueDeclareOptions {
                            durable: decl.durable,
                            ..QueueDeclareOptions::default()
                        },
                        arguments,
                    )
                    .await?;
            }
            TopologyItem::Binding(decl) => {
                self.channel
                    .queue_bind(
                        &decl.queue,
                        &decl.exchange,
                        &decl.routing_key,
                        QueueBindOptions::default(),
                        FieldTable::default(),
                    )
                    .await?;
            }
        }
        debug!(client_id = %self.client_id, item = ?item, "topology element applied");
        Ok(())
    }

    async fn consume(&mut self, subscription: Subscription) -> Result<(), TransportError> {
        let tag = format!("{}.{}", self.client_id, subscription.queue);
        let mut consumer = self
            .channel
            .basic_consume(
                &subscription.queue,
                &tag,
                BasicConsumeOptions {
                    no_ack: subscription.auto_ack,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await?;

        let events = self.events.clone();
        let queue = subscription.queue.clone();
        let task = tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                match delivery {
                    Ok(mut delivery) => {
                        metrics::inc_messages(metrics::Direction::Inbound);
                        let inbound = InboundDelivery {
                            routing_key: delivery.routing_key.as_str().to_owned(),
                            props: delivery_props(&delivery.properties),
                            body: std::mem::take(&mut delivery.data),
                        };
                        let result = (subscription.on_message)(inbound).await;
                        if !subscription.auto_ack {
                            let acked = match &result {
                                Ok(()) => delivery.ack(BasicAckOptions::default()).await,
                                Err(_) => {
                                    delivery
                                        .nack(BasicNackOptions {
                                            requeue: false,
                                            ..BasicNackOptions::default()
                                        })
                                        .await
                                }
                            };
                            if let Err(error) = acked {
                                warn!(queue = %queue, %error, "failed to settle delivery");
                            }
                        }
                        if let Err(error) = result {
                            warn!(queue = %queue, %error, "delivery handler failed");
                            if let Some(on_error) = &subscription.on_error {
                                on_error(&error).await;
                            }
                        }
                    }
                    Err(error) => {
                        let _ = events.try_send(LinkEvent::Lost(error.into()));
                        break;
                    }
                }
            }
        });
        self.consumers
            .insert(subscription.queue.clone(), ConsumerState { tag, task });
        Ok(())
    }

    async fn cancel(&mut self, queue: &str) -> Result<(), TransportError> {
        if let Some(state) = self.consumers.remove(queue) {
            self.channel
                .basic_cancel(&state.tag, BasicCancelOptions::default())
                .await?;
            state.task.abort();
        }
        Ok(())
    }

    async fn publish(&mut self, envelope: &Envelope) -> Result<(), TransportError> {
        let Some(finalized) = envelope.finalized() else {
            // The publish path finalizes before enqueueing; nothing sane can
            // be sent without a wire payload.
            warn!(client_id = %self.client_id, "dropping unfinalized envelope");
            return Ok(());
        };
        let properties = self.properties(envelope, finalized.content_type.as_str());
        self.channel
            .basic_publish(
                &envelope.exchange,
                &envelope.routing_key,
                BasicPublishOptions::default(),
                &finalized.payload,
                properties,
            )
            .await?;
        metrics::inc_messages(metrics::Direction::Outbound);
        Ok(())
    }

    async fn close(&mut self) {
        for (_, state) in self.consumers.drain() {
            state.task.abort();
        }
        if let Err(error) = self.channel.close(200, "closing").await {
            debug!(client_id = %self.client_id, %error, "channel close failed");
        }
    }
}

/// Extract the transport properties of one broker delivery.
fn delivery_props(properties: &BasicProperties) -> DeliveryProps {
    let mut values = TransportHeaderValues::default();
    if let Some(table) = properties.headers().as_ref() {
        for (key, value) in table.inner() {
            match key.as_str() {
                HDR_VERSION => values.version = amqp_i64(value),
                HDR_ROUTE => values.route = amqp_string_list(value),
                HDR_BODY_SIGNATURE => values.body_signature = amqp_string(value),
                HDR_SENT_AT => values.sent_at = amqp_f64(value),
                _ => {}
            }
        }
    }
    DeliveryProps {
        content_type: properties
            .content_type()
            .as_ref()
            .map(|s| s.as_str().to_owned()),
        correlation_id: properties
            .correlation_id()
            .as_ref()
            .map(|s| s.as_str().to_owned()),
        headers: values,
    }
}

fn amqp_i64(value: &AMQPValue) -> Option<i64> {
    match value {
        AMQPValue::ShortShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortShortUInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortUInt(v) => Some(i64::from(*v)),
        AMQPValue::LongInt(v) => Some(i64::from(*v)),
        AMQPValue::LongUInt(v) => Some(i64::from(*v)),
        AMQPValue::LongLongInt(v) => Some(*v),
        _ => None,
    }
}

fn amqp_f64(value: &AMQPValue) -> Option<f64> {
    match value {
        AMQPValue::Double(v) => Some(*v),
        AMQPValue::Float(v) => Some(f64::from(*v)),
        // Some senders stamp timestamps as stringified floats.
        AMQPValue::LongString(v) => String::from_utf8_lossy(v.as_bytes()).parse().ok(),
        #[expect(clippy::cast_precision_loss, reason = "timestamps fit f64 comfortably")]
        other => amqp_i64(other).map(|v| v as f64),
    }
}

fn amqp_string(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(v) => Some(String::from_utf8_lossy(v.as_bytes()).into_owned()),
        _ => None,
    }
}

fn amqp_string_list(value: &AMQPValue) -> Option<Vec<String>> {
    match value {
        AMQPValue::FieldArray(values) => {
            Some(values.as_slice().iter().filter_map(amqp_string).collect())
        }
        _ => None,
    }
}
