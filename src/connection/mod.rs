//! One persistent broker link and its lifecycle.
//!
//! A [`Connection`] is a cloneable handle to a per-link actor task that owns
//! the socket, the declared topology and the reconnect state machine. All
//! mutation is serialized through the actor, so topology, subscriptions and
//! reconnect state never race. The handle exposes the lifecycle
//! ([`connect`](Connection::connect) / [`disconnect`](Connection::disconnect)),
//! topology registration, subscriptions and the publish path.

mod actor;

#[cfg(test)]
pub(crate) mod test_support;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::config::ConnectionConfig;
use crate::envelope::{Envelope, epoch_now, is_no_reply};
use crate::error::{Error, ProtocolError, Result, TransportError};
use crate::link::LinkConnector;
use crate::publish::{PublishError, PublishHandle, PublishQueues};
use crate::topology::{
    BindingDeclaration,
    ExchangeDeclaration,
    QueueDeclaration,
    Subscription,
    TopologyItem,
};

use actor::{Command, ConnectionActor};

/// Lifecycle state of one broker link.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected and not trying to be.
    Idle,
    /// A connection attempt is in flight.
    Connecting,
    /// The link is established and topology has been replayed.
    Connected,
    /// The link dropped; a reconnect attempt is scheduled.
    Reconnecting,
}

/// Notifications emitted as a link changes state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The link came up and topology was replayed.
    Connected,
    /// The link went down, deliberately or not.
    Disconnected,
    /// A reconnect attempt was scheduled after `delay`.
    ReconnectScheduled {
        /// Backoff delay before the next attempt.
        delay: Duration,
    },
    /// A critical connection exhausted its initial retry budget.
    ///
    /// Emitted at most once per connect sequence; the process owner decides
    /// how to shut down.
    CriticalFailure,
}

/// Delivery metadata returned by [`Connection::publish`].
///
/// Recorded at enqueue time and consumed by the correlation tracker.
#[derive(Clone, Debug)]
pub struct PublishReceipt {
    /// Correlation id carried by the published envelope.
    pub correlation_id: String,
    /// Whether the envelope expects a correlated reply.
    pub reply_expected: bool,
    /// Monotonic instant the envelope entered the publish queue.
    pub queued_at: Instant,
    /// Wall-clock enqueue time, seconds since the Unix epoch.
    pub queued_at_epoch: f64,
}

struct Shared {
    config: ConnectionConfig,
    cmd_tx: mpsc::UnboundedSender<Command>,
    publish: PublishHandle,
    state_rx: watch::Receiver<ConnectionState>,
    events_tx: broadcast::Sender<ConnectionEvent>,
    cancel: CancellationToken,
}

/// Cloneable handle to one broker link.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Shared>,
}

impl Connection {
    pub(crate) fn spawn(config: ConnectionConfig, connector: Arc<dyn LinkConnector>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (queues, publish) = PublishQueues::bounded(
            config.publish_queue_depth,
            config.publish_rate,
            config.publish_policy,
        );
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let (events_tx, _) = broadcast::channel(32);
        let cancel = CancellationToken::new();

        let actor = ConnectionActor::new(
            config.clone(),
            connector,
            cmd_rx,
            queues,
            state_tx,
            events_tx.clone(),
            cancel.clone(),
        );
        tokio::spawn(actor.run());

        Self {
            inner: Arc::new(Shared {
                config,
                cmd_tx,
                publish,
                state_rx,
                events_tx,
                cancel,
            }),
        }
    }

    /// The immutable parameters this link was created with.
    #[must_use]
    pub fn config(&self) -> &ConnectionConfig { &self.inner.config }

    /// This link's client identity.
    #[must_use]
    pub fn client_id(&self) -> &str { &self.inner.config.client_id }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState { *self.inner.state_rx.borrow() }

    /// Whether the link is currently established.
    #[must_use]
    pub fn is_connected(&self) -> bool { self.state() == ConnectionState::Connected }

    /// Watch lifecycle state changes.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> { self.inner.state_rx.clone() }

    /// Subscribe to lifecycle events.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> { self.inner.events_tx.subscribe() }

    fn send_command(&self, command: Command) -> Result<()> {
        self.inner
            .cmd_tx
            .send(command)
            .map_err(|_| Error::Transport(TransportError::Closed))
    }

    /// Begin connecting.
    ///
    /// Idempotent: a call while already connecting, connected or waiting on
    /// a reconnect timer is a no-op. Connection failures are not raised
    /// here; they drive the reconnect state machine and are observable
    /// through [`events`](Self::events).
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] if the connection actor has shut
    /// down.
    pub fn connect(&self) -> Result<()> { self.send_command(Command::Connect) }

    /// Disconnect deliberately and stay down.
    ///
    /// Idempotent. Cancels any in-flight reconnect timer before closing the
    /// link, so a deliberate disconnect is never followed by an automatic
    /// reconnect.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] if the connection actor has shut
    /// down.
    pub fn disconnect(&self) -> Result<()> { self.send_command(Command::Disconnect) }

    async fn declare(&self, item: TopologyItem, persist: bool) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send_command(Command::Declare {
            item,
            persist,
            reply,
        })?;
        rx.await
            .map_err(|_| Error::Transport(TransportError::Closed))?
    }

    /// Register an exchange; applied immediately when connected.
    ///
    /// With `persist` set the declaration is replayed after every
    /// reconnect.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::ConfigError::DuplicateTopology`] when an
    /// exchange of the same name is already registered, or a transport error
    /// when immediate application fails.
    pub async fn declare_exchange(&self, declaration: ExchangeDeclaration, persist: bool) -> Result<()> {
        self.declare(TopologyItem::Exchange(declaration), persist).await
    }

    /// Register a queue; applied immediately when connected.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`declare_exchange`](Self::declare_exchange).
    pub async fn declare_queue(&self, declaration: QueueDeclaration, persist: bool) -> Result<()> {
        self.declare(TopologyItem::Queue(declaration), persist).await
    }

    /// Bind a queue to an exchange; applied immediately when connected.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`declare_exchange`](Self::declare_exchange).
    pub async fn declare_binding(&self, declaration: BindingDeclaration, persist: bool) -> Result<()> {
        self.declare(TopologyItem::Binding(declaration), persist).await
    }

    /// Register a consumer on a queue.
    ///
    /// With `persist` set the consumer is resumed after every reconnect.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::ConfigError::DuplicateTopology`] when the
    /// queue already has a consumer, or a transport error when immediate
    /// activation fails.
    pub async fn subscribe(&self, subscription: Subscription, persist: bool) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send_command(Command::Subscribe {
            subscription,
            persist,
            reply,
        })?;
        rx.await
            .map_err(|_| Error::Transport(TransportError::Closed))?
    }

    /// Drop the consumer on a queue.
    ///
    /// # Errors
    ///
    /// Returns a transport error when the broker-side cancel fails.
    pub async fn unsubscribe(&self, queue: impl Into<String>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send_command(Command::Unsubscribe {
            queue: queue.into(),
            reply,
        })?;
        rx.await
            .map_err(|_| Error::Transport(TransportError::Closed))?
    }

    /// Enqueue a finalized envelope for delivery.
    ///
    /// Envelopes are accepted while the link is down and flushed once it
    /// comes up; within a priority class they are sent in call order. The
    /// returned receipt is recorded before any network I/O happens.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::NotFinalized`] when the envelope has no wire
    /// payload, [`ProtocolError::MissingExchange`] when it has nowhere to
    /// go, or a transport error when the publish queue rejects it.
    pub async fn publish(&self, envelope: Envelope) -> Result<PublishReceipt> {
        if envelope.finalized().is_none() {
            return Err(Error::Protocol(ProtocolError::NotFinalized));
        }
        if envelope.exchange.is_empty() {
            return Err(Error::Protocol(ProtocolError::MissingExchange));
        }
        let receipt = PublishReceipt {
            correlation_id: envelope.headers.correlation_id.clone(),
            reply_expected: !is_no_reply(&envelope.headers.correlation_id),
            queued_at: Instant::now(),
            queued_at_epoch: epoch_now(),
        };
        self.inner.publish.send(envelope).await.map_err(|error| {
            Error::Transport(match error {
                PublishError::QueueFull => TransportError::QueueFull,
                PublishError::Closed => TransportError::Closed,
            })
        })?;
        Ok(receipt)
    }

    /// Stop the actor outright, cancelling any reconnect timer.
    pub(crate) fn shutdown(&self) { self.inner.cancel.cancel(); }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("client_id", &self.inner.config.client_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
