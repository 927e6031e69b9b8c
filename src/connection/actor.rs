//! The per-connection actor task.
//!
//! The actor polls a cancellation token, the command channel, link failure
//! events, the reconnect timer and the publish queues in a `tokio::select!`
//! loop. The `biased` keyword orders shutdown before commands and commands
//! before traffic. Because every mutation runs on this one task, topology
//! bookkeeping and the reconnect state machine never need a lock.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::BackoffPolicy;
use crate::config::ConnectionConfig;
use crate::envelope::Envelope;
use crate::error::{Error, Result, TransportError};
use crate::link::{Link, LinkConnector, LinkEvent};
use crate::metrics;
use crate::publish::PublishQueues;
use crate::topology::{Subscription, Topology, TopologyItem};

use super::{ConnectionEvent, ConnectionState};

/// Requests sent from a [`super::Connection`] handle to its actor.
pub(crate) enum Command {
    Connect,
    Disconnect,
    Declare {
        item: TopologyItem,
        persist: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    Subscribe {
        subscription: Subscription,
        persist: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    Unsubscribe {
        queue: String,
        reply: oneshot::Sender<Result<()>>,
    },
}

pub(crate) struct ConnectionActor {
    config: ConnectionConfig,
    connector: Arc<dyn LinkConnector>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    queues: PublishQueues,
    state_tx: watch::Sender<ConnectionState>,
    events_tx: broadcast::Sender<ConnectionEvent>,
    cancel: CancellationToken,

    topology: Topology,
    backoff: BackoffPolicy,
    link: Option<Box<dyn Link>>,
    link_events_rx: mpsc::Receiver<LinkEvent>,
    reconnect_at: Option<Instant>,
    no_reconnect: bool,
    publishes_closed: bool,
    // Critical-escalation bookkeeping for the initial connect sequence.
    established_once: bool,
    initial_attempts: u32,
    critical_fired: bool,
    connected_at: Option<Instant>,
    // One envelope slot for a publish that failed mid-send; flushed first
    // after the next successful connect.
    requeue: Option<Envelope>,
}

impl ConnectionActor {
    pub(crate) fn new(
        config: ConnectionConfig,
        connector: Arc<dyn LinkConnector>,
        cmd_rx: mpsc::UnboundedReceiver<Command>,
        queues: PublishQueues,
        state_tx: watch::Sender<ConnectionState>,
        events_tx: broadcast::Sender<ConnectionEvent>,
        cancel: CancellationToken,
    ) -> Self {
        let backoff = BackoffPolicy::new(config.backoff.clone());
        // Placeholder receiver; each established link gets a fresh channel
        // so stale failure events cannot outlive the link they belong to.
        let (_, link_events_rx) = mpsc::channel(1);
        Self {
            config,
            connector,
            cmd_rx,
            queues,
            state_tx,
            events_tx,
            cancel,
            topology: Topology::new(),
            backoff,
            link: None,
            link_events_rx,
            reconnect_at: None,
            no_reconnect: false,
            publishes_closed: false,
            established_once: false,
            initial_attempts: 0,
            critical_fired: false,
            connected_at: None,
            requeue: None,
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            let reconnect_at = self.reconnect_at;
            tokio::select! {
                biased;

                () = self.cancel.cancelled() => {
                    self.teardown().await;
                    break;
                }

                command = self.cmd_rx.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    // Every handle is gone; nothing can reach this link again.
                    None => {
                        self.teardown().await;
                        break;
                    }
                },

                event = self.link_events_rx.recv(), if self.link.is_some() => {
                    match event {
                        Some(LinkEvent::Lost(error)) => self.handle_link_loss(&error).await,
                        None => self.handle_link_loss(&TransportError::Closed).await,
                    }
                }

                () = async {
                    if let Some(at) = reconnect_at {
                        tokio::time::sleep_until(at).await;
                    }
                }, if reconnect_at.is_some() => {
                    self.reconnect_at = None;
                    metrics::inc_reconnects();
                    self.attempt_connect().await;
                }

                queued = self.queues.recv(), if self.link.is_some() && !self.publishes_closed => {
                    match queued {
                        Some((_, envelope)) => self.send_envelope(envelope).await,
                        None => self.publishes_closed = true,
                    }
                }
            }
        }
    }

    fn set_state(&self, state: ConnectionState) { let _ = self.state_tx.send_replace(state); }

    fn emit(&self, event: ConnectionEvent) { let _ = self.events_tx.send(event); }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect => {
                if self.link.is_some() || self.reconnect_at.is_some() {
                    debug!(
                        client_id = %self.config.client_id,
                        "already connecting or connected, connect ignored"
                    );
                    return;
                }
                self.no_reconnect = false;
                self.initial_attempts = 0;
                self.critical_fired = false;
                self.attempt_connect().await;
            }
            Command::Disconnect => self.handle_disconnect().await,
            Command::Declare {
                item,
                persist,
                reply,
            } => {
                let result = self.handle_declare(item, persist).await;
                let _ = reply.send(result);
            }
            Command::Subscribe {
                subscription,
                persist,
                reply,
            } => {
                let result = self.handle_subscribe(subscription, persist).await;
                let _ = reply.send(result);
            }
            Command::Unsubscribe { queue, reply } => {
                let result = self.handle_unsubscribe(&queue).await;
                let _ = reply.send(result);
            }
        }
    }

    async fn handle_disconnect(&mut self) {
        // The no-reconnect flag goes up before the link comes down, so a
        // deliberate disconnect is distinguishable from a dropped one.
        self.no_reconnect = true;
        self.reconnect_at = None;
        if let Some(mut link) = self.link.take() {
            link.close().await;
            if self.connected_at.take().is_some() {
                metrics::dec_connections();
            }
            self.emit(ConnectionEvent::Disconnected);
            info!(client_id = %self.config.client_id, "disconnected from broker");
        }
        self.set_state(ConnectionState::Idle);
    }

    async fn handle_declare(&mut self, item: TopologyItem, persist: bool) -> Result<()> {
        self.topology.register(item, persist).map_err(Error::Config)?;
        self.apply_if_connected().await
    }

    async fn handle_subscribe(&mut self, subscription: Subscription, persist: bool) -> Result<()> {
        self.topology
            .subscribe(subscription, persist)
            .map_err(Error::Config)?;
        self.apply_if_connected().await
    }

    async fn handle_unsubscribe(&mut self, queue: &str) -> Result<()> {
        if self.topology.unsubscribe(queue).is_none() {
            return Ok(());
        }
        if let Some(link) = self.link.as_mut()
            && let Err(error) = link.cancel(queue).await
        {
            self.handle_link_loss(&error).await;
            return Err(Error::Transport(error));
        }
        Ok(())
    }

    async fn apply_if_connected(&mut self) -> Result<()> {
        if self.link.is_none() {
            return Ok(());
        }
        if let Err(error) = self.apply_pending_topology().await {
            self.handle_link_loss(&error).await;
            return Err(Error::Transport(error));
        }
        Ok(())
    }

    async fn attempt_connect(&mut self) {
        self.set_state(ConnectionState::Connecting);
        if !self.established_once {
            self.initial_attempts += 1;
        }
        let (events_tx, events_rx) = mpsc::channel(8);
        match self.connector.connect(&self.config, events_tx).await {
            Ok(link) => {
                self.link = Some(link);
                self.link_events_rx = events_rx;
                if let Err(error) = self.apply_pending_topology().await {
                    warn!(
                        client_id = %self.config.client_id,
                        %error,
                        "topology replay failed after connect"
                    );
                    self.handle_link_loss(&error).await;
                    return;
                }
                if let Some(envelope) = self.requeue.take() {
                    self.send_envelope(envelope).await;
                    if self.link.is_none() {
                        return;
                    }
                }
                self.established_once = true;
                self.connected_at = Some(Instant::now());
                metrics::inc_connections();
                self.set_state(ConnectionState::Connected);
                self.emit(ConnectionEvent::Connected);
                info!(client_id = %self.config.client_id, "connected to broker");
            }
            Err(error) => {
                warn!(
                    client_id = %self.config.client_id,
                    %error,
                    "connection attempt failed"
                );
                self.handle_connect_failure();
            }
        }
    }

    fn handle_connect_failure(&mut self) {
        if self.no_reconnect {
            self.set_state(ConnectionState::Idle);
            return;
        }
        if self.config.critical
            && !self.established_once
            && self.initial_attempts >= self.config.initial_retry_budget
        {
            if !self.critical_fired {
                self.critical_fired = true;
                metrics::inc_critical_failures();
                error!(
                    client_id = %self.config.client_id,
                    attempts = self.initial_attempts,
                    "initial retry budget exhausted on critical connection"
                );
                self.emit(ConnectionEvent::CriticalFailure);
            }
            self.set_state(ConnectionState::Idle);
            return;
        }
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        let delay = self.backoff.next_delay();
        self.reconnect_at = Some(Instant::now() + delay);
        self.set_state(ConnectionState::Reconnecting);
        self.emit(ConnectionEvent::ReconnectScheduled { delay });
        debug!(
            client_id = %self.config.client_id,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "reconnect scheduled"
        );
    }

    /// Apply every pending declaration, then every pending subscription, in
    /// registration order.
    async fn apply_pending_topology(&mut self) -> std::result::Result<(), TransportError> {
        let Some(link) = self.link.as_mut() else {
            return Err(TransportError::NotConnected);
        };
        for (id, item) in self.topology.pending_declarations() {
            link.apply(&item).await?;
            self.topology.mark_declared(id);
        }
        for (id, subscription) in self.topology.pending_subscriptions() {
            link.consume(subscription).await?;
            self.topology.mark_subscribed(id);
        }
        Ok(())
    }

    async fn send_envelope(&mut self, envelope: Envelope) {
        let Some(link) = self.link.as_mut() else {
            self.requeue = Some(envelope);
            return;
        };
        if let Err(error) = link.publish(&envelope).await {
            warn!(
                client_id = %self.config.client_id,
                %error,
                "publish failed, keeping envelope for retry"
            );
            self.requeue = Some(envelope);
            self.handle_link_loss(&error).await;
        }
    }

    async fn handle_link_loss(&mut self, error: &TransportError) {
        let Some(mut link) = self.link.take() else {
            return;
        };
        link.close().await;
        warn!(client_id = %self.config.client_id, %error, "broker link lost");
        self.topology.reset_applied();
        if let Some(connected_at) = self.connected_at.take() {
            metrics::dec_connections();
            if connected_at.elapsed() >= self.backoff.stability_reset() {
                self.backoff.reset();
            }
        }
        self.emit(ConnectionEvent::Disconnected);
        if self.no_reconnect {
            self.set_state(ConnectionState::Idle);
        } else {
            self.schedule_reconnect();
        }
    }

    async fn teardown(&mut self) {
        self.reconnect_at = None;
        if let Some(mut link) = self.link.take() {
            link.close().await;
            if self.connected_at.take().is_some() {
                metrics::dec_connections();
            }
        }
        self.set_state(ConnectionState::Idle);
        debug!(client_id = %self.config.client_id, "connection actor stopped");
    }
}
