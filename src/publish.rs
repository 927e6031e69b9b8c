//! Prioritized outbound queues feeding a connection's publish path.
//!
//! Publishes are accepted even while the link is down and drained once it
//! comes (back) up, high priority before normal, FIFO within each priority.
//! Producers interact through a cloneable [`PublishHandle`]; an optional rate
//! limiter keeps a chatty subsystem from saturating the link.

use std::sync::Arc;
use std::time::Duration;

use leaky_bucket::RateLimiter;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::envelope::Envelope;

/// Default depth of each publish queue.
pub(crate) const DEFAULT_QUEUE_DEPTH: usize = 64;
/// Highest supported publish rate, per second.
const MAX_PUBLISH_RATE: usize = 10_000;

/// Priority class for outbound messages.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PublishPriority {
    /// Sent before any queued normal-priority messages.
    High,
    /// Default class for application traffic.
    #[default]
    Normal,
}

/// Behaviour when a publish queue is full.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum PublishPolicy {
    /// Return an error to the caller if the queue is full.
    #[default]
    ReturnErrorIfFull,
    /// Silently drop the message.
    DropIfFull,
    /// Drop the message but emit a log warning.
    WarnAndDropIfFull,
}

/// Errors that can occur when enqueueing a message.
#[derive(Debug, PartialEq, Eq)]
pub enum PublishError {
    /// The queue was at capacity and the policy was `ReturnErrorIfFull`.
    QueueFull,
    /// The receiving end of the queue has been dropped.
    Closed,
}

impl std::fmt::Display for PublishError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::QueueFull => f.write_str("publish queue full"),
            Self::Closed => f.write_str("publish queue closed"),
        }
    }
}

impl std::error::Error for PublishError {}

struct PublishHandleInner {
    high_tx: mpsc::Sender<Envelope>,
    normal_tx: mpsc::Sender<Envelope>,
    limiter: Option<RateLimiter>,
    policy: PublishPolicy,
}

/// Cloneable handle used to enqueue finalized envelopes for delivery.
#[derive(Clone)]
pub(crate) struct PublishHandle(Arc<PublishHandleInner>);

impl PublishHandle {
    /// Enqueue an envelope under its own priority class.
    ///
    /// Waits on the rate limiter if one is configured. Full-queue behaviour
    /// follows the configured [`PublishPolicy`].
    pub(crate) async fn send(&self, envelope: Envelope) -> Result<(), PublishError> {
        if let Some(ref limiter) = self.0.limiter {
            limiter.acquire(1).await;
        }
        let priority = envelope.priority;
        let tx = match priority {
            PublishPriority::High => &self.0.high_tx,
            PublishPriority::Normal => &self.0.normal_tx,
        };
        match tx.try_send(envelope) {
            Ok(()) => {
                debug!(?priority, "envelope queued for publish");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(PublishError::Closed),
            Err(mpsc::error::TrySendError::Full(_)) => match self.0.policy {
                PublishPolicy::ReturnErrorIfFull => Err(PublishError::QueueFull),
                PublishPolicy::DropIfFull => Ok(()),
                PublishPolicy::WarnAndDropIfFull => {
                    warn!(?priority, "publish queue full, dropping envelope");
                    Ok(())
                }
            },
        }
    }
}

/// Receiving side of the publish queues, owned by the connection actor.
pub(crate) struct PublishQueues {
    high_rx: mpsc::Receiver<Envelope>,
    normal_rx: mpsc::Receiver<Envelope>,
}

impl PublishQueues {
    /// Create bounded queues with an optional messages-per-second rate limit.
    ///
    /// Rates outside `1..=MAX_PUBLISH_RATE` are clamped into range.
    pub(crate) fn bounded(
        depth: usize,
        rate: Option<usize>,
        policy: PublishPolicy,
    ) -> (Self, PublishHandle) {
        let (high_tx, high_rx) = mpsc::channel(depth.max(1));
        let (normal_tx, normal_rx) = mpsc::channel(depth.max(1));
        let limiter = rate.map(|r| {
            let r = r.clamp(1, MAX_PUBLISH_RATE);
            RateLimiter::builder()
                .initial(r)
                .max(r)
                .refill(r)
                .interval(Duration::from_secs(1))
                .build()
        });
        let handle = PublishHandle(Arc::new(PublishHandleInner {
            high_tx,
            normal_tx,
            limiter,
            policy,
        }));
        (Self { high_rx, normal_rx }, handle)
    }

    /// Receive the next queued envelope, high priority first.
    ///
    /// Returns `None` once every producer handle has been dropped and both
    /// queues are drained.
    pub(crate) async fn recv(&mut self) -> Option<(PublishPriority, Envelope)> {
        // Drain high-priority traffic opportunistically before blocking.
        if let Ok(envelope) = self.high_rx.try_recv() {
            return Some((PublishPriority::High, envelope));
        }
        tokio::select! {
            biased;

            high = self.high_rx.recv() => {
                if let Some(envelope) = high {
                    return Some((PublishPriority::High, envelope));
                }
                // High producers gone; fall through to normal traffic.
                self.normal_rx.recv().await.map(|e| (PublishPriority::Normal, e))
            }
            normal = self.normal_rx.recv() => {
                if let Some(envelope) = normal {
                    return Some((PublishPriority::Normal, envelope));
                }
                self.high_rx.recv().await.map(|e| (PublishPriority::High, e))
            }
        }
    }
}
