//! Dispatching validated inbound messages.
//!
//! A message that resolves a tracked correlation goes straight to the
//! callback recorded at send time. Everything else is matched against the
//! routing table by its `gateway_routing` header; registered handlers run in
//! registration order. A message matching neither is dropped with an
//! observability signal, never an error: unroutable traffic must not take
//! the connection down.

use std::sync::Arc;

use dashmap::DashMap;
use futures::future::BoxFuture;
use tracing::{debug, warn};

use crate::codec::ReceiptMeta;
use crate::correlation::CorrelationEntry;
use crate::envelope::Envelope;
use crate::error::Result;
use crate::metrics;

/// Callback invoked with a parsed envelope and its receipt metadata.
pub type Handler = Arc<dyn Fn(Envelope, ReceiptMeta) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Where a routed message ended up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Delivered to the callback registered with the correlation tracker.
    Correlated,
    /// Delivered to this many routing-table handlers.
    Routed(usize),
    /// No correlation callback and no table entry; the message was dropped.
    Dropped,
}

/// Table of named routes populated by subsystems during startup.
#[derive(Default)]
pub struct Router {
    routes: DashMap<String, Vec<Handler>>,
}

impl Router {
    /// Create an empty router.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Append a handler to the ordered list for `key`.
    pub fn register_route(&self, key: impl Into<String>, handler: Handler) {
        self.routes.entry(key.into()).or_default().push(handler);
    }

    /// Number of handlers registered for `key`.
    #[must_use]
    pub fn handler_count(&self, key: &str) -> usize {
        self.routes.get(key).map_or(0, |handlers| handlers.len())
    }

    /// Dispatch one validated message.
    ///
    /// The correlation callback, when present, takes priority over
    /// table-based routing. Table handlers are invoked sequentially in
    /// registration order; the first failure stops the chain and propagates
    /// so the delivery can be negatively acknowledged.
    ///
    /// # Errors
    ///
    /// Returns the first handler error encountered.
    pub async fn route(
        &self,
        envelope: Envelope,
        correlation: Option<CorrelationEntry>,
        receipt: ReceiptMeta,
    ) -> Result<RouteOutcome> {
        if let Some(entry) = correlation
            && let Some(callback) = entry.callback
        {
            debug!(
                correlation_id = %entry.correlation_id,
                "delivering correlated response to its callback"
            );
            callback(envelope, receipt).await?;
            return Ok(RouteOutcome::Correlated);
        }

        let Some(key) = envelope.headers.gateway_routing.clone() else {
            self.drop_unroutable(&envelope, "no gateway_routing header");
            return Ok(RouteOutcome::Dropped);
        };
        // Clone the handler list out so the table is not locked across
        // handler awaits.
        let Some(handlers) = self.routes.get(&key).map(|h| h.value().clone()) else {
            self.drop_unroutable(&envelope, "no registered route");
            return Ok(RouteOutcome::Dropped);
        };
        let count = handlers.len();
        for handler in handlers {
            handler(envelope.clone(), receipt.clone()).await?;
        }
        Ok(RouteOutcome::Routed(count))
    }

    fn drop_unroutable(&self, envelope: &Envelope, reason: &str) {
        metrics::inc_unroutable();
        warn!(
            source = %envelope.headers.source,
            correlation_id = %envelope.headers.correlation_id,
            reason,
            "dropping unroutable message"
        );
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("routes", &self.routes.len())
            .finish_non_exhaustive()
    }
}
