//! Pairing responses to the requests that caused them.
//!
//! The tracker is a fixed-capacity, insertion-ordered map from correlation
//! id to the metadata recorded when the request was sent. When the map is
//! full the oldest entry is evicted, which bounds memory under sustained
//! one-way traffic; a reply to an evicted request is simply routed as an
//! uncorrelated message. Ids carrying the no-reply prefix never enter the
//! map.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::envelope::{epoch_now, is_no_reply};
use crate::router::Handler;

/// Default number of in-flight correlations remembered per client.
pub const DEFAULT_TRACKED_REPLIES: usize = 150;

/// Everything remembered about one sent request.
#[derive(Clone)]
pub struct CorrelationEntry {
    /// Correlation id of the sent request.
    pub correlation_id: String,
    /// Destination the request was addressed to.
    pub destination: String,
    /// Monotonic instant the request was handed to the publish path.
    pub sent_at: Instant,
    /// Wall-clock send time, seconds since the Unix epoch.
    pub sent_at_epoch: f64,
    /// Callback to invoke with the correlated response, if any.
    pub callback: Option<Handler>,
}

impl CorrelationEntry {
    /// Record a freshly sent request.
    #[must_use]
    pub fn new(
        correlation_id: impl Into<String>,
        destination: impl Into<String>,
        callback: Option<Handler>,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            destination: destination.into(),
            sent_at: Instant::now(),
            sent_at_epoch: epoch_now(),
            callback,
        }
    }

    /// Elapsed time between sending the request and receiving its reply.
    #[must_use]
    pub fn round_trip(&self, received_at: Instant) -> Duration {
        received_at.saturating_duration_since(self.sent_at)
    }
}

impl std::fmt::Debug for CorrelationEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrelationEntry")
            .field("correlation_id", &self.correlation_id)
            .field("destination", &self.destination)
            .field("has_callback", &self.callback.is_some())
            .finish_non_exhaustive()
    }
}

struct Inner {
    capacity: usize,
    // Insertion order of live keys; resolved keys linger here until they
    // rotate out, so eviction skips ids no longer present in the map.
    order: VecDeque<String>,
    entries: HashMap<String, CorrelationEntry>,
}

/// Bounded, insertion-ordered map of in-flight request correlations.
///
/// Shared per protocol-layer instance; all methods take `&self` and are safe
/// to call from concurrent handler tasks.
pub struct CorrelationTracker {
    inner: Mutex<Inner>,
}

impl Default for CorrelationTracker {
    fn default() -> Self { Self::new(DEFAULT_TRACKED_REPLIES) }
}

impl CorrelationTracker {
    /// Create a tracker remembering at most `capacity` in-flight requests.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                capacity: capacity.max(1),
                order: VecDeque::new(),
                entries: HashMap::new(),
            }),
        }
    }

    /// Register a sent request whose reply should be recognized later.
    ///
    /// Ids carrying the no-reply prefix are ignored. At capacity, the oldest
    /// live entry is evicted first.
    pub fn expect_reply(&self, entry: CorrelationEntry) {
        if is_no_reply(&entry.correlation_id) {
            debug!(
                correlation_id = %entry.correlation_id,
                "not tracking no-reply correlation id"
            );
            return;
        }
        let mut inner = self.inner.lock().expect("correlation tracker poisoned");
        let key = entry.correlation_id.clone();
        if inner.entries.insert(key.clone(), entry).is_none() {
            inner.order.push_back(key);
        }
        while inner.entries.len() > inner.capacity {
            // Stale keys (already resolved) drop out without touching the map.
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            if inner.entries.remove(&oldest).is_some() {
                debug!(correlation_id = %oldest, "evicted oldest tracked correlation");
            }
        }
    }

    /// Remove and return the entry for a reply correlation id.
    ///
    /// Absence is not an error: it means the reply targets an untracked or
    /// evicted request and must be routed as uncorrelated. Ids carrying the
    /// no-reply prefix are never looked up.
    #[must_use]
    pub fn resolve(&self, reply_correlation_id: &str) -> Option<CorrelationEntry> {
        if is_no_reply(reply_correlation_id) {
            return None;
        }
        let mut inner = self.inner.lock().expect("correlation tracker poisoned");
        inner.entries.remove(reply_correlation_id)
    }

    /// Number of correlations currently tracked.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .expect("correlation tracker poisoned")
            .entries
            .len()
    }

    /// Whether no correlations are currently tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Maximum number of correlations remembered at once.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner
            .lock()
            .expect("correlation tracker poisoned")
            .capacity
    }
}
