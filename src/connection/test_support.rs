//! In-memory broker link for actor and protocol-layer tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::ConnectionConfig;
use crate::envelope::{Envelope, InboundDelivery};
use crate::error::TransportError;
use crate::link::{Link, LinkConnector, LinkEvent};
use crate::topology::{Subscription, TopologyItem};

/// Scriptable, recording stand-in for the broker side of a link.
pub(crate) struct FakeBroker {
    log: Mutex<Vec<String>>,
    publishes: Mutex<Vec<Envelope>>,
    subscriptions: Mutex<HashMap<String, Subscription>>,
    connects: AtomicU32,
    fail_first: AtomicU32,
    live_events: Mutex<Option<mpsc::Sender<LinkEvent>>>,
}

impl FakeBroker {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            log: Mutex::new(Vec::new()),
            publishes: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(HashMap::new()),
            connects: AtomicU32::new(0),
            fail_first: AtomicU32::new(0),
            live_events: Mutex::new(None),
        })
    }

    /// Fail this many connection attempts before accepting one.
    pub(crate) fn fail_first(self: &Arc<Self>, attempts: u32) -> Arc<Self> {
        self.fail_first.store(attempts, Ordering::SeqCst);
        Arc::clone(self)
    }

    pub(crate) fn connector(self: &Arc<Self>) -> Arc<dyn LinkConnector> {
        Arc::new(FakeConnector(Arc::clone(self)))
    }

    fn record(&self, entry: impl Into<String>) {
        self.log.lock().expect("log lock").push(entry.into());
    }

    /// Drain the recorded operation log.
    pub(crate) fn take_log(&self) -> Vec<String> {
        std::mem::take(&mut *self.log.lock().expect("log lock"))
    }

    /// Envelopes published so far, in send order.
    pub(crate) fn published(&self) -> Vec<Envelope> {
        self.publishes.lock().expect("publishes lock").clone()
    }

    pub(crate) fn connect_count(&self) -> u32 { self.connects.load(Ordering::SeqCst) }

    /// Invoke the consumer registered on `queue` with a raw delivery,
    /// returning the handler result.
    pub(crate) async fn deliver(
        &self,
        queue: &str,
        delivery: InboundDelivery,
    ) -> Result<(), crate::error::Error> {
        let subscription = {
            let subscriptions = self.subscriptions.lock().expect("subscriptions lock");
            subscriptions.get(queue).expect("consumer on queue").clone()
        };
        (subscription.on_message)(delivery).await
    }

    /// Simulate an unexpected link drop.
    pub(crate) async fn drop_link(&self) {
        let sender = self
            .live_events
            .lock()
            .expect("events lock")
            .take()
            .expect("a live link to drop");
        sender
            .send(LinkEvent::Lost(TransportError::NotConnected))
            .await
            .expect("actor receives the drop");
    }
}

pub(crate) struct FakeConnector(Arc<FakeBroker>);

#[async_trait]
impl LinkConnector for FakeConnector {
    async fn connect(
        &self,
        _config: &ConnectionConfig,
        events: mpsc::Sender<LinkEvent>,
    ) -> Result<Box<dyn Link>, TransportError> {
        let attempt = self.0.connects.fetch_add(1, Ordering::SeqCst);
        if attempt < self.0.fail_first.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        *self.0.live_events.lock().expect("events lock") = Some(events);
        Ok(Box::new(FakeLink(Arc::clone(&self.0))))
    }
}

struct FakeLink(Arc<FakeBroker>);

#[async_trait]
impl Link for FakeLink {
    async fn apply(&mut self, item: &TopologyItem) -> Result<(), TransportError> {
        let entry = match item {
            TopologyItem::Exchange(e) => format!("exchange:{}", e.name),
            TopologyItem::Queue(q) => format!("queue:{}", q.name),
            TopologyItem::Binding(b) => format!("binding:{}->{}", b.exchange, b.queue),
        };
        self.0.record(entry);
        Ok(())
    }

    async fn consume(&mut self, subscription: Subscription) -> Result<(), TransportError> {
        self.0.record(format!("consume:{}", subscription.queue));
        self.0
            .subscriptions
            .lock()
            .expect("subscriptions lock")
            .insert(subscription.queue.clone(), subscription);
        Ok(())
    }

    async fn cancel(&mut self, queue: &str) -> Result<(), TransportError> {
        self.0.record(format!("cancel:{queue}"));
        self.0
            .subscriptions
            .lock()
            .expect("subscriptions lock")
            .remove(queue);
        Ok(())
    }

    async fn publish(&mut self, envelope: &Envelope) -> Result<(), TransportError> {
        self.0
            .record(format!("publish:{}", envelope.headers.destination));
        self.0
            .publishes
            .lock()
            .expect("publishes lock")
            .push(envelope.clone());
        Ok(())
    }

    async fn close(&mut self) {}
}
