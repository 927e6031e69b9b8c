//! Declared broker topology and its replay bookkeeping.
//!
//! Exchanges, queues, bindings and subscriptions are recorded in the order
//! they were registered. Entries tagged `persist` are re-applied, in that
//! original order, after every successful (re)connect; non-persistent
//! entries are applied once and forgotten. Registration order is kept in an
//! explicit list rather than relying on map iteration order.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::envelope::InboundDelivery;
use crate::error::{ConfigError, Error};

/// Callback invoked with every raw frame a subscription delivers.
pub type DeliveryHandler =
    Arc<dyn Fn(InboundDelivery) -> BoxFuture<'static, Result<(), Error>> + Send + Sync>;

/// Callback invoked when consuming from a subscription fails.
pub type DeliveryErrorHandler = Arc<dyn Fn(&Error) -> BoxFuture<'static, ()> + Send + Sync>;

/// Exchange routing discipline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Route on an exact routing-key match.
    Direct,
    /// Route to every bound queue.
    Fanout,
    /// Route on dotted routing-key patterns.
    Topic,
    /// Route on message headers.
    Headers,
}

/// Declaration of one exchange.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExchangeDeclaration {
    /// Exchange name.
    pub name: String,
    /// Routing discipline.
    pub kind: ExchangeKind,
    /// Whether the exchange survives a broker restart.
    pub durable: bool,
    /// Whether the broker deletes the exchange once unused.
    pub auto_delete: bool,
}

/// Declaration of one queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueDeclaration {
    /// Queue name.
    pub name: String,
    /// Whether the queue survives a broker restart.
    pub durable: bool,
    /// Extra queue arguments passed through to the broker.
    pub arguments: BTreeMap<String, String>,
}

/// Binding of a queue to an exchange under a routing key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BindingDeclaration {
    /// Exchange to bind to.
    pub exchange: String,
    /// Queue being bound.
    pub queue: String,
    /// Routing key of the binding.
    pub routing_key: String,
}

/// One declared topology element.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TopologyItem {
    /// An exchange declaration.
    Exchange(ExchangeDeclaration),
    /// A queue declaration.
    Queue(QueueDeclaration),
    /// An exchange-queue binding.
    Binding(BindingDeclaration),
}

impl TopologyItem {
    fn kind(&self) -> &'static str {
        match self {
            TopologyItem::Exchange(_) => "exchange",
            TopologyItem::Queue(_) => "queue",
            TopologyItem::Binding(_) => "binding",
        }
    }

    fn key(&self) -> String {
        match self {
            TopologyItem::Exchange(e) => e.name.clone(),
            TopologyItem::Queue(q) => q.name.clone(),
            TopologyItem::Binding(b) => {
                format!("{}\u{1f}{}\u{1f}{}", b.exchange, b.queue, b.routing_key)
            }
        }
    }
}

/// A registered consumer on one queue.
#[derive(Clone)]
pub struct Subscription {
    /// Queue to consume from.
    pub queue: String,
    /// Whether the broker should consider deliveries acknowledged
    /// immediately.
    pub auto_ack: bool,
    /// Callback invoked with each delivery.
    pub on_message: DeliveryHandler,
    /// Callback invoked when consuming fails.
    pub on_error: Option<DeliveryErrorHandler>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("queue", &self.queue)
            .field("auto_ack", &self.auto_ack)
            .field("has_error_handler", &self.on_error.is_some())
            .finish_non_exhaustive()
    }
}

struct DeclarationEntry {
    id: u64,
    item: TopologyItem,
    persist: bool,
    applied: bool,
}

struct SubscriptionEntry {
    id: u64,
    subscription: Subscription,
    persist: bool,
    active: bool,
}

/// Ordered record of everything declared on one connection.
pub(crate) struct Topology {
    next_id: u64,
    declarations: Vec<DeclarationEntry>,
    subscriptions: Vec<SubscriptionEntry>,
}

impl Topology {
    pub(crate) fn new() -> Self {
        Self {
            next_id: 0,
            declarations: Vec::new(),
            subscriptions: Vec::new(),
        }
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Record a declaration, rejecting duplicates by name.
    pub(crate) fn register(&mut self, item: TopologyItem, persist: bool) -> Result<(), ConfigError> {
        let key = item.key();
        if self
            .declarations
            .iter()
            .any(|e| e.item.kind() == item.kind() && e.item.key() == key)
        {
            return Err(ConfigError::DuplicateTopology {
                kind: item.kind(),
                name: key,
            });
        }
        let id = self.next_id();
        self.declarations.push(DeclarationEntry {
            id,
            item,
            persist,
            applied: false,
        });
        Ok(())
    }

    /// Record a subscription, rejecting a second consumer on the same queue.
    pub(crate) fn subscribe(
        &mut self,
        subscription: Subscription,
        persist: bool,
    ) -> Result<(), ConfigError> {
        if self
            .subscriptions
            .iter()
            .any(|e| e.subscription.queue == subscription.queue)
        {
            return Err(ConfigError::DuplicateTopology {
                kind: "subscription",
                name: subscription.queue,
            });
        }
        let id = self.next_id();
        self.subscriptions.push(SubscriptionEntry {
            id,
            subscription,
            persist,
            active: false,
        });
        Ok(())
    }

    /// Drop a subscription, returning it so the consumer can be cancelled.
    pub(crate) fn unsubscribe(&mut self, queue: &str) -> Option<Subscription> {
        let index = self
            .subscriptions
            .iter()
            .position(|e| e.subscription.queue == queue)?;
        Some(self.subscriptions.remove(index).subscription)
    }

    /// Declarations awaiting application, in registration order.
    pub(crate) fn pending_declarations(&self) -> Vec<(u64, TopologyItem)> {
        self.declarations
            .iter()
            .filter(|e| !e.applied)
            .map(|e| (e.id, e.item.clone()))
            .collect()
    }

    /// Subscriptions awaiting (re)activation, in registration order.
    pub(crate) fn pending_subscriptions(&self) -> Vec<(u64, Subscription)> {
        self.subscriptions
            .iter()
            .filter(|e| !e.active)
            .map(|e| (e.id, e.subscription.clone()))
            .collect()
    }

    /// Mark a declaration applied; non-persistent entries leave the replay
    /// set at this point.
    pub(crate) fn mark_declared(&mut self, id: u64) {
        if let Some(index) = self.declarations.iter().position(|e| e.id == id) {
            if self.declarations[index].persist {
                self.declarations[index].applied = true;
            } else {
                self.declarations.remove(index);
            }
        }
    }

    /// Mark a subscription active; non-persistent entries will not resume
    /// after a reconnect.
    pub(crate) fn mark_subscribed(&mut self, id: u64) {
        if let Some(index) = self.subscriptions.iter().position(|e| e.id == id) {
            if self.subscriptions[index].persist {
                self.subscriptions[index].active = true;
            } else {
                self.subscriptions.remove(index);
            }
        }
    }

    /// After a link drop, everything persistent becomes pending again.
    pub(crate) fn reset_applied(&mut self) {
        for entry in &mut self.declarations {
            entry.applied = false;
        }
        for entry in &mut self.subscriptions {
            entry.active = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exchange(name: &str) -> TopologyItem {
        TopologyItem::Exchange(ExchangeDeclaration {
            name: name.into(),
            kind: ExchangeKind::Topic,
            durable: false,
            auto_delete: false,
        })
    }

    fn queue(name: &str) -> TopologyItem {
        TopologyItem::Queue(QueueDeclaration {
            name: name.into(),
            durable: false,
            arguments: BTreeMap::new(),
        })
    }

    fn subscription(queue: &str) -> Subscription {
        Subscription {
            queue: queue.into(),
            auto_ack: false,
            on_message: Arc::new(|_| Box::pin(async { Ok(()) })),
            on_error: None,
        }
    }

    #[test]
    fn duplicate_declarations_are_rejected() {
        let mut topology = Topology::new();
        topology.register(exchange("events"), true).expect("first");
        let err = topology
            .register(exchange("events"), true)
            .expect_err("duplicate");
        assert!(matches!(
            err,
            ConfigError::DuplicateTopology {
                kind: "exchange",
                ..
            }
        ));
        // Same name, different kind is fine.
        topology.register(queue("events"), true).expect("queue");
    }

    #[test]
    fn replay_preserves_registration_order() {
        let mut topology = Topology::new();
        topology.register(exchange("events"), true).expect("ok");
        topology.register(queue("inbox"), true).expect("ok");
        topology
            .register(
                TopologyItem::Binding(BindingDeclaration {
                    exchange: "events".into(),
                    queue: "inbox".into(),
                    routing_key: "#".into(),
                }),
                true,
            )
            .expect("ok");

        let pending = topology.pending_declarations();
        let kinds: Vec<&str> = pending.iter().map(|(_, i)| i.kind()).collect();
        assert_eq!(kinds, ["exchange", "queue", "binding"]);

        for (id, _) in pending {
            topology.mark_declared(id);
        }
        assert!(topology.pending_declarations().is_empty());

        topology.reset_applied();
        let replayed: Vec<&str> = topology
            .pending_declarations()
            .iter()
            .map(|(_, i)| i.kind())
            .collect();
        assert_eq!(replayed, ["exchange", "queue", "binding"]);
    }

    #[test]
    fn non_persistent_entries_are_not_replayed() {
        let mut topology = Topology::new();
        topology.register(exchange("keep"), true).expect("ok");
        topology.register(exchange("once"), false).expect("ok");
        for (id, _) in topology.pending_declarations() {
            topology.mark_declared(id);
        }
        topology.reset_applied();
        let names: Vec<String> = topology
            .pending_declarations()
            .iter()
            .map(|(_, i)| i.key())
            .collect();
        assert_eq!(names, ["keep"]);
    }

    #[test]
    fn second_consumer_on_a_queue_is_rejected() {
        let mut topology = Topology::new();
        topology
            .subscribe(subscription("inbox"), true)
            .expect("first");
        let err = topology
            .subscribe(subscription("inbox"), true)
            .expect_err("duplicate");
        assert!(matches!(
            err,
            ConfigError::DuplicateTopology {
                kind: "subscription",
                ..
            }
        ));
    }

    #[test]
    fn unsubscribe_removes_the_consumer() {
        let mut topology = Topology::new();
        topology
            .subscribe(subscription("inbox"), true)
            .expect("ok");
        assert!(topology.unsubscribe("inbox").is_some());
        assert!(topology.unsubscribe("inbox").is_none());
        topology
            .subscribe(subscription("inbox"), true)
            .expect("re-subscribe after unsubscribe");
    }
}
