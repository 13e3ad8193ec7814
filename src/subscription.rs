//! Subscription engine: data-change and event notification.
//!
//! Clients create a subscription with a publishing interval and a handler,
//! then attach monitored items to it (value changes of a node, events of a
//! source, or server-wide events). Notifications are queued at mutation time
//! and delivered in batches on the publishing interval, one delivery task
//! per subscription, in mutation order. There is no ordering guarantee
//! across subscriptions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use hashbrown::HashMap;
use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::info;

use crate::model::{Node, NodeClass, NodeId, ReferenceType, Value};
use crate::space::NodeSpace;
use crate::{Error, Result};

/// Publishing interval used by callers that do not care to pick one.
pub const DEFAULT_PUBLISH_INTERVAL: Duration = Duration::from_millis(500);

pub type SubscriptionId = u64;
pub type MonitoredItemId = u64;

/// Receipt for one monitored item; pass it back to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MonitorHandle {
    pub subscription: SubscriptionId,
    pub item: MonitoredItemId,
}

/// Lifecycle of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Created,
    Active,
    Terminated,
}

/// An event published by a source node.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub source: NodeId,
    pub message: String,
    pub time: DateTime<Utc>,
}

/// Client-side notification sink. Invoked from the subscription's delivery
/// task, never from the mutating thread.
pub trait SubscriptionHandler: Send + Sync {
    fn data_change(&self, node: &NodeId, value: &Value);
    fn event(&self, event: &Event);
}

/// Handler that logs every notification.
#[derive(Debug, Default)]
pub struct TraceHandler;

impl SubscriptionHandler for TraceHandler {
    fn data_change(&self, node: &NodeId, value: &Value) {
        info!(%node, %value, "data change");
    }

    fn event(&self, event: &Event) {
        info!(source = %event.source, message = %event.message, "event");
    }
}

enum Notification {
    DataChange { node: NodeId, value: Value },
    Event(Event),
}

struct SubEntry {
    state: SubscriptionState,
    queue: mpsc::UnboundedSender<Notification>,
    data_items: HashMap<MonitoredItemId, NodeId>,
    /// None monitors events of every source.
    event_items: HashMap<MonitoredItemId, Option<NodeId>>,
    stop: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

#[derive(Default)]
pub(crate) struct EngineInner {
    next_sub: AtomicU64,
    next_item: AtomicU64,
    subs: RwLock<HashMap<SubscriptionId, SubEntry>>,
}

/// Registry of subscriptions plus the publish side used by the owning space.
#[derive(Default)]
pub(crate) struct SubscriptionEngine {
    inner: Arc<EngineInner>,
}

impl SubscriptionEngine {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Creates a subscription and spawns its delivery task. Must be called
    /// within a Tokio runtime.
    pub(crate) fn create(
        &self,
        period: Duration,
        handler: Arc<dyn SubscriptionHandler>,
    ) -> Subscription {
        let id = self.inner.next_sub.fetch_add(1, Ordering::Relaxed) + 1;
        let (queue, rx) = mpsc::unbounded_channel();
        let (stop, stop_rx) = watch::channel(false);

        let entry = SubEntry {
            state: SubscriptionState::Created,
            queue,
            data_items: HashMap::new(),
            event_items: HashMap::new(),
            stop,
            task: None,
        };
        self.inner.subs.write().insert(id, entry);

        let task = tokio::spawn(deliver(period, rx, handler, stop_rx));

        let mut subs = self.inner.subs.write();
        if let Some(entry) = subs.get_mut(&id) {
            entry.state = SubscriptionState::Active;
            entry.task = Some(task);
        }
        drop(subs);

        Subscription { id, inner: Arc::clone(&self.inner) }
    }

    /// Queues a data-change notification on every subscription monitoring
    /// `node`, one per monitored item.
    pub(crate) fn publish_data_change(&self, node: &NodeId, value: &Value) {
        let subs = self.inner.subs.read();
        for entry in subs.values() {
            if entry.state != SubscriptionState::Active {
                continue;
            }
            for monitored in entry.data_items.values() {
                if monitored == node {
                    let _ = entry.queue.send(Notification::DataChange {
                        node: node.clone(),
                        value: value.clone(),
                    });
                }
            }
        }
    }

    /// Queues an event on every subscription monitoring its source or
    /// monitoring server-wide.
    pub(crate) fn publish_event(&self, event: &Event) {
        let subs = self.inner.subs.read();
        for entry in subs.values() {
            if entry.state != SubscriptionState::Active {
                continue;
            }
            for monitored in entry.event_items.values() {
                let matches = match monitored {
                    Some(source) => source == &event.source,
                    None => true,
                };
                if matches {
                    let _ = entry.queue.send(Notification::Event(event.clone()));
                }
            }
        }
    }
}

async fn deliver(
    period: Duration,
    mut rx: mpsc::UnboundedReceiver<Notification>,
    handler: Arc<dyn SubscriptionHandler>,
    mut stop: watch::Receiver<bool>,
) {
    // First batch goes out one full period after creation.
    let mut tick = time::interval_at(Instant::now() + period, period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = tick.tick() => {
                drain(&mut rx, &handler);
            }
            _ = stop.changed() => {
                // Final flush so termination never drops queued items.
                drain(&mut rx, &handler);
                return;
            }
        }
    }
}

fn drain(rx: &mut mpsc::UnboundedReceiver<Notification>, handler: &Arc<dyn SubscriptionHandler>) {
    while let Ok(notification) = rx.try_recv() {
        match notification {
            Notification::DataChange { node, value } => handler.data_change(&node, &value),
            Notification::Event(event) => handler.event(&event),
        }
    }
}

/// A live subscription. Monitored items are attached and detached through
/// it; `terminate` ends delivery. Dropping without terminating leaves the
/// subscription running, as a server-side subscription would.
pub struct Subscription {
    id: SubscriptionId,
    inner: Arc<EngineInner>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn state(&self) -> SubscriptionState {
        self.inner
            .subs
            .read()
            .get(&self.id)
            .map(|e| e.state)
            .unwrap_or(SubscriptionState::Terminated)
    }

    /// Monitors value changes of one node.
    pub fn subscribe_data_change(&self, node: NodeId) -> Result<MonitorHandle> {
        let mut subs = self.inner.subs.write();
        let entry = self.active_entry(&mut subs)?;
        let item = self.inner.next_item.fetch_add(1, Ordering::Relaxed) + 1;
        entry.data_items.insert(item, node);
        Ok(MonitorHandle { subscription: self.id, item })
    }

    /// Monitors events of one source, or of every source when `source` is
    /// None.
    pub fn subscribe_events(&self, source: Option<NodeId>) -> Result<MonitorHandle> {
        let mut subs = self.inner.subs.write();
        let entry = self.active_entry(&mut subs)?;
        let item = self.inner.next_item.fetch_add(1, Ordering::Relaxed) + 1;
        entry.event_items.insert(item, source);
        Ok(MonitorHandle { subscription: self.id, item })
    }

    /// Detaches a monitored item. Unknown or already-detached handles are a
    /// no-op.
    pub fn unsubscribe(&self, handle: MonitorHandle) {
        let mut subs = self.inner.subs.write();
        if let Some(entry) = subs.get_mut(&handle.subscription) {
            entry.data_items.remove(&handle.item);
            entry.event_items.remove(&handle.item);
        }
    }

    /// Ends the subscription: detaches every monitored item, flushes queued
    /// notifications to the handler, then stops the delivery task. Waits for
    /// the in-flight delivery to finish.
    pub async fn terminate(&self) {
        let task = {
            let mut subs = self.inner.subs.write();
            let Some(entry) = subs.get_mut(&self.id) else {
                return;
            };
            if entry.state == SubscriptionState::Terminated {
                return;
            }
            entry.state = SubscriptionState::Terminated;
            entry.data_items.clear();
            entry.event_items.clear();
            let _ = entry.stop.send(true);
            entry.task.take()
        };
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    fn active_entry<'a>(
        &self,
        subs: &'a mut HashMap<SubscriptionId, SubEntry>,
    ) -> Result<&'a mut SubEntry> {
        match subs.get_mut(&self.id) {
            Some(entry) if entry.state == SubscriptionState::Active => Ok(entry),
            _ => Err(Error::SubscriptionClosed(self.id)),
        }
    }
}

// ============================================================================
// Discovery
// ============================================================================

/// Nodes under `parent` that declare at least one outgoing GeneratesEvent
/// reference.
pub async fn event_sources<S: NodeSpace + ?Sized>(
    space: &S,
    parent: &NodeId,
) -> Result<Vec<Node>> {
    let mut sources = Vec::new();
    for child in space.browse(parent, crate::model::BrowseDirection::Forward, None, None).await? {
        let generated = space
            .browse(
                &child.id,
                crate::model::BrowseDirection::Forward,
                Some(ReferenceType::GeneratesEvent),
                None,
            )
            .await?;
        if !generated.is_empty() {
            sources.push(child);
        }
    }
    Ok(sources)
}

/// Variables one level below the children of `parent` whose Historizing
/// attribute is set.
pub async fn historizing_variables<S: NodeSpace + ?Sized>(
    space: &S,
    parent: &NodeId,
) -> Result<Vec<Node>> {
    let mut found = Vec::new();
    for child in space.browse(parent, crate::model::BrowseDirection::Forward, None, None).await? {
        for var in space.variables_of(&child.id).await? {
            if var.class == NodeClass::Variable && var.historizing() {
                found.push(var);
            }
        }
    }
    Ok(found)
}

/// Monitored items attached by [`subscribe_discovered`].
#[derive(Debug, Default)]
pub struct MonitoredSet {
    pub data: Vec<MonitorHandle>,
    pub events: Vec<MonitorHandle>,
}

/// Seeds a subscription from what `parent` exposes: a data-change item per
/// historizing variable, an event item per event source, and one server-wide
/// event item.
pub async fn subscribe_discovered<S: NodeSpace + ?Sized>(
    space: &S,
    subscription: &Subscription,
    parent: &NodeId,
) -> Result<MonitoredSet> {
    let mut set = MonitoredSet::default();
    for var in historizing_variables(space, parent).await? {
        set.data.push(subscription.subscribe_data_change(var.id)?);
    }
    for source in event_sources(space, parent).await? {
        set.events.push(subscription.subscribe_events(Some(source.id))?);
    }
    set.events.push(subscription.subscribe_events(None)?);
    Ok(set)
}
