//! Sheet-scoped fan-out of edits to connected endpoints.
//!
//! One coordinator task owns the `sheet_id → endpoints` table. Everything
//! else talks to it through a [`HubHandle`], whose four channels (register,
//! unregister, broadcast, query) are the only way to touch the table.
//!
//! ```text
//! Endpoint A ─┐ register / unregister / broadcast
//! Endpoint B ─┼──────────────────────────────────► Hub task ──try_send──► outbound queues
//! Endpoint C ─┘                                   (owns table)
//! ```
//!
//! Delivery never blocks the coordinator: a full outbound queue means the
//! endpoint cannot keep up, so it is dropped from the table and told to
//! close. One stalled connection therefore cannot hold up any other.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::endpoint::Shutdown;
use crate::protocol::{CloseReason, Edit};

/// Identity of one endpoint instance. Unregistration matches on this, never
/// on handle contents.
pub type EndpointId = Uuid;

/// Default buffer for each hub input channel.
pub const HUB_CHANNEL_CAPACITY: usize = 100;

/// Membership events handled in a row before a waiting broadcast gets a turn.
const MEMBERSHIP_BURST: usize = 32;

/// The hub's non-owning view of an endpoint.
#[derive(Debug, Clone)]
pub struct EndpointHandle {
    id: EndpointId,
    sheet_id: String,
    outbound: mpsc::Sender<Edit>,
    shutdown: Shutdown,
}

impl EndpointHandle {
    pub fn new(sheet_id: impl Into<String>, outbound: mpsc::Sender<Edit>, shutdown: Shutdown) -> Self {
        Self {
            id: Uuid::new_v4(),
            sheet_id: sheet_id.into(),
            outbound,
            shutdown,
        }
    }

    pub fn id(&self) -> EndpointId {
        self.id
    }

    pub fn sheet_id(&self) -> &str {
        &self.sheet_id
    }
}

/// An edit to fan out to every endpoint of `sheet_id`.
///
/// `origin` names the endpoint that produced the edit; it is skipped during
/// delivery. `None` delivers to everyone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastMessage {
    pub sheet_id: String,
    pub edit: Edit,
    pub origin: Option<EndpointId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("hub is no longer running")]
pub struct HubClosed;

/// Statistics for monitoring hub health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStats {
    pub messages_broadcast: u64,
    pub deliveries: u64,
    pub slow_consumers_dropped: u64,
    pub faults: u64,
}

#[derive(Default)]
struct AtomicHubStats {
    messages_broadcast: AtomicU64,
    deliveries: AtomicU64,
    slow_consumers_dropped: AtomicU64,
    faults: AtomicU64,
}

impl AtomicHubStats {
    fn snapshot(&self) -> HubStats {
        HubStats {
            messages_broadcast: self.messages_broadcast.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            slow_consumers_dropped: self.slow_consumers_dropped.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
        }
    }
}

enum Query {
    RoomSize {
        sheet_id: String,
        reply: oneshot::Sender<Option<usize>>,
    },
    RoomCount {
        reply: oneshot::Sender<usize>,
    },
    #[cfg(test)]
    Panic,
}

struct Registration {
    endpoint: EndpointHandle,
    done: oneshot::Sender<()>,
}

enum HubEvent {
    Register(Registration),
    Unregister(EndpointHandle),
    Broadcast(BroadcastMessage),
    Query(Query),
}

/// Capability to submit to the hub. Cheap to clone.
#[derive(Clone)]
pub struct HubHandle {
    register: mpsc::Sender<Registration>,
    unregister: mpsc::Sender<EndpointHandle>,
    broadcast: mpsc::Sender<BroadcastMessage>,
    query: mpsc::Sender<Query>,
    stats: Arc<AtomicHubStats>,
}

impl HubHandle {
    /// Add `endpoint` to its sheet's room. Returns once the hub has done so,
    /// so every broadcast submitted afterwards reaches it.
    pub async fn register(&self, endpoint: EndpointHandle) -> Result<(), HubClosed> {
        let (done, rx) = oneshot::channel();
        self.register
            .send(Registration { endpoint, done })
            .await
            .map_err(|_| HubClosed)?;
        rx.await.map_err(|_| HubClosed)
    }

    pub async fn unregister(&self, endpoint: EndpointHandle) -> Result<(), HubClosed> {
        self.unregister.send(endpoint).await.map_err(|_| HubClosed)
    }

    pub async fn broadcast(&self, msg: BroadcastMessage) -> Result<(), HubClosed> {
        self.broadcast.send(msg).await.map_err(|_| HubClosed)
    }

    /// Endpoints currently registered for `sheet_id`; `None` if the sheet
    /// has no entry at all.
    pub async fn room_size(&self, sheet_id: &str) -> Result<Option<usize>, HubClosed> {
        let (reply, rx) = oneshot::channel();
        let query = Query::RoomSize {
            sheet_id: sheet_id.to_string(),
            reply,
        };
        self.query.send(query).await.map_err(|_| HubClosed)?;
        rx.await.map_err(|_| HubClosed)
    }

    /// Number of sheets with at least one registered endpoint.
    pub async fn room_count(&self) -> Result<usize, HubClosed> {
        let (reply, rx) = oneshot::channel();
        self.query
            .send(Query::RoomCount { reply })
            .await
            .map_err(|_| HubClosed)?;
        rx.await.map_err(|_| HubClosed)
    }

    pub fn stats(&self) -> HubStats {
        self.stats.snapshot()
    }
}

/// The coordinator. Build with [`Hub::new`], then drive [`Hub::run`] on its
/// own task.
pub struct Hub {
    rooms: HashMap<String, Vec<EndpointHandle>>,
    register_rx: mpsc::Receiver<Registration>,
    unregister_rx: mpsc::Receiver<EndpointHandle>,
    broadcast_rx: mpsc::Receiver<BroadcastMessage>,
    query_rx: mpsc::Receiver<Query>,
    membership_streak: usize,
    stats: Arc<AtomicHubStats>,
}

impl Hub {
    pub fn new(capacity: usize) -> (Hub, HubHandle) {
        let (register, register_rx) = mpsc::channel(capacity);
        let (unregister, unregister_rx) = mpsc::channel(capacity);
        let (broadcast, broadcast_rx) = mpsc::channel(capacity);
        let (query, query_rx) = mpsc::channel(capacity);
        let stats = Arc::new(AtomicHubStats::default());

        let hub = Hub {
            rooms: HashMap::new(),
            register_rx,
            unregister_rx,
            broadcast_rx,
            query_rx,
            membership_streak: 0,
            stats: stats.clone(),
        };
        let handle = HubHandle {
            register,
            unregister,
            broadcast,
            query,
            stats,
        };
        (hub, handle)
    }

    /// Spawn the coordinator and return its handle.
    pub fn spawn(capacity: usize) -> HubHandle {
        let (hub, handle) = Hub::new(capacity);
        tokio::spawn(hub.run());
        handle
    }

    /// Process events until every [`HubHandle`] is dropped.
    ///
    /// A panic while handling one event is caught and logged; the loop keeps
    /// serving every other sheet.
    pub async fn run(mut self) {
        log::info!("Hub started");
        while let Some(event) = self.next_event().await {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.dispatch(event)));
            if let Err(payload) = outcome {
                self.stats.faults.fetch_add(1, Ordering::Relaxed);
                log::error!("Hub event handler panicked: {}", panic_message(&*payload));
            }
        }
        log::info!("Hub stopped: all handles dropped");
    }

    /// Next event by priority: register, unregister, broadcast, query.
    ///
    /// After [`MEMBERSHIP_BURST`] membership events in a row a queued
    /// broadcast goes first, so churn cannot stall edits indefinitely.
    async fn next_event(&mut self) -> Option<HubEvent> {
        if self.membership_streak >= MEMBERSHIP_BURST {
            self.membership_streak = 0;
            if let Ok(msg) = self.broadcast_rx.try_recv() {
                return Some(HubEvent::Broadcast(msg));
            }
        }

        let event = tokio::select! {
            biased;
            Some(reg) = self.register_rx.recv() => HubEvent::Register(reg),
            Some(ep) = self.unregister_rx.recv() => HubEvent::Unregister(ep),
            Some(msg) = self.broadcast_rx.recv() => HubEvent::Broadcast(msg),
            Some(query) = self.query_rx.recv() => HubEvent::Query(query),
            else => return None,
        };
        match event {
            HubEvent::Register(_) | HubEvent::Unregister(_) => self.membership_streak += 1,
            HubEvent::Broadcast(_) | HubEvent::Query(_) => self.membership_streak = 0,
        }
        Some(event)
    }

    fn dispatch(&mut self, event: HubEvent) {
        match event {
            HubEvent::Register(Registration { endpoint, done }) => {
                self.register(endpoint);
                let _ = done.send(());
            }
            HubEvent::Unregister(ep) => self.unregister(&ep),
            HubEvent::Broadcast(msg) => self.broadcast(msg),
            HubEvent::Query(Query::RoomSize { sheet_id, reply }) => {
                let _ = reply.send(self.rooms.get(&sheet_id).map(Vec::len));
            }
            HubEvent::Query(Query::RoomCount { reply }) => {
                let _ = reply.send(self.rooms.len());
            }
            #[cfg(test)]
            HubEvent::Query(Query::Panic) => panic!("injected hub fault"),
        }
    }

    fn register(&mut self, ep: EndpointHandle) {
        let room = self.rooms.entry(ep.sheet_id.clone()).or_default();
        if room.is_empty() {
            log::info!("Room {} created", ep.sheet_id);
        }
        log::debug!("Endpoint {} joined sheet {}", ep.id, ep.sheet_id);
        room.push(ep);
    }

    fn unregister(&mut self, ep: &EndpointHandle) {
        let Some(room) = self.rooms.get_mut(&ep.sheet_id) else {
            return;
        };
        room.retain(|other| other.id != ep.id);
        log::debug!("Endpoint {} left sheet {}", ep.id, ep.sheet_id);
        if room.is_empty() {
            self.rooms.remove(&ep.sheet_id);
            log::info!("Room {} removed (empty)", ep.sheet_id);
        }
    }

    fn broadcast(&mut self, msg: BroadcastMessage) {
        self.stats.messages_broadcast.fetch_add(1, Ordering::Relaxed);
        let Some(room) = self.rooms.get_mut(&msg.sheet_id) else {
            log::trace!("Broadcast to sheet {} with no endpoints", msg.sheet_id);
            return;
        };

        let mut delivered = 0u64;
        room.retain(|ep| {
            if Some(ep.id) == msg.origin {
                return true;
            }
            match ep.outbound.try_send(msg.edit.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    log::warn!(
                        "Endpoint {} on sheet {} is not keeping up; disconnecting",
                        ep.id,
                        msg.sheet_id
                    );
                    self.stats.slow_consumers_dropped.fetch_add(1, Ordering::Relaxed);
                    ep.shutdown.close(CloseReason::SlowConsumer);
                    false
                }
                // Receiver gone: the endpoint is tearing down.
                Err(TrySendError::Closed(_)) => false,
            }
        });
        self.stats.deliveries.fetch_add(delivered, Ordering::Relaxed);

        if room.is_empty() {
            self.rooms.remove(&msg.sheet_id);
            log::info!("Room {} removed (empty)", msg.sheet_id);
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
