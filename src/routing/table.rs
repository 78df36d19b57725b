//! src/routing/table.rs
//!
//! `RoutingTable`: the process-wide routing nucleus — `connections`,
//! `entity_keys`, `caller_map`, and the per-peer task/cancel-handle
//! registries (SPEC_FULL §3 "RoutingTable (process-wide)", §9 "global
//! mutable state"). A single value owned by `RoutingEngine`, with interior
//! locking on each map so callers never take an outer lock across an await.

use crate::domain::{Cookie, PeerId};
use crate::keys::PublicKeyMaterial;
use crate::queue::MessageQueue;
use crate::routing::latch::Latch;
use crate::transport::connection::PeerConnection;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A `CallId` as extracted from a SIP `Call-ID` header (§4.4).
pub type CallId = String;

pub struct RoutingTable {
    /// Multiple direct paths per peer are permitted and tried in parallel
    /// (fan-out). The inner set is mutated under its own mutex so concurrent
    /// inserts/removes never race each other.
    pub connections: DashMap<PeerId, Arc<AsyncMutex<HashSet<ConnectionHandle>>>>,
    /// Completion-latch per peer: first resolver of a public key publishes
    /// it, later readers observe the same value.
    pub entity_keys: DashMap<PeerId, Arc<Latch<PublicKeyMaterial>>>,
    /// Response-routing memory for the signaling adapter.
    pub caller_map: DashMap<CallId, PeerId>,
    /// Per-peer receive-loop/flush task handles, joined on `CloseConnection`.
    pub receive_tasks: DashMap<PeerId, JoinHandle<()>>,
    /// Per-peer cancel handles; cancelling one unwinds every task keyed to
    /// that peer.
    pub cancel_handles: DashMap<PeerId, CancellationToken>,
    /// Cookies received via `Entity` messages, consulted by `RouteMessage`
    /// to tell a Hub from a User from a Node recipient (§4.2).
    pub peer_cookies: DashMap<PeerId, Cookie>,
    pub queue: Arc<dyn MessageQueue>,
}

/// A `PeerConnection` handle, hashed/compared by pointer identity so the
/// same underlying connection is never double-counted in a peer's
/// connection set.
#[derive(Clone)]
pub struct ConnectionHandle(pub Arc<PeerConnection>);

impl PartialEq for ConnectionHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for ConnectionHandle {}

impl std::hash::Hash for ConnectionHandle {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.0) as usize).hash(state);
    }
}

impl RoutingTable {
    pub fn new(queue: Arc<dyn MessageQueue>) -> Self {
        Self {
            connections: DashMap::new(),
            entity_keys: DashMap::new(),
            caller_map: DashMap::new(),
            receive_tasks: DashMap::new(),
            cancel_handles: DashMap::new(),
            peer_cookies: DashMap::new(),
            queue,
        }
    }

    /// Union-inserts `conn` into `connections[peer]` under the set's own
    /// mutex (§4.2 OpenConnection).
    pub async fn add_connection(&self, peer: PeerId, conn: Arc<PeerConnection>) {
        let set = self
            .connections
            .entry(peer)
            .or_insert_with(|| Arc::new(AsyncMutex::new(HashSet::new())))
            .clone();
        set.lock().await.insert(ConnectionHandle(conn));
    }

    /// Removes `conn` from `connections[peer]`; drops the entry entirely if
    /// it becomes empty (§4.2 CloseConnection).
    pub async fn remove_connection(&self, peer: PeerId, conn: &Arc<PeerConnection>) {
        if let Some(set) = self.connections.get(&peer) {
            let set = set.clone();
            let mut guard = set.lock().await;
            guard.retain(|h| !Arc::ptr_eq(&h.0, conn));
            let empty = guard.is_empty();
            drop(guard);
            if empty {
                self.connections.remove(&peer);
            }
        }
    }

    pub async fn connections_for(&self, peer: PeerId) -> Vec<Arc<PeerConnection>> {
        match self.connections.get(&peer) {
            Some(set) => set.clone().lock().await.iter().map(|h| h.0.clone()).collect(),
            None => Vec::new(),
        }
    }

    /// Cancels and removes any previously registered handle for `peer`,
    /// then installs `token` as the new one (§4.2 "cancels and joins any
    /// prior receive task keyed on peerId").
    pub fn install_cancel_handle(&self, peer: PeerId, token: CancellationToken) {
        if let Some((_, previous)) = self.cancel_handles.remove(&peer) {
            previous.cancel();
        }
        self.cancel_handles.insert(peer, token);
    }

    /// Installs the receive-loop `JoinHandle` for `peer`, replacing and
    /// discarding any stale handle left from a connection already cancelled
    /// via `install_cancel_handle` (the receive loop tied to it has already
    /// returned or is about to).
    pub fn install_receive_task(&self, peer: PeerId, handle: JoinHandle<()>) {
        self.receive_tasks.insert(peer, handle);
    }

    /// Removes and returns the receive-loop handle for `peer`, for the
    /// caller to await on `CloseConnection`.
    pub fn take_receive_task(&self, peer: PeerId) -> Option<JoinHandle<()>> {
        self.receive_tasks.remove(&peer).map(|(_, handle)| handle)
    }

    pub fn latch_for(&self, peer: PeerId) -> Arc<Latch<PublicKeyMaterial>> {
        self.entity_keys
            .entry(peer)
            .or_insert_with(|| Arc::new(Latch::new()))
            .clone()
    }
}
