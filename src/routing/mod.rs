//! src/routing/mod.rs
//!
//! `RoutingEngine`: owns the `RoutingTable`, dispatches inbound messages,
//! and implements forwarding, store-and-forward, and fan-out (§4.2). It is
//! shared as `Arc<RoutingEngine>` so both its own run loop (inbound dispatch
//! plus the periodic flush sweep) and the `SignalingAdapter` (outbound
//! encrypt-then-route, on-demand key retrieval) can call straight into it —
//! the event-publisher split from §9 only needs to hold in the other
//! direction: `PeerConnection` never holds a reference back to this type.

pub mod latch;
pub mod table;

use crate::config::Config;
use crate::directory::Directory;
use crate::domain::{Cookie, CookieBody, Message, PeerId, ProtocolCode};
use crate::error::{Error, Result};
use crate::keys::{KeyStore, PublicKeyMaterial};
use crate::queue::MessageQueue;
use crate::transport::connection::{InboundMessage, PeerConnection};
use crate::transport::Transport;
use std::sync::Arc;
use std::time::Duration;
use table::RoutingTable;
use tokio::sync::{mpsc, Mutex as AsyncMutex, OnceCell};
use tokio_util::sync::CancellationToken;

/// Flush-all sweep period used when `Config::flush_sweep_interval_ms` isn't
/// available (historically `FLUSH_SWEEP_INTERVAL`).
pub const DEFAULT_FLUSH_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// A decrypted inbound Application payload handed off to whatever local
/// consumer wants it (the `SignalingAdapter`, in this crate's one binding).
/// Carries plaintext only: the wire `Message` has no sender field (§3), so
/// identifying who sent it is left to whatever the plaintext itself encodes
/// (for SIP, the `From` header).
pub struct InboundApplicationMessage {
    pub plaintext: Vec<u8>,
}

pub struct RoutingEngine {
    self_id: PeerId,
    keys: Arc<KeyStore>,
    table: Arc<RoutingTable>,
    directory: Arc<dyn Directory>,
    transport: Arc<Transport>,
    own_cookie: Cookie,
    start_ttl: i32,
    zero_ttl_propagates: bool,
    flush_sweep_interval: Duration,
    inbound_tx: mpsc::Sender<InboundMessage>,
    inbound_rx: AsyncMutex<mpsc::Receiver<InboundMessage>>,
    signaling_tx: OnceCell<mpsc::Sender<InboundApplicationMessage>>,
}

impl RoutingEngine {
    pub fn new(
        self_id: PeerId,
        keys: Arc<KeyStore>,
        config: &Config,
        directory: Arc<dyn Directory>,
        transport: Arc<Transport>,
        queue: Arc<dyn MessageQueue>,
    ) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::channel(256);
        let own_cookie = build_self_cookie(&keys, config);
        Arc::new(Self {
            self_id,
            keys,
            table: Arc::new(RoutingTable::new(queue)),
            directory,
            transport,
            own_cookie,
            start_ttl: config.start_ttl,
            zero_ttl_propagates: config.zero_ttl_propagates,
            flush_sweep_interval: Duration::from_millis(config.flush_sweep_interval_ms),
            inbound_tx,
            inbound_rx: AsyncMutex::new(inbound_rx),
            signaling_tx: OnceCell::new(),
        })
    }

    pub fn self_id(&self) -> PeerId {
        self.self_id
    }

    /// Registers the channel the `SignalingAdapter` wants decrypted inbound
    /// Application payloads delivered on. Set once at wiring time.
    pub fn set_signaling_sender(&self, tx: mpsc::Sender<InboundApplicationMessage>) {
        let _ = self.signaling_tx.set(tx);
    }

    /// Drives inbound dispatch and the minute-granularity flush-all sweep
    /// (§4.2 FlushMessages with no key). Mirrors the host codebase's
    /// `Engine::run` shape: one `tokio::select!` over shutdown, timer, and
    /// an inbound channel.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut inbound_rx = self.inbound_rx.lock().await;
        let mut sweep = tokio::time::interval(self.flush_sweep_interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("routing engine received shutdown signal");
                    break;
                }
                _ = sweep.tick() => {
                    self.flush_all().await;
                }
                maybe_inbound = inbound_rx.recv() => {
                    match maybe_inbound {
                        Some(inbound) => self.dispatch_inbound(inbound).await,
                        None => break,
                    }
                }
            }
        }
    }

    // ---- OpenConnection / CloseConnection (§4.2) ----

    /// Registers `conn` under `peer`, cancelling any prior receive/flush
    /// tasks keyed to the same peer, then spawns a fresh pair: the
    /// connection's own receive+keepalive tasks and a `FlushMessages(peer)`
    /// task under a fresh cancel handle.
    pub async fn open_connection(self: &Arc<Self>, conn: Arc<PeerConnection>, peer: PeerId) {
        self.table.add_connection(peer, conn.clone()).await;
        let receive_task = conn.spawn_tasks(peer, self.inbound_tx.clone());
        self.table.install_receive_task(peer, receive_task);

        let cancel = CancellationToken::new();
        self.table.install_cancel_handle(peer, cancel.clone());

        let engine = self.clone();
        tokio::spawn(async move {
            engine.flush_loop_for_peer(peer, cancel).await;
        });

        tracing::info!(peer = %peer, "connection registered");
    }

    /// Removes `conn` from `connections[peer]`, cancelling its per-peer
    /// tasks and joining the receive task once no entry references it any
    /// longer (§4.2 CloseConnection, §5 "joining the receive task ...
    /// before disposing streams").
    pub async fn close_connection(&self, conn: &Arc<PeerConnection>, peer: PeerId) {
        self.table.remove_connection(peer, conn).await;
        if !self.table.connections.contains_key(&peer) {
            if let Some((_, cancel)) = self.table.cancel_handles.remove(&peer) {
                cancel.cancel();
            }
            if let Some(receive_task) = self.table.take_receive_task(peer) {
                if let Err(e) = receive_task.await {
                    if !e.is_cancelled() {
                        tracing::warn!(peer = %peer, error = %e, "receive task panicked");
                    }
                }
            }
        }
        conn.close();
    }

    async fn flush_loop_for_peer(self: Arc<Self>, peer: PeerId, cancel: CancellationToken) {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = self.flush_messages(peer) => {}
        }
    }

    // ---- Inbound dispatch (§4.2, §4.3) ----

    async fn dispatch_inbound(self: &Arc<Self>, inbound: InboundMessage) {
        let message = inbound.message;
        if message.recipient == self.self_id {
            self.process_local(inbound.from_stream_peer, message).await;
        } else {
            self.route_message(message).await;
        }
    }

    async fn process_local(self: &Arc<Self>, from_stream_peer: PeerId, message: Message) {
        match message.code {
            ProtocolCode::Command => {
                tracing::trace!(peer = %from_stream_peer, "received command (ignored)");
            }
            ProtocolCode::Entity => self.process_entity(from_stream_peer, &message).await,
            ProtocolCode::Application => self.process_application(&message).await,
        }
    }

    /// Cookie exchange (§4.3). First setter of the peer's latch registers
    /// the connection under the cookie's key and replies with our own
    /// cookie; subsequent Entity messages for an already-latched peer are
    /// no-ops (§8 property 5, "latch monotonicity").
    async fn process_entity(self: &Arc<Self>, from_stream_peer: PeerId, message: &Message) {
        let cookie: Cookie = match bson::from_slice(message.payload_bytes()) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %e, "protocol violation: malformed cookie");
                return;
            }
        };

        let public_key = match PublicKeyMaterial::from_bytes(&cookie.public_key_blob.bytes) {
            Ok(k) => k,
            Err(e) => {
                tracing::warn!(error = %e, "protocol violation: malformed cookie public key");
                return;
            }
        };

        if public_key.peer_id() != cookie.key {
            tracing::warn!(claimed = %cookie.key, "cookie fingerprint binding violated, dropping");
            return;
        }

        let body_bytes = match bson::to_vec(&cookie.body) {
            Ok(b) => b,
            Err(_) => return,
        };
        if KeyStore::verify_detached(&public_key, &body_bytes, &cookie.signature.bytes).is_err() {
            tracing::warn!(peer = %cookie.key, "cookie signature verification failed, dropping");
            return;
        }

        let peer_key = cookie.key;
        let latch = self.table.latch_for(peer_key);
        if latch.try_set(public_key) {
            self.table.peer_cookies.insert(peer_key, cookie);

            if let Some(conn) = self.table.connections_for(from_stream_peer).await.into_iter().next() {
                self.open_connection(conn, peer_key).await;
            }

            // Reply with our own cookie, completing the handshake from
            // their perspective.
            self.route_message(self.entity_announcement(peer_key)).await;
        }
    }

    fn entity_announcement(&self, recipient: PeerId) -> Message {
        let payload = bson::to_vec(&self.own_cookie).expect("cookie always serializes");
        Message::new(recipient, self.start_ttl, ProtocolCode::Entity, payload)
    }

    async fn process_application(&self, message: &Message) {
        let plaintext = match self.keys.decrypt_unverified(message.payload_bytes()) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, "failed to decrypt application payload, dropping");
                return;
            }
        };

        if let Some(tx) = self.signaling_tx.get() {
            let _ = tx.send(InboundApplicationMessage { plaintext }).await;
        }
    }

    // ---- GetEntityKeys (§4.5) ----

    /// Resolves `peer`'s public key material, triggering the Entity exchange
    /// if it is not already known. No timeout is imposed here; callers that
    /// need one wrap this call in `tokio::time::timeout`.
    pub async fn get_entity_keys(self: &Arc<Self>, peer: PeerId) -> PublicKeyMaterial {
        let latch = self.table.latch_for(peer);
        if let Some(known) = latch.get() {
            return known;
        }
        self.route_message(self.entity_announcement(peer)).await;
        latch.wait().await
    }

    /// Encrypts `plaintext` to `recipient` under our own key and submits it
    /// as an Application message (§4.4 "outbound request/response"). Used by
    /// the signaling adapter; fetches `recipient`'s key first if needed.
    pub async fn submit_application_message(self: &Arc<Self>, recipient: PeerId, plaintext: &[u8]) -> Result<()> {
        let recipient_key = self.get_entity_keys(recipient).await;
        let ciphertext = self.keys.encrypt_and_sign(&recipient_key, plaintext)?;
        let message = Message::new(recipient, self.start_ttl, ProtocolCode::Application, ciphertext);
        self.route_message(message).await;
        Ok(())
    }

    /// Records which peer a `Call-ID` should be answered to (§4.4).
    pub fn record_caller(&self, call_id: String, peer: PeerId) {
        self.table.caller_map.insert(call_id, peer);
    }

    /// Looks up the peer a prior request's `Call-ID` was recorded against.
    pub fn lookup_caller(&self, call_id: &str) -> Option<PeerId> {
        self.table.caller_map.get(call_id).map(|entry| *entry)
    }

    // ---- RouteMessage (§4.2) ----

    pub async fn route_message(self: &Arc<Self>, message: Message) {
        if message.ttl < 0 {
            let rewritten = message.with_ttl(self.start_ttl);
            Box::pin(self.route_message(rewritten)).await;
            return;
        }

        if message.ttl == 0 && !self.zero_ttl_propagates {
            // Default: a message that has already decremented to 0 stops
            // here rather than attempting one more hop (§4.2 open question,
            // resolved in DESIGN.md). Not enqueued either — it has run out
            // of hops, not out of luck finding a route.
            tracing::debug!(recipient = %message.recipient, "ttl exhausted, dropping");
            return;
        }

        let direct = self.table.connections_for(message.recipient).await;
        if !direct.is_empty() {
            let forwarded = message.forwarded();
            let sends = direct
                .iter()
                .map(|conn| conn.send(message.recipient, &forwarded));
            let sent_any = futures::future::join_all(sends)
                .await
                .into_iter()
                .any(|r| r.is_ok());
            if sent_any {
                return;
            }
        }

        if let Some(cookie) = self.table.peer_cookies.get(&message.recipient).map(|c| c.clone()) {
            match &cookie.body {
                CookieBody::Hub { .. } => {
                    if self.dial_and_route(message.recipient, message.clone()).await.is_ok() {
                        return;
                    }
                }
                CookieBody::User { owned_nodes } => {
                    let engine = self.clone();
                    let routes = owned_nodes.clone().into_iter().map(|node| {
                        let engine = engine.clone();
                        let mut addressed = message.clone();
                        addressed.recipient = node;
                        async move { Box::pin(engine.route_message(addressed)).await }
                    });
                    futures::future::join_all(routes).await;
                    return;
                }
                CookieBody::Node {
                    most_recently_seen_by,
                } => {
                    if *most_recently_seen_by == self.self_id {
                        self.enqueue(message.recipient, message).await;
                    } else {
                        let mut addressed = message.clone();
                        addressed.recipient = *most_recently_seen_by;
                        Box::pin(self.route_message(addressed)).await;
                    }
                    return;
                }
            }
        }

        if let Ok(Some(entry)) = self.directory.lookup(message.recipient).await {
            if self
                .dial_hub_at(entry.hub_endpoint, message.recipient, message.clone())
                .await
                .is_ok()
            {
                return;
            }
        }

        self.enqueue(message.recipient, message).await;
    }

    async fn dial_and_route(self: &Arc<Self>, hub: PeerId, message: Message) -> Result<()> {
        let Some(entry) = self.directory.lookup(hub).await? else {
            return Err(Error::NoRoute(hub));
        };
        self.dial_hub_at(entry.hub_endpoint, hub, message).await
    }

    /// Dials the hub endpoint for `expected_peer` and sends the message
    /// straight over that freshly-established connection. The connection is
    /// registered under the hub's own id (`outcome.remote_id`), not
    /// `expected_peer`'s, so the message is handed to `conn` directly rather
    /// than recursed through `route_message`. A generic re-route would
    /// consult `connections_for(expected_peer)`, find nothing, and re-dial
    /// the same hub forever as TTL burns down (§4.2 row 3, hub relay).
    async fn dial_hub_at(
        self: &Arc<Self>,
        addr: std::net::SocketAddr,
        expected_peer: PeerId,
        message: Message,
    ) -> Result<()> {
        match self.transport.connect_to_peer(addr, &self.keys).await {
            Ok((conn, outcome)) => {
                self.open_connection(conn.clone(), outcome.remote_id).await;
                let forwarded = message.forwarded();
                conn.send(expected_peer, &forwarded).await
            }
            Err(Error::DialTimeout(_)) => {
                self.enqueue(expected_peer, message).await;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn enqueue(&self, key: PeerId, message: Message) {
        if let Err(e) = self.table.queue.enqueue(key, message).await {
            tracing::warn!(error = %e, "failed to persist message to store-and-forward queue");
        }
    }

    // ---- FlushMessages (§4.2) ----

    /// Re-routes every message queued under `key`. Safe under concurrent
    /// `enqueue` since `MessageQueue::drain` atomically empties the backlog
    /// before any of it is re-routed.
    pub async fn flush_messages(self: &Arc<Self>, key: PeerId) {
        match self.table.queue.drain(key).await {
            Ok(messages) => {
                for message in messages {
                    Box::pin(self.route_message(message)).await;
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to drain queue for flush"),
        }
    }

    /// `FlushMessages()` with no key: drains every keyed FIFO. Invoked by
    /// the 60-second sweep in `run` and by tests exercising store-and-forward.
    pub async fn flush_all(self: &Arc<Self>) {
        match self.table.queue.pending_recipients().await {
            Ok(recipients) => {
                for key in recipients {
                    self.flush_messages(key).await;
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to enumerate pending queue keys"),
        }
    }
}

fn build_self_cookie(keys: &KeyStore, config: &Config) -> Cookie {
    let body = CookieBody::Hub {
        hostname: config.hostname.clone(),
        directory_uri: config.directory_endpoint.clone().unwrap_or_default(),
        service_uri: config.p2p_addr.to_string(),
        owners: Vec::new(),
    };
    let body_bytes = bson::to_vec(&body).expect("cookie body always serializes");
    let signature = keys
        .sign_detached(&body_bytes)
        .expect("signing our own cookie cannot fail");
    let public_key_blob = keys
        .public_key_material()
        .to_bytes()
        .expect("public key always serializes");

    Cookie {
        key: keys.peer_id(),
        public_key_blob: bson::Binary {
            subtype: bson::spec::BinarySubtype::Generic,
            bytes: public_key_blob,
        },
        body,
        signature: bson::Binary {
            subtype: bson::spec::BinarySubtype::Generic,
            bytes: signature,
        },
    }
}
