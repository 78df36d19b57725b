//! src/transport/connection.rs
//!
//! `PeerConnection`: owns one underlying QUIC connection, runs the
//! handshake, and exposes `send`/an inbound-message event stream to the
//! routing engine. PeerConnection does not know about `RoutingEngine` —
//! inbound messages are published on an mpsc channel, the event-publisher
//! split called for in SPEC_FULL §9 to avoid the cyclic
//! PeerConnection-owns-RoutingTable-owns-PeerConnection ownership the
//! original design fell into.

use crate::domain::{Message, PeerId};
use crate::error::{Error, Result};
use crate::keys::KeyStore;
use crate::transport::handshake::{self, HandshakeOutcome};
use quinn::Connection;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Keepalive period used when nothing more specific is configured (§5,
/// historically `KEEPALIVE_INTERVAL`); `Config::keepalive_interval_ms` is the
/// knob callers actually thread through `Transport`.
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

/// A single message received over a `PeerConnection`, tagged with the
/// stream's associated peer so a multiplexed connection can be demuxed.
#[derive(Debug)]
pub struct InboundMessage {
    pub from_stream_peer: PeerId,
    pub message: Message,
}

/// One outbound stream, guarded by a mutex so concurrent `send`s still
/// produce a well-formed FIFO byte sequence on the wire (§5: per-stream
/// mutex around BSON writes).
struct OutboundStream {
    send: Mutex<quinn::SendStream>,
}

/// Owns one `quinn::Connection` and everything layered over it: the
/// handshake, per-peer stream multiplexing (§4.1 "multiplexing policy"),
/// the receive loop, and the keepalive task.
pub struct PeerConnection {
    connection: Connection,
    /// Streams opened by us, keyed by the peer at the other end of each
    /// logical pairing multiplexed over this connection.
    outbound_streams: Mutex<HashMap<PeerId, Arc<OutboundStream>>>,
    /// Streams the remote opened to us: the bidi stream's receive half, kept
    /// alive so `receive_loop` can read the record stream the handshake
    /// negotiated (§6 "records streamed back-to-back over one bidirectional
    /// QUIC stream"), plus bookkeeping for the legacy probe in SPEC_FULL §9.
    inbound_streams: Mutex<HashMap<PeerId, quinn::RecvStream>>,
    keepalive_interval: Duration,
    cancel: CancellationToken,
}

impl PeerConnection {
    /// Drives the initiator side: opens a bidi stream on an established
    /// connection and completes the PGP handshake over it.
    pub async fn connect(
        connection: Connection,
        keys: &KeyStore,
        keepalive_interval: Duration,
    ) -> Result<(Arc<Self>, HandshakeOutcome)> {
        let (send, recv) = connection.open_bi().await?;
        let mut stream = BidiStream { send, recv };
        let outcome = handshake::run_initiator(&mut stream, keys).await?;
        Self::finish(connection, stream, outcome, keepalive_interval).await
    }

    /// Drives the responder side: accepts the first bidi stream on an
    /// already-established connection and completes the handshake.
    pub async fn accept(
        connection: Connection,
        keys: &KeyStore,
        keepalive_interval: Duration,
    ) -> Result<(Arc<Self>, HandshakeOutcome)> {
        let (send, recv) = connection.accept_bi().await?;
        let mut stream = BidiStream { send, recv };
        let outcome = handshake::run_responder(&mut stream, keys).await?;
        Self::finish(connection, stream, outcome, keepalive_interval).await
    }

    async fn finish(
        connection: Connection,
        stream: BidiStream,
        outcome: HandshakeOutcome,
        keepalive_interval: Duration,
    ) -> Result<(Arc<Self>, HandshakeOutcome)> {
        let peer_connection = Arc::new(Self {
            connection,
            outbound_streams: Mutex::new(HashMap::new()),
            inbound_streams: Mutex::new(HashMap::new()),
            keepalive_interval,
            cancel: CancellationToken::new(),
        });
        let remote_id = outcome.remote_id;
        peer_connection.register_stream_pair(remote_id, stream).await;
        Ok((peer_connection, outcome))
    }

    async fn register_stream_pair(&self, peer: PeerId, stream: BidiStream) {
        let outbound = Arc::new(OutboundStream {
            send: Mutex::new(stream.send),
        });
        self.outbound_streams.lock().await.insert(peer, outbound);
        self.inbound_streams.lock().await.insert(peer, stream.recv);
    }

    /// Removes and returns the inbound stream for `peer`, falling back to
    /// the sole entry when there is exactly one and it wasn't keyed to
    /// `peer` directly (mirrors `best_outbound_stream`'s fallback; a
    /// handshake registers exactly one stream pair per connection).
    async fn take_inbound_stream(&self, peer: PeerId) -> Option<quinn::RecvStream> {
        let mut streams = self.inbound_streams.lock().await;
        if let Some(s) = streams.remove(&peer) {
            return Some(s);
        }
        if streams.len() == 1 {
            let only_key = *streams.keys().next().expect("len == 1");
            return streams.remove(&only_key);
        }
        None
    }

    pub fn cancel_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn remote_address(&self) -> std::net::SocketAddr {
        self.connection.remote_address()
    }

    pub fn is_closed(&self) -> bool {
        self.connection.close_reason().is_some()
    }

    /// The corrected stream lookup (§4.1 "stream selection"): consults the
    /// outbound map, falling back to the sole outbound stream if exactly
    /// one exists and none was keyed to `peer` directly. `send` always
    /// calls this one.
    async fn best_outbound_stream(&self, peer: PeerId) -> Option<Arc<OutboundStream>> {
        let streams = self.outbound_streams.lock().await;
        if let Some(s) = streams.get(&peer) {
            return Some(s.clone());
        }
        if streams.len() == 1 {
            return streams.values().next().cloned();
        }
        None
    }

    /// The faithfully-reproduced buggy lookup from SPEC_FULL §9: probes the
    /// *inbound* map first, so on a connection whose only inbound stream
    /// belongs to a different peer than the lone outbound stream, this
    /// returns `None` where `best_outbound_stream` would correctly fall
    /// back to the sole outbound stream. Kept and tested so the documented
    /// discrepancy is visible rather than silently fixed away; `send` never
    /// calls this.
    #[allow(dead_code)]
    async fn best_outbound_stream_legacy_probe(&self, peer: PeerId) -> Option<Arc<OutboundStream>> {
        let inbound = self.inbound_streams.lock().await;
        if inbound.contains_key(&peer) {
            let streams = self.outbound_streams.lock().await;
            return streams.get(&peer).cloned();
        }
        None
    }

    /// Serializes `message` as BSON and writes it to the outbound stream for
    /// `peer`. Returns `Error::NoRoute` if no such stream exists.
    pub async fn send(&self, peer: PeerId, message: &Message) -> Result<()> {
        let stream = self
            .best_outbound_stream(peer)
            .await
            .ok_or(Error::NoRoute(peer))?;
        let bytes = bson::to_vec(message)?;
        let mut send = stream.send.lock().await;
        send.write_all(&bytes).await?;
        Ok(())
    }

    /// Spawns the receive loop and keepalive task for this connection.
    /// `inbound_tx` publishes every decoded message; PeerConnection has no
    /// further opinion on what happens to it. Returns the receive loop's
    /// `JoinHandle` so the caller can join it on `CloseConnection` (§4.2).
    pub fn spawn_tasks(
        self: &Arc<Self>,
        peer: PeerId,
        inbound_tx: mpsc::Sender<InboundMessage>,
    ) -> JoinHandle<()> {
        let receive_conn = self.clone();
        let receive_cancel = self.cancel.clone();
        let receive_handle = tokio::spawn(async move {
            receive_conn.receive_loop(peer, inbound_tx, receive_cancel).await;
        });

        let keepalive_conn = self.clone();
        let keepalive_cancel = self.cancel.clone();
        tokio::spawn(async move {
            keepalive_conn.keepalive_loop(peer, keepalive_cancel).await;
        });

        receive_handle
    }

    /// Reads one BSON-encoded `Message` off `recv`, framed by the 4-byte
    /// little-endian document-length prefix every BSON document already
    /// starts with (§6: records streamed back-to-back, no extra framing).
    /// Returns `Ok(None)` on a clean end of stream with nothing partially
    /// read.
    async fn read_framed_message(recv: &mut quinn::RecvStream) -> Result<Option<Message>> {
        let mut len_buf = [0u8; 4];
        match recv.read_exact(&mut len_buf).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(Error::ReadStream(e.to_string())),
        }

        let len = i32::from_le_bytes(len_buf);
        if len < 4 {
            return Err(Error::ProtocolViolation(format!(
                "BSON document length prefix {len} is smaller than the prefix itself"
            )));
        }

        let mut rest = vec![0u8; len as usize - 4];
        recv.read_exact(&mut rest)
            .await
            .map_err(|e| Error::ReadStream(e.to_string()))?;

        let mut bytes = Vec::with_capacity(len as usize);
        bytes.extend_from_slice(&len_buf);
        bytes.extend_from_slice(&rest);
        Ok(Some(bson::from_slice(&bytes)?))
    }

    async fn receive_loop(
        self: Arc<Self>,
        peer: PeerId,
        inbound_tx: mpsc::Sender<InboundMessage>,
        cancel: CancellationToken,
    ) {
        let mut recv = match self.take_inbound_stream(peer).await {
            Some(recv) => recv,
            None => {
                tracing::warn!(peer = %peer, "no inbound stream registered for receive loop");
                return;
            }
        };

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                read = Self::read_framed_message(&mut recv) => {
                    match read {
                        Ok(Some(message)) => {
                            if inbound_tx
                                .send(InboundMessage { from_stream_peer: peer, message })
                                .await
                                .is_err()
                            {
                                return;
                            }
                        }
                        Ok(None) => return,
                        Err(e) => {
                            tracing::warn!(peer = %peer, error = %e, "protocol violation: malformed message");
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn keepalive_loop(self: Arc<Self>, peer: PeerId, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.keepalive_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = interval.tick() => {
                    let ping = Message::new(peer, 0, crate::domain::ProtocolCode::Command, b"PING".to_vec());
                    if self.send(peer, &ping).await.is_err() {
                        return;
                    }
                }
            }
        }
    }

    pub fn close(&self) {
        self.cancel.cancel();
        self.connection.close(0u32.into(), b"closed");
    }
}

/// Adapter so the handshake's generic `AsyncRead + AsyncWrite` bound can run
/// directly over a QUIC bidi stream pair.
struct BidiStream {
    send: quinn::SendStream,
    recv: quinn::RecvStream,
}

impl tokio::io::AsyncRead for BidiStream {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.recv).poll_read(cx, buf)
    }
}

impl tokio::io::AsyncWrite for BidiStream {
    fn poll_write(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        std::pin::Pin::new(&mut self.send).poll_write(cx, buf)
    }

    fn poll_flush(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.send).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.send).poll_shutdown(cx)
    }
}

// `PeerConnection`'s stream-selection policies need a live quinn `SendStream`
// to construct an `OutboundStream`, which in turn needs a real QUIC
// connection. That harness (two endpoints on ephemeral loopback ports) is
// exactly what `tests/integration/` already sets up, so the behavioral
// coverage for `best_outbound_stream` vs. `best_outbound_stream_legacy_probe`
// — including the divergent case where the sole outbound stream belongs to a
// peer not present in the inbound map — lives there rather than being faked
// here with a connection-less double.
