//! src/transport/mod.rs
//!
//! Owns the QUIC `Endpoint`: the accept loop and the outbound dial helper
//! with the hub-dial timeout. Generalized from the host codebase's
//! telemetry-gossip `Transport` actor to the overlay's per-peer
//! `PeerConnection` model — one endpoint, many `PeerConnection`s, handshake
//! performed per connection rather than trusted at the TLS layer.

pub mod connection;
pub mod handshake;
pub mod tls;

use crate::error::{Error, Result};
use crate::keys::KeyStore;
use connection::PeerConnection;
use quinn::{Endpoint, TokioRuntime};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Outbound hub dial timeout used when `Config::hub_dial_timeout_ms` isn't
/// threaded through a particular call site (historically `HUB_DIAL_TIMEOUT`).
pub const DEFAULT_HUB_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Owns the bound QUIC endpoint for this hub. `Transport` itself performs no
/// routing; it only produces authenticated `PeerConnection`s for the
/// `RoutingEngine` to register.
pub struct Transport {
    endpoint: Endpoint,
    hub_dial_timeout: Duration,
    keepalive_interval: Duration,
}

impl Transport {
    /// `hub_dial_timeout` bounds `connect_to_peer`; `keepalive_interval` is
    /// handed to every `PeerConnection` this endpoint produces (§5, both
    /// overridable via `Config`).
    pub fn bind(
        bind_addr: SocketAddr,
        cert_path: Option<&Path>,
        key_path: Option<&Path>,
        hub_dial_timeout: Duration,
        keepalive_interval: Duration,
    ) -> Result<Self> {
        let (server_config, client_config) = tls::configure_tls(cert_path, key_path)?;

        let socket = Socket::new(Domain::for_address(bind_addr), Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&bind_addr.into())?;
        let std_socket: std::net::UdpSocket = socket.into();
        std_socket.set_nonblocking(true)?;

        let mut endpoint = Endpoint::new(
            Default::default(),
            Some(server_config),
            std_socket,
            Arc::new(TokioRuntime),
        )?;
        endpoint.set_default_client_config(client_config);

        Ok(Self {
            endpoint,
            hub_dial_timeout,
            keepalive_interval,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.endpoint.local_addr()?)
    }

    /// Awaits and accepts the next inbound QUIC connection, completing the
    /// responder side of the PGP handshake over it.
    pub async fn accept(&self, keys: &KeyStore) -> Result<(Arc<PeerConnection>, handshake::HandshakeOutcome)> {
        let incoming = self
            .endpoint
            .accept()
            .await
            .ok_or_else(|| Error::ProtocolViolation("QUIC endpoint closed".into()))?;
        let connection = incoming.await?;
        PeerConnection::accept(connection, keys, self.keepalive_interval).await
    }

    /// Dials `addr` as the initiator, bounded by `hub_dial_timeout`.
    /// Times out to `Error::DialTimeout` so the caller can enqueue instead
    /// of treating this as a hard failure (§4.2 RouteMessage policy).
    pub async fn connect_to_peer(
        &self,
        addr: SocketAddr,
        keys: &KeyStore,
    ) -> Result<(Arc<PeerConnection>, handshake::HandshakeOutcome)> {
        let connecting = self
            .endpoint
            .connect(addr, "localhost")
            .map_err(|e| Error::ConnectFailed(addr, e))?;

        let connection = tokio::time::timeout(self.hub_dial_timeout, connecting)
            .await
            .map_err(|_| Error::DialTimeout(addr))?
            .map_err(|e| Error::ConnectionEstablishFailed(addr, e))?;

        PeerConnection::connect(connection, keys, self.keepalive_interval).await
    }

    pub async fn close(&self) {
        self.endpoint.close(0u32.into(), b"shutdown");
        self.endpoint.wait_idle().await;
    }
}
