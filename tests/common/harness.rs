//! tests/common/harness.rs
//!
//! A small test harness for spinning up real overlay-hub instances. This
//! module provides the building blocks for integration tests, abstracting
//! away the boilerplate of:
//! - Allocating ephemeral QUIC/signaling ports.
//! - Creating temporary identity/data directories for each hub.
//! - Spawning a hub in the background and tearing it down.
//! - Talking to a hub's signaling port like a local SIP endpoint would.

use anyhow::{Context, Result};
use overlay_hub::{keys::KeyStore, App, Config};
use std::{net::SocketAddr, time::Duration};
use tempfile::TempDir;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

/// A handle to a running hub instance in a test environment.
pub struct TestNode {
    pub config: Config,
    pub peer_id_hex: String,
    pub p2p_addr: SocketAddr,
    pub signaling_addr: SocketAddr,
    shutdown_token: CancellationToken,
    _temp_dir: TempDir,
}

impl TestNode {
    /// Configures and spawns a new hub in a background task, with `bootstrap_peers`
    /// dialed at startup.
    pub async fn spawn(bootstrap_peers: Vec<SocketAddr>) -> Result<Self> {
        let temp_dir = tempfile::tempdir().context("failed to create temp dir")?;
        let identity_dir = temp_dir.path().join("identity");
        let data_dir = temp_dir.path().join("data");

        // Pre-create the identity so we know the peer id before the hub's own
        // App::run calls KeyStore::open against the same directory.
        let keys = KeyStore::open(&identity_dir, None).context("failed to create test identity")?;
        let peer_id_hex = keys.peer_id().to_hex();

        let p2p_addr = get_ephemeral_udp_addr()?;
        let signaling_addr = get_ephemeral_udp_addr()?;

        let config = Config {
            hostname: format!("test-hub-{peer_id_hex}"),
            identity_dir,
            identity_passphrase: None,
            p2p_addr,
            bootstrap_peers,
            start_ttl: 16,
            zero_ttl_propagates: false,
            data_dir,
            directory_endpoint: None,
            ssl_cert_chain_path: None,
            ssl_private_key_path: None,
            keepalive_interval_ms: 2_000,
            hub_dial_timeout_ms: 2_000,
            flush_sweep_interval_ms: 60_000,
            signaling_addr,
        };

        let shutdown_token = CancellationToken::new();
        let app_config = config.clone();
        let app_token = shutdown_token.clone();

        tokio::spawn(async move {
            if let Err(e) = App::new(app_config).expect("failed to create app").run().await {
                if !app_token.is_cancelled() {
                    tracing::error!(error = ?e, "test hub exited with an error");
                }
            }
        });

        // Give the hub time to bind its sockets before any test traffic is sent.
        tokio::time::sleep(Duration::from_millis(100)).await;

        Ok(Self {
            config,
            peer_id_hex,
            p2p_addr,
            signaling_addr,
            shutdown_token,
            _temp_dir: temp_dir,
        })
    }

    pub fn shutdown(&self) {
        self.shutdown_token.cancel();
    }
}

fn get_ephemeral_udp_addr() -> Result<SocketAddr> {
    let socket = std::net::UdpSocket::bind("127.0.0.1:0")?;
    Ok(socket.local_addr()?)
}

/// A stand-in for a local SIP endpoint talking UDP to a hub's signaling port.
pub struct SignalingClient {
    socket: UdpSocket,
    hub_addr: SocketAddr,
}

impl SignalingClient {
    pub async fn connect(hub_addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind("127.0.0.1:0").await?;
        Ok(Self { socket, hub_addr })
    }

    pub async fn send(&self, bytes: &[u8]) -> Result<()> {
        self.socket.send_to(bytes, self.hub_addr).await?;
        Ok(())
    }

    pub async fn recv(&self, timeout: Duration) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; 64 * 1024];
        let (len, _) = tokio::time::timeout(timeout, self.socket.recv_from(&mut buf))
            .await
            .context("timed out waiting for a signaling datagram")??;
        Ok(buf[..len].to_vec())
    }
}

pub fn sip_invite(call_id: &str, from_peer_hex: &str, to_peer_hex: &str) -> Vec<u8> {
    format!(
        "INVITE sip:{to_peer_hex}@overlay SIP/2.0\r\n\
From: \"Test Caller\" <sip:{from_peer_hex}@overlay>\r\n\
To: <sip:{to_peer_hex}@overlay>\r\n\
Call-ID: {call_id}\r\n\
\r\n\
v=0\r\n"
    )
    .into_bytes()
}

pub fn sip_ok_response(call_id: &str, from_peer_hex: &str, to_peer_hex: &str) -> Vec<u8> {
    format!(
        "SIP/2.0 200 OK\r\n\
From: <sip:{from_peer_hex}@overlay>\r\n\
To: <sip:{to_peer_hex}@overlay>\r\n\
Call-ID: {call_id}\r\n\
\r\n"
    )
    .into_bytes()
}

