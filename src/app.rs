//! src/app.rs
//!
//! Defines the main `App` struct, which encapsulates the application's state
//! and manages the lifecycle of all its concurrent services.

use crate::{
    config::Config,
    directory::{Directory, HttpDirectory, StaticDirectory},
    error::Result,
    keys::KeyStore,
    queue::{FileMessageQueue, MessageQueue},
    routing::RoutingEngine,
    signaling::SignalingAdapter,
    transport::Transport,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Encapsulates the entire application, including its configuration and the
/// lifecycle management of its concurrent services.
pub struct App {
    config: Config,
    shutdown_token: CancellationToken,
}

impl App {
    /// Creates a new `App` from the given configuration.
    pub fn new(config: Config) -> Result<Self> {
        Ok(Self {
            config,
            shutdown_token: CancellationToken::new(),
        })
    }

    /// The main run loop for the application.
    ///
    /// This function performs the following steps:
    ///   1. Opens (or generates) the node's PGP identity.
    ///   2. Binds the QUIC transport and the routing engine built on top of it.
    ///   3. Binds the signaling adapter and wires its channel to the engine.
    ///   4. Spawns the QUIC accept loop, the engine's actor loop, and the
    ///      signaling adapter's loop, each as its own Tokio task.
    ///   5. Waits for a shutdown signal (like Ctrl+C) and gracefully
    ///      terminates all tasks.
    pub async fn run(self) -> Result<()> {
        let keys = Arc::new(KeyStore::open(&self.config.identity_dir, self.config.identity_passphrase.clone())?);

        tracing::info!(
            peer_id = %keys.peer_id(),
            p2p_addr = %self.config.p2p_addr,
            "starting overlay hub"
        );

        let directory: Arc<dyn Directory> = match &self.config.directory_endpoint {
            Some(endpoint) => Arc::new(HttpDirectory::new(endpoint.clone())),
            None => Arc::new(StaticDirectory::new()),
        };

        let queue: Arc<dyn MessageQueue> = Arc::new(
            FileMessageQueue::new(self.config.data_dir.join("queue")).await?,
        );

        let transport = Arc::new(Transport::bind(
            self.config.p2p_addr,
            self.config.ssl_cert_chain_path.as_deref(),
            self.config.ssl_private_key_path.as_deref(),
            std::time::Duration::from_millis(self.config.hub_dial_timeout_ms),
            std::time::Duration::from_millis(self.config.keepalive_interval_ms),
        )?);
        tracing::debug!(local_addr = %transport.local_addr()?, "transport bound");

        let engine = RoutingEngine::new(
            keys.peer_id(),
            keys.clone(),
            &self.config,
            directory,
            transport.clone(),
            queue,
        );

        let signaling = SignalingAdapter::bind(self.config.signaling_addr, engine.clone()).await?;
        tracing::debug!(local_addr = %signaling.local_addr()?, "signaling adapter bound");

        let (signaling_tx, signaling_rx) = mpsc::channel(256);
        engine.set_signaling_sender(signaling_tx);

        for addr in &self.config.bootstrap_peers {
            match transport.connect_to_peer(*addr, &keys).await {
                Ok((conn, outcome)) => {
                    tracing::info!(%addr, peer_id = %outcome.remote_id, "connected to bootstrap peer");
                    engine.open_connection(conn, outcome.remote_id).await;
                }
                Err(e) => {
                    tracing::warn!(%addr, error = %e, "failed to dial bootstrap peer");
                }
            }
        }

        // Accept loop: completes the responder side of the handshake on every
        // inbound QUIC connection, then registers it with the engine.
        let accept_task = tokio::spawn(run_accept_loop(
            transport.clone(),
            keys.clone(),
            engine.clone(),
            self.shutdown_token.clone(),
        ));

        let engine_task = tokio::spawn(engine.clone().run(self.shutdown_token.clone()));
        tracing::debug!("routing engine spawned");

        let signaling_task = tokio::spawn(signaling.run(signaling_rx, self.shutdown_token.clone()));
        tracing::debug!("signaling adapter spawned");

        let shutdown_token = self.shutdown_token.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.expect("failed to listen for Ctrl+C");
            tracing::info!("Ctrl+C received, initiating graceful shutdown");
            shutdown_token.cancel();
        });

        self.shutdown_token.cancelled().await;

        if let Err(e) = accept_task.await {
            tracing::error!(error = ?e, "accept loop task failed");
        }
        if let Err(e) = engine_task.await {
            tracing::error!(error = ?e, "routing engine task failed");
        }
        if let Err(e) = signaling_task.await {
            tracing::error!(error = ?e, "signaling adapter task failed");
        }

        transport.close().await;
        tracing::info!("hub has shut down gracefully");

        Ok(())
    }
}

async fn run_accept_loop(
    transport: Arc<Transport>,
    keys: Arc<KeyStore>,
    engine: Arc<RoutingEngine>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = transport.accept(&keys) => {
                match accepted {
                    Ok((conn, outcome)) => {
                        engine.open_connection(conn, outcome.remote_id).await;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to accept inbound connection");
                    }
                }
            }
        }
    }
}
