//! src/directory.rs
//!
//! Client for the external directory/lookup service: the collaborator that
//! maps a peer's fingerprint to the hub currently responsible for it, used
//! when no local connection or cached entity key answers a `RouteMessage`
//! request. Deliberately a thin HTTP client; this crate has no opinion on
//! how the directory itself is implemented or deployed.

use crate::domain::PeerId;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;

/// What the directory knows about a peer: the hub endpoint currently
/// responsible for routing to it.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct DirectoryEntry {
    pub hub_endpoint: SocketAddr,
}

#[async_trait]
pub trait Directory: Send + Sync {
    /// Resolves `peer` to the hub currently responsible for it, or `None` if
    /// the directory has no record.
    async fn lookup(&self, peer: PeerId) -> Result<Option<DirectoryEntry>>;
}

/// `reqwest`-based client against `GET {base_url}/peers/{hex fingerprint}`,
/// returning `{"hub_endpoint": "host:port"}` on success and 404 when unknown.
pub struct HttpDirectory {
    client: reqwest::Client,
    base_url: String,
}

impl HttpDirectory {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl Directory for HttpDirectory {
    async fn lookup(&self, peer: PeerId) -> Result<Option<DirectoryEntry>> {
        let url = format!("{}/peers/{}", self.base_url.trim_end_matches('/'), peer.to_hex());
        let response = self.client.get(&url).send().await.map_err(Error::Directory)?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let entry = response
            .error_for_status()
            .map_err(Error::Directory)?
            .json::<DirectoryEntry>()
            .await
            .map_err(Error::Directory)?;
        Ok(Some(entry))
    }
}

/// In-memory test double, pre-seeded with a fixed set of entries.
#[derive(Default)]
pub struct StaticDirectory {
    entries: Mutex<HashMap<PeerId, DirectoryEntry>>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, peer: PeerId, hub_endpoint: SocketAddr) {
        self.entries
            .lock()
            .unwrap()
            .insert(peer, DirectoryEntry { hub_endpoint });
    }
}

#[async_trait]
impl Directory for StaticDirectory {
    async fn lookup(&self, peer: PeerId) -> Result<Option<DirectoryEntry>> {
        Ok(self.entries.lock().unwrap().get(&peer).cloned())
    }
}
