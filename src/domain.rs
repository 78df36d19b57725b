//! src/domain.rs
//!
//! Consolidates the core data structures of the overlay protocol: the peer
//! identifier, the wire message envelope, and the signed cookie that binds an
//! identifier to its public key and role. This is the single source of truth
//! for the application's domain model, the way the host codebase keeps its
//! model and identity concepts in one place rather than scattered across the
//! crate.

use bson::{spec::BinarySubtype, Binary};
use serde::{Deserialize, Serialize};
use std::{cmp::Ordering, fmt};

/// Number of bytes in a peer fingerprint (SHA-1 digest of a PGP public key).
pub const PEER_ID_LEN: usize = 20;

/// Opaque 20-byte identifier derived from the SHA-1 fingerprint of a PGP public
/// key. Two `PeerId`s are equal iff they were derived from the same key.
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct PeerId([u8; PEER_ID_LEN]);

impl PeerId {
    pub fn from_bytes(bytes: [u8; PEER_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Builds a `PeerId` from a fingerprint slice of arbitrary-but-matching
    /// length, as returned by the PGP library. Returns `None` if the slice is
    /// not exactly `PEER_ID_LEN` bytes (e.g. a v5 fingerprint).
    pub fn from_fingerprint(fingerprint: &[u8]) -> Option<Self> {
        let bytes: [u8; PEER_ID_LEN] = fingerprint.try_into().ok()?;
        Some(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; PEER_ID_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        Self::from_fingerprint(&bytes)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.to_hex())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl PartialOrd for PeerId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PeerId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

// `PeerId` is carried on the wire and as map keys as its lowercase hex string
// form, per the spec's string-codec invariant.
impl Serialize for PeerId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        PeerId::from_hex(&s).ok_or_else(|| serde::de::Error::custom("invalid peer id hex string"))
    }
}

/// The protocol-level classification of a `Message`, used to dispatch it to
/// the right local handler once it reaches its recipient.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolCode {
    /// Reserved for keepalive pings and session control; unknown commands are
    /// accepted and ignored.
    Command,
    /// Carries a serialized, signed `Cookie`.
    Entity,
    /// Carries an end-to-end encrypted application payload (here, SIP bytes).
    Application,
}

/// A framed record forwarded hub-to-hub. Immutable: forwarding produces a new
/// `Message` with a decremented `ttl`, never a mutation of this one.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub recipient: PeerId,
    pub ttl: i32,
    pub code: ProtocolCode,
    pub payload: Binary,
}

impl Message {
    pub fn new(recipient: PeerId, ttl: i32, code: ProtocolCode, payload: Vec<u8>) -> Self {
        Self {
            recipient,
            ttl,
            code,
            payload: Binary {
                subtype: BinarySubtype::Generic,
                bytes: payload,
            },
        }
    }

    pub fn payload_bytes(&self) -> &[u8] {
        &self.payload.bytes
    }

    /// Produces the message that should be sent to the next hop: a new value
    /// with `ttl' = ttl - 1`. Does not itself decide whether forwarding should
    /// happen; callers apply the TTL-rewrite policy first (see `RoutingEngine`).
    pub fn forwarded(&self) -> Self {
        Self {
            recipient: self.recipient,
            ttl: self.ttl - 1,
            code: self.code,
            payload: self.payload.clone(),
        }
    }

    /// Rewrites `ttl` to `start_ttl` and returns a new message, per the
    /// `ttl < 0` normalization rule. Pure; performs no routing itself.
    pub fn with_ttl(&self, ttl: i32) -> Self {
        Self {
            recipient: self.recipient,
            ttl,
            code: self.code,
            payload: self.payload.clone(),
        }
    }
}

/// The role-specific metadata carried in a `Cookie`. Deserialized via an
/// internally-tagged enum rather than ad-hoc runtime type inspection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum CookieBody {
    /// A hub: a peer whose role is routing traffic on behalf of others.
    Hub {
        hostname: String,
        directory_uri: String,
        service_uri: String,
        owners: Vec<PeerId>,
    },
    /// A leaf peer that owns one or more `Node`s.
    User { owned_nodes: Vec<PeerId> },
    /// A leaf peer, tracked by whichever hub last saw it directly connected.
    Node { most_recently_seen_by: PeerId },
}

/// A signed identity capsule binding a `PeerId` to its public key and role.
/// `key` must equal `fingerprint(public_key_blob)` and `signature` must verify
/// under `public_key_blob` over the serialized `body`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Cookie {
    pub key: PeerId,
    pub public_key_blob: Binary,
    pub body: CookieBody,
    pub signature: Binary,
}

impl Cookie {
    pub fn is_hub(&self) -> bool {
        matches!(self.body, CookieBody::Hub { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_round_trips_through_hex() {
        let bytes: [u8; PEER_ID_LEN] = [7u8; PEER_ID_LEN];
        let id = PeerId::from_bytes(bytes);
        let hex = id.to_hex();
        assert_eq!(hex.len(), PEER_ID_LEN * 2);
        assert_eq!(PeerId::from_hex(&hex), Some(id));
    }

    #[test]
    fn peer_id_equality_is_byte_equality() {
        let a = PeerId::from_bytes([1u8; PEER_ID_LEN]);
        let b = PeerId::from_bytes([1u8; PEER_ID_LEN]);
        let c = PeerId::from_bytes([2u8; PEER_ID_LEN]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn peer_id_rejects_wrong_length_fingerprints() {
        assert!(PeerId::from_fingerprint(&[0u8; 16]).is_none());
        assert!(PeerId::from_fingerprint(&[0u8; PEER_ID_LEN]).is_some());
    }

    #[test]
    fn message_forwarded_decrements_ttl_and_preserves_fields() {
        let id = PeerId::from_bytes([9u8; PEER_ID_LEN]);
        let m = Message::new(id, 5, ProtocolCode::Application, vec![1, 2, 3]);
        let fwd = m.forwarded();
        assert_eq!(fwd.ttl, 4);
        assert_eq!(fwd.recipient, m.recipient);
        assert_eq!(fwd.code, m.code);
        assert_eq!(fwd.payload_bytes(), m.payload_bytes());
    }

    #[test]
    fn message_with_ttl_rewrite_touches_only_ttl() {
        let id = PeerId::from_bytes([3u8; PEER_ID_LEN]);
        let m = Message::new(id, -1, ProtocolCode::Command, vec![]);
        let rewritten = m.with_ttl(99);
        assert_eq!(rewritten.ttl, 99);
        assert_eq!(rewritten.recipient, m.recipient);
        assert_eq!(rewritten.payload_bytes(), m.payload_bytes());
    }

    #[test]
    fn message_bson_round_trip() {
        let id = PeerId::from_bytes([4u8; PEER_ID_LEN]);
        let m = Message::new(id, 12, ProtocolCode::Entity, b"hello".to_vec());
        let bytes = bson::to_vec(&m).unwrap();
        let decoded: Message = bson::from_slice(&bytes).unwrap();
        assert_eq!(decoded, m);
    }

    #[test]
    fn cookie_body_tag_round_trips() {
        let id = PeerId::from_bytes([5u8; PEER_ID_LEN]);
        let body = CookieBody::Node {
            most_recently_seen_by: id,
        };
        let json = serde_json::to_string(&body).unwrap();
        let back: CookieBody = serde_json::from_str(&json).unwrap();
        assert_eq!(back, body);
    }
}
