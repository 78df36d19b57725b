//! src/signaling.rs
//!
//! `SignalingAdapter`: bridges a local UDP SIP transport (loopback:5060) to
//! encrypted `Application` messages carried over the overlay (§4.4). Treats
//! SIP as an opaque byte blob except for the three headers needed to route:
//! `From`, `To`, `Call-ID` (§4.4 "minimal, non-conformant parser"). No SIP
//! library dependency — the host codebase's pack carries none, and the spec
//! explicitly scopes out SIP protocol semantics themselves.

use crate::domain::PeerId;
use crate::error::{Error, Result};
use crate::routing::{InboundApplicationMessage, RoutingEngine};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

const MAX_DATAGRAM: usize = 64 * 1024;

/// Host substituted into an inbound request's `From` URI before it is
/// delivered locally (§4.3: "rewrite the From URI host to a sentinel
/// value"), so the local endpoint never sees (and cannot leak back out
/// to a raw socket) the originating peer's real transport address.
const SENTINEL_HOST: &str = "overlay.invalid";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SipKind {
    Request,
    Response,
}

/// The subset of a SIP message this adapter cares about: the three routing
/// headers plus the raw bytes, which are otherwise passed through unchanged.
struct SipMessage {
    kind: SipKind,
    from_user: Option<String>,
    to_user: Option<String>,
    call_id: Option<String>,
    raw: Vec<u8>,
}

fn parse_sip(bytes: &[u8]) -> Result<SipMessage> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| Error::SignalingParseFailure(format!("not valid ASCII/UTF-8: {e}")))?;
    let mut lines = text.split("\r\n").flat_map(|l| l.split('\n'));

    let first_line = lines
        .next()
        .ok_or_else(|| Error::SignalingParseFailure("empty message".into()))?;
    let kind = if first_line.starts_with("SIP/2.0") {
        SipKind::Response
    } else {
        SipKind::Request
    };

    let mut from_user = None;
    let mut to_user = None;
    let mut call_id = None;

    for line in lines {
        if line.is_empty() {
            break;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        let value = value.trim();
        if name.eq_ignore_ascii_case("from") || name.eq_ignore_ascii_case("f") {
            from_user = extract_uri_user(value);
        } else if name.eq_ignore_ascii_case("to") || name.eq_ignore_ascii_case("t") {
            to_user = extract_uri_user(value);
        } else if name.eq_ignore_ascii_case("call-id") || name.eq_ignore_ascii_case("i") {
            call_id = Some(value.to_string());
        }
    }

    Ok(SipMessage {
        kind,
        from_user,
        to_user,
        call_id,
        raw: bytes.to_vec(),
    })
}

/// Extracts `user` from a header value shaped like `"Display Name"
/// <sip:user@host>` or bare `sip:user@host`.
fn extract_uri_user(value: &str) -> Option<String> {
    let after_scheme = value.split("sip:").nth(1)?;
    let user_end = after_scheme
        .find(|c| c == '@' || c == '>' || c == ';' || c == ' ')
        .unwrap_or(after_scheme.len());
    let user = &after_scheme[..user_end];
    if user.is_empty() {
        None
    } else {
        Some(user.to_string())
    }
}

/// Rewrites the first `sip:user@host` occurrence following `From:` so its
/// host becomes `SENTINEL_HOST`, leaving everything else byte-for-byte
/// unchanged.
fn rewrite_from_host(raw: &[u8]) -> Vec<u8> {
    let Ok(text) = std::str::from_utf8(raw) else {
        return raw.to_vec();
    };
    let mut out = String::with_capacity(text.len());
    for (i, line) in text.split_inclusive('\n').enumerate() {
        if i == 0 {
            out.push_str(line);
            continue;
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if let Some((name, value)) = trimmed.split_once(':') {
            if name.trim().eq_ignore_ascii_case("from") || name.trim().eq_ignore_ascii_case("f") {
                if let Some(rewritten) = rewrite_host_in_value(value) {
                    out.push_str(name);
                    out.push(':');
                    out.push_str(&rewritten);
                    out.push_str(&line[trimmed.len()..]);
                    continue;
                }
            }
        }
        out.push_str(line);
    }
    out.into_bytes()
}

fn rewrite_host_in_value(value: &str) -> Option<String> {
    let sip_at = value.find("sip:")?;
    let after_sip = &value[sip_at + 4..];
    let at_pos = after_sip.find('@')?;
    let host_start = sip_at + 4 + at_pos + 1;
    let host_end = value[host_start..]
        .find(|c| c == '>' || c == ';' || c == ' ')
        .map(|i| host_start + i)
        .unwrap_or(value.len());
    Some(format!("{}{}{}", &value[..host_start], SENTINEL_HOST, &value[host_end..]))
}

/// Bridges one `RoutingEngine` to a UDP socket bound to `signaling_addr`.
pub struct SignalingAdapter {
    engine: Arc<RoutingEngine>,
    socket: Arc<UdpSocket>,
    /// The most recent local client address to talk to us, used as the
    /// delivery target for inbound application payloads. `None` until the
    /// local endpoint has sent at least one datagram.
    last_local_addr: Mutex<Option<SocketAddr>>,
}

impl SignalingAdapter {
    pub async fn bind(bind_addr: SocketAddr, engine: Arc<RoutingEngine>) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(bind_addr).await?;
        Ok(Arc::new(Self {
            engine,
            socket: Arc::new(socket),
            last_local_addr: Mutex::new(None),
        }))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Drives both directions: local UDP datagrams in (outbound to the
    /// overlay) and decrypted Application payloads in (inbound, delivered
    /// locally), until `shutdown` fires.
    pub async fn run(
        self: Arc<Self>,
        mut inbound_rx: mpsc::Receiver<InboundApplicationMessage>,
        shutdown: CancellationToken,
    ) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("signaling adapter received shutdown signal");
                    break;
                }
                received = self.socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, addr)) => self.handle_local_datagram(&buf[..len], addr).await,
                        Err(e) => tracing::warn!(error = %e, "failed to read local signaling datagram"),
                    }
                }
                maybe_inbound = inbound_rx.recv() => {
                    match maybe_inbound {
                        Some(inbound) => self.handle_inbound_application(inbound).await,
                        None => break,
                    }
                }
            }
        }
    }

    async fn handle_local_datagram(&self, bytes: &[u8], addr: SocketAddr) {
        *self.last_local_addr.lock().await = Some(addr);

        let message = match parse_sip(bytes) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(error = %e, "dropping unparseable local signaling datagram");
                return;
            }
        };

        let recipient = match message.kind {
            SipKind::Request => message.to_user.as_deref().and_then(PeerId::from_hex),
            SipKind::Response => message
                .call_id
                .as_deref()
                .and_then(|id| self.engine.lookup_caller(id)),
        };

        let Some(recipient) = recipient else {
            tracing::warn!("could not resolve a recipient for outbound signaling datagram, dropping");
            return;
        };

        if let Err(e) = self.engine.submit_application_message(recipient, &message.raw).await {
            tracing::warn!(error = %e, "failed to submit outbound signaling message");
        }
    }

    async fn handle_inbound_application(&self, inbound: InboundApplicationMessage) {
        let message = match parse_sip(&inbound.plaintext) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(error = %e, "dropping unparseable inbound signaling payload");
                return;
            }
        };

        let delivered = if message.kind == SipKind::Request {
            if let (Some(call_id), Some(from_user)) = (&message.call_id, &message.from_user) {
                if let Some(peer) = PeerId::from_hex(from_user) {
                    self.engine.record_caller(call_id.clone(), peer);
                }
            }
            rewrite_from_host(&message.raw)
        } else {
            message.raw
        };

        let Some(target) = *self.last_local_addr.lock().await else {
            tracing::warn!("no local signaling endpoint has registered yet, dropping inbound message");
            return;
        };
        if let Err(e) = self.socket.send_to(&delivered, target).await {
            tracing::warn!(error = %e, "failed to deliver inbound signaling payload locally");
        }
    }
}
