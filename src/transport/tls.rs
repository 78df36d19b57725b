//! src/transport/tls.rs
//!
//! Configures TLS for the QUIC transport. Unlike the host codebase's private
//! CA model, peer identity here is established by the PGP challenge-response
//! in `handshake.rs`, not by the certificate presented at the QUIC layer —
//! QUIC TLS exists purely to give the wire transport encryption, the same
//! separation of concerns the `termchat` QUIC transport draws between its
//! TLS layer and its Noise XX handshake. Accordingly the client accepts
//! whatever certificate the server presents; forging a cert buys an attacker
//! nothing, since every message on the wire also has to survive the
//! handshake's key exchange and signature checks.

use crate::error::{Error, Result};
use quinn::{ClientConfig, ServerConfig};
use rustls::client::{ServerCertVerified, ServerCertVerifier};
use std::sync::Arc;
use std::time::SystemTime;
use std::{fs, path::Path};

/// ALPN protocol id negotiated by every overlay-hub endpoint.
pub const ALPN: &[u8] = b"overlayV2";

/// Builds client and server QUIC configs. When `cert_path`/`key_path` are
/// given, the server presents that certificate; otherwise an ephemeral
/// self-signed certificate is generated for the life of the process (the
/// path every test and every hub with no externally issued cert takes).
pub fn configure_tls(
    cert_path: Option<&Path>,
    key_path: Option<&Path>,
) -> Result<(ServerConfig, ClientConfig)> {
    let (cert_der, key_der) = match (cert_path, key_path) {
        (Some(cert_path), Some(key_path)) => {
            let cert = fs::read(cert_path).map_err(|e| {
                Error::TlsConfig(format!("failed to read {}: {e}", cert_path.display()))
            })?;
            let key = fs::read(key_path).map_err(|e| {
                Error::TlsConfig(format!("failed to read {}: {e}", key_path.display()))
            })?;
            (rustls::Certificate(cert), rustls::PrivateKey(key))
        }
        _ => generate_self_signed_cert()?,
    };

    let mut server_config = ServerConfig::with_single_cert(vec![cert_der], key_der)
        .map_err(|e| Error::TlsConfig(format!("failed to build QUIC server config: {e}")))?;
    server_config.alpn_protocols = vec![ALPN.to_vec()];
    let transport_config = Arc::get_mut(&mut server_config.transport).unwrap();
    transport_config.keep_alive_interval(Some(std::time::Duration::from_secs(10)));

    let client_crypto = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
        .with_no_client_auth();
    let mut client_config = ClientConfig::new(Arc::new(client_crypto));
    Arc::get_mut(&mut client_config.transport)
        .unwrap()
        .keep_alive_interval(Some(std::time::Duration::from_secs(10)));

    Ok((server_config, client_config))
}

/// Generates an ephemeral self-signed X.509 certificate, used purely for
/// QUIC transport encryption (see module docs).
fn generate_self_signed_cert() -> Result<(rustls::Certificate, rustls::PrivateKey)> {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".into()])
        .map_err(|e| Error::TlsConfig(format!("self-signed certificate generation failed: {e}")))?;
    let cert_der = rustls::Certificate(
        cert.serialize_der()
            .map_err(|e| Error::TlsConfig(format!("certificate serialization failed: {e}")))?,
    );
    let key_der = rustls::PrivateKey(cert.serialize_private_key_der());
    Ok((cert_der, key_der))
}

/// Accepts any certificate the server presents. Peer authentication is the
/// PGP handshake's job, not this layer's.
struct SkipServerVerification;

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_signed_config_builds_without_configured_paths() {
        let (server, client) = configure_tls(None, None).unwrap();
        assert_eq!(server.alpn_protocols, vec![ALPN.to_vec()]);
        let _ = client;
    }
}
