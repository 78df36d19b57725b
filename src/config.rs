//! src/config.rs
//!
//! Defines the strongly-typed `Config` struct for all runtime parameters,
//! loaded from files and environment variables via `figment`.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

/// Top-level struct holding all application configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Identity string advertised in our own Hub cookie.
    pub hostname: String,
    /// Directory holding `public.asc`/`private.asc`; generated on first run.
    pub identity_dir: PathBuf,
    /// Passphrase protecting the PGP private key, if any.
    pub identity_passphrase: Option<String>,
    /// Local QUIC listen address.
    pub p2p_addr: SocketAddr,
    /// Initial hub addresses to dial at startup.
    pub bootstrap_peers: Vec<SocketAddr>,
    /// TTL applied to synthetic messages and on `ttl < 0` normalization.
    pub start_ttl: i32,
    /// Resolves the TTL==0 open question (SPEC_FULL §4.2): when `true`, a hub
    /// forwards a message once more at `ttl == 0` before it would stop.
    pub zero_ttl_propagates: bool,
    /// Root directory for the on-disk message queue.
    pub data_dir: PathBuf,
    /// Base URL of the external directory/DHT lookup service.
    pub directory_endpoint: Option<String>,
    /// QUIC server TLS credentials; when absent, a self-signed certificate is
    /// generated for the lifetime of the process (useful for tests).
    pub ssl_cert_chain_path: Option<PathBuf>,
    pub ssl_private_key_path: Option<PathBuf>,
    /// Timing knobs, overriding the hardcoded defaults from SPEC_FULL §5.
    pub keepalive_interval_ms: u64,
    pub hub_dial_timeout_ms: u64,
    pub flush_sweep_interval_ms: u64,
    /// Local loopback address the signaling adapter binds its UDP socket to.
    pub signaling_addr: SocketAddr,
}

impl Config {
    /// Loads configuration from `config.toml` and environment variables.
    /// It uses the `Default` implementation as a base layer.
    pub fn load() -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file("config.toml"))
            .merge(Env::prefixed("OVERLAY_"))
            .extract()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hostname: "overlay-hub".to_string(),
            identity_dir: PathBuf::from("identity"),
            identity_passphrase: None,
            p2p_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 4433),
            bootstrap_peers: Vec::new(),
            start_ttl: 99,
            zero_ttl_propagates: false,
            data_dir: PathBuf::from("data"),
            directory_endpoint: None,
            ssl_cert_chain_path: None,
            ssl_private_key_path: None,
            keepalive_interval_ms: 5_000,
            hub_dial_timeout_ms: 5_000,
            flush_sweep_interval_ms: 60_000,
            signaling_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 5060),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    fn test_config() -> Config {
        Config {
            hostname: "test-hub".into(),
            identity_dir: PathBuf::from("test-identity"),
            identity_passphrase: None,
            p2p_addr: "127.0.0.1:1234".parse().unwrap(),
            bootstrap_peers: vec!["127.0.0.1:5678".parse().unwrap()],
            start_ttl: 32,
            zero_ttl_propagates: true,
            data_dir: PathBuf::from("test-data"),
            directory_endpoint: Some("http://directory.local".into()),
            ssl_cert_chain_path: None,
            ssl_private_key_path: None,
            keepalive_interval_ms: 1000,
            hub_dial_timeout_ms: 2000,
            flush_sweep_interval_ms: 3000,
            signaling_addr: "127.0.0.1:5060".parse().unwrap(),
        }
    }

    #[test]
    fn test_loading_from_file() {
        Jail::expect_with(|jail| {
            let config_content = r#"
                hostname = "test-hub"
                identity_dir = "test-identity"
                p2p_addr = "127.0.0.1:1234"
                bootstrap_peers = ["127.0.0.1:5678"]
                start_ttl = 32
                zero_ttl_propagates = true
                data_dir = "test-data"
                directory_endpoint = "http://directory.local"
                keepalive_interval_ms = 1000
                hub_dial_timeout_ms = 2000
                flush_sweep_interval_ms = 3000
                signaling_addr = "127.0.0.1:5060"
            "#;
            jail.create_file("config.toml", config_content)?;

            let config = Config::load()?;
            assert_eq!(config, test_config());
            Ok(())
        });
    }

    #[test]
    fn test_env_overrides_file() {
        Jail::expect_with(|jail| {
            let config_content = r#"p2p_addr = "1.1.1.1:1111""#;
            jail.create_file("config.toml", config_content)?;
            jail.set_env("OVERLAY_P2P_ADDR", "127.0.0.1:9999");
            let config = Config::load()?;
            assert_eq!(config.p2p_addr, "127.0.0.1:9999".parse().unwrap());
            Ok(())
        });
    }

    #[test]
    fn test_defaults_start_ttl_is_99() {
        assert_eq!(Config::default().start_ttl, 99);
        assert!(!Config::default().zero_ttl_propagates);
    }
}
