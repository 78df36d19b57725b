//! src/keys.rs
//!
//! The on-disk PGP key accessor. Loads this node's keypair from
//! `public.asc`/`private.asc` under a configured directory, generating a fresh
//! keypair on first run, the same way the host codebase's `Identity::from_file`
//! lazily creates an identity key the first time it is asked for one —
//! generalized here from a single ed25519 secret to an armored PGP keypair.
//!
//! This module is also where every direct call into the `pgp` crate lives:
//! fingerprinting, detached signing/verification, and encrypt-then-sign /
//! decrypt-then-verify of application payloads. Everything else in the crate
//! goes through the small interface below instead of touching `pgp::*`
//! directly.

use crate::domain::PeerId;
use crate::error::{Error, Result};
use pgp::composed::{
    Deserializable, KeyType, SecretKeyParamsBuilder, SignedPublicKey, SignedSecretKey,
};
use pgp::crypto::hash::HashAlgorithm;
use pgp::crypto::sym::SymmetricKeyAlgorithm;
use pgp::types::{KeyTrait, SecretKeyTrait};
use pgp::Message as PgpMessage;
use std::path::{Path, PathBuf};
use std::{fs, io};

const ARMORED_PUBLIC_FILE: &str = "public.asc";
const ARMORED_PRIVATE_FILE: &str = "private.asc";

/// A remote peer's public key material, obtained either from a `KeyStore`
/// read on disk or from a parsed `Cookie`/handshake exchange.
#[derive(Clone)]
pub struct PublicKeyMaterial {
    pub key: SignedPublicKey,
}

impl PublicKeyMaterial {
    pub fn peer_id(&self) -> PeerId {
        fingerprint_to_peer_id(&self.key.fingerprint())
    }

    pub fn to_armored_bytes(&self) -> Result<Vec<u8>> {
        Ok(self.key.to_armored_bytes(None)?)
    }

    pub fn from_armored(bytes: &[u8]) -> Result<Self> {
        let (key, _headers) = SignedPublicKey::from_armor_single(io::Cursor::new(bytes))
            .map_err(|e| Error::HandshakeFailure(format!("malformed public key block: {e}")))?;
        Ok(Self { key })
    }

    /// Raw (non-armored) packet bytes, as embedded in a `Cookie`.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        use pgp::ser::Serialize;
        Ok(self.key.to_bytes()?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let key = SignedPublicKey::from_bytes(io::Cursor::new(bytes))
            .map_err(|e| Error::HandshakeFailure(format!("malformed public key blob: {e}")))?;
        Ok(Self { key })
    }
}

fn fingerprint_to_peer_id(fingerprint: &[u8]) -> PeerId {
    // v4 PGP fingerprints are SHA-1 and therefore already PEER_ID_LEN bytes;
    // this is the binding invariant the spec requires (`key == fingerprint(blob)`).
    PeerId::from_fingerprint(fingerprint)
        .expect("PGP v4 fingerprints are 20 bytes, matching PEER_ID_LEN")
}

/// This node's own PGP identity: keypair plus the derived `PeerId`.
pub struct KeyStore {
    secret_key: SignedSecretKey,
    public_key: SignedPublicKey,
    peer_id: PeerId,
    passphrase: String,
}

impl KeyStore {
    /// Loads the keypair from `dir`, generating and persisting a fresh one on
    /// first run (mirrors `Identity::from_file`'s create-on-`NotFound` idiom).
    pub fn open(dir: &Path, passphrase: Option<String>) -> Result<Self> {
        let passphrase = passphrase.unwrap_or_default();
        let public_path = dir.join(ARMORED_PUBLIC_FILE);
        let private_path = dir.join(ARMORED_PRIVATE_FILE);

        match (fs::read(&private_path), fs::read(&public_path)) {
            (Ok(priv_bytes), Ok(pub_bytes)) => {
                let (secret_key, _) =
                    SignedSecretKey::from_armor_single(io::Cursor::new(priv_bytes))
                        .map_err(|_| Error::InvalidKeyFile)?;
                let (public_key, _) =
                    SignedPublicKey::from_armor_single(io::Cursor::new(pub_bytes))
                        .map_err(|_| Error::InvalidKeyFile)?;
                let peer_id = fingerprint_to_peer_id(&public_key.fingerprint());
                Ok(Self {
                    secret_key,
                    public_key,
                    peer_id,
                    passphrase,
                })
            }
            (Err(e), _) | (_, Err(e)) if e.kind() == io::ErrorKind::NotFound => {
                let store = Self::generate(passphrase)?;
                fs::create_dir_all(dir)?;
                fs::write(&private_path, store.secret_key.to_armored_bytes(None)?)?;
                fs::write(&public_path, store.public_key.to_armored_bytes(None)?)?;
                Ok(store)
            }
            (Err(e), _) => Err(e.into()),
            (_, Err(e)) => Err(e.into()),
        }
    }

    fn generate(passphrase: String) -> Result<Self> {
        let mut builder = SecretKeyParamsBuilder::default();
        builder
            .key_type(KeyType::EdDSA)
            .can_create_certificates(true)
            .can_sign(true)
            .can_encrypt(true)
            .primary_user_id("overlay-hub node <node@overlay.local>".into());
        let params = builder
            .build()
            .map_err(|e| Error::TlsConfig(format!("failed to build PGP key params: {e}")))?;

        let passphrase_for_gen = passphrase.clone();
        let secret_key_unsigned = params
            .generate()
            .map_err(|e| Error::TlsConfig(format!("PGP key generation failed: {e}")))?;
        let secret_key = secret_key_unsigned
            .sign(|| passphrase_for_gen.clone())
            .map_err(Error::Pgp)?;
        let public_key = secret_key.public_key().sign(&secret_key, || passphrase.clone())?;

        let peer_id = fingerprint_to_peer_id(&public_key.fingerprint());
        Ok(Self {
            secret_key,
            public_key,
            peer_id,
            passphrase,
        })
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn public_key_material(&self) -> PublicKeyMaterial {
        PublicKeyMaterial {
            key: self.public_key.clone(),
        }
    }

    /// Detached signature over arbitrary bytes (used for `Cookie::signature`).
    pub fn sign_detached(&self, data: &[u8]) -> Result<Vec<u8>> {
        let signature = self
            .secret_key
            .create_signature(|| self.passphrase.clone(), HashAlgorithm::SHA2_256, data)
            .map_err(Error::Pgp)?;
        Ok(signature)
    }

    /// Verifies a detached signature made by `sign_detached` under `public_key`.
    pub fn verify_detached(
        public_key: &PublicKeyMaterial,
        data: &[u8],
        signature: &[u8],
    ) -> Result<()> {
        public_key
            .key
            .verify_signature(HashAlgorithm::SHA2_256, data, signature)
            .map_err(|e| Error::HandshakeFailure(format!("signature verification failed: {e}")))
    }

    /// Encrypts `data` to `recipient` and signs the plaintext under our own
    /// key, producing an armored `-----BEGIN PGP MESSAGE-----` block.
    pub fn encrypt_and_sign(&self, recipient: &PublicKeyMaterial, data: &[u8]) -> Result<Vec<u8>> {
        let literal = PgpMessage::new_literal_bytes("", data);
        let signed = literal
            .sign(&self.secret_key, || self.passphrase.clone(), HashAlgorithm::SHA2_256)
            .map_err(Error::Pgp)?;
        let mut rng = rand::rngs::OsRng;
        let encrypted = signed
            .encrypt_to_keys(&mut rng, SymmetricKeyAlgorithm::AES256, &[&recipient.key])
            .map_err(Error::Pgp)?;
        Ok(encrypted.to_armored_bytes(None)?)
    }

    /// Decrypts an armored `PGP MESSAGE` block produced by `encrypt_and_sign`
    /// and verifies its embedded signature was made by `sender`.
    pub fn decrypt_and_verify(&self, armored: &[u8], sender: &PublicKeyMaterial) -> Result<Vec<u8>> {
        let (message, _headers) = PgpMessage::from_armor_single(io::Cursor::new(armored))
            .map_err(|e| Error::DecryptionFailure(format!("malformed PGP message: {e}")))?;
        let (decrypted, _) = message
            .decrypt(|| self.passphrase.clone(), &[&self.secret_key])
            .map_err(|e| Error::DecryptionFailure(format!("decryption failed: {e}")))?;
        decrypted
            .verify(&sender.key)
            .map_err(|e| Error::DecryptionFailure(format!("signature verification failed: {e}")))?;
        decrypted
            .get_content()
            .map_err(|e| Error::DecryptionFailure(format!("malformed plaintext: {e}")))?
            .ok_or_else(|| Error::DecryptionFailure("empty plaintext".into()))
    }

    /// Decrypts an armored `PGP MESSAGE` block without verifying its embedded
    /// signature against any particular key. Used for inbound Application
    /// payloads, where the claimed sender is only known by reading the
    /// plaintext itself (the SIP `From` header) — there is nothing to verify
    /// against until after this call returns. Callers that can determine a
    /// sender ahead of time should prefer `decrypt_and_verify`.
    pub fn decrypt_unverified(&self, armored: &[u8]) -> Result<Vec<u8>> {
        let (message, _headers) = PgpMessage::from_armor_single(io::Cursor::new(armored))
            .map_err(|e| Error::DecryptionFailure(format!("malformed PGP message: {e}")))?;
        let (decrypted, _) = message
            .decrypt(|| self.passphrase.clone(), &[&self.secret_key])
            .map_err(|e| Error::DecryptionFailure(format!("decryption failed: {e}")))?;
        decrypted
            .get_content()
            .map_err(|e| Error::DecryptionFailure(format!("malformed plaintext: {e}")))?
            .ok_or_else(|| Error::DecryptionFailure("empty plaintext".into()))
    }

    /// Encrypts-and-signs a fixed-size nonce for the handshake challenge.
    pub fn challenge_nonce(&self, recipient: &PublicKeyMaterial, nonce: &[u8]) -> Result<Vec<u8>> {
        self.encrypt_and_sign(recipient, nonce)
    }
}

pub fn default_identity_dir() -> PathBuf {
    PathBuf::from("identity")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn keystore_creates_and_reloads_identity() {
        let dir = tempdir().unwrap();
        assert!(!dir.path().join(ARMORED_PUBLIC_FILE).exists());

        let first = KeyStore::open(dir.path(), None).unwrap();
        assert!(dir.path().join(ARMORED_PUBLIC_FILE).exists());
        assert!(dir.path().join(ARMORED_PRIVATE_FILE).exists());

        let second = KeyStore::open(dir.path(), None).unwrap();
        assert_eq!(first.peer_id(), second.peer_id());
    }

    #[test]
    fn detached_signature_round_trips() {
        let dir = tempdir().unwrap();
        let store = KeyStore::open(dir.path(), None).unwrap();
        let data = b"cookie body bytes";
        let sig = store.sign_detached(data).unwrap();
        let public = store.public_key_material();
        assert!(KeyStore::verify_detached(&public, data, &sig).is_ok());
    }

    #[test]
    fn detached_signature_rejects_tampered_data() {
        let dir = tempdir().unwrap();
        let store = KeyStore::open(dir.path(), None).unwrap();
        let sig = store.sign_detached(b"original").unwrap();
        let public = store.public_key_material();
        assert!(KeyStore::verify_detached(&public, b"tampered", &sig).is_err());
    }

    #[test]
    fn encrypt_and_decrypt_round_trip() {
        let dir_a = tempdir().unwrap();
        let dir_b = tempdir().unwrap();
        let alice = KeyStore::open(dir_a.path(), None).unwrap();
        let bob = KeyStore::open(dir_b.path(), None).unwrap();

        let bob_public = bob.public_key_material();
        let ciphertext = alice.encrypt_and_sign(&bob_public, b"hello bob").unwrap();

        let alice_public = alice.public_key_material();
        let plaintext = bob.decrypt_and_verify(&ciphertext, &alice_public).unwrap();
        assert_eq!(plaintext, b"hello bob");
    }

    #[test]
    fn decrypt_unverified_recovers_plaintext_without_a_sender_key() {
        let dir_a = tempdir().unwrap();
        let dir_b = tempdir().unwrap();
        let alice = KeyStore::open(dir_a.path(), None).unwrap();
        let bob = KeyStore::open(dir_b.path(), None).unwrap();

        let ciphertext = alice
            .encrypt_and_sign(&bob.public_key_material(), b"sip bytes")
            .unwrap();
        let plaintext = bob.decrypt_unverified(&ciphertext).unwrap();
        assert_eq!(plaintext, b"sip bytes");
    }
}
