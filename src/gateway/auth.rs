//! Gateway trust root and handshake verification.
//!
//! The gateway anchors all authentication to a single desktop public key,
//! persisted in a JSON state file. The first desktop to present a valid
//! claim wins the slot; later claims from the same key are idempotent,
//! claims from a different key fail. Devices authenticate with a
//! desktop-signed attestation plus proof of possession of the attested
//! device key.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use ed25519_dalek::VerifyingKey;
use rand::RngCore;
use serde_json::Value;
use thiserror::Error;

use crate::crypto;

/// Structured reasons for every negative handshake outcome. The display
/// string is what goes into the close frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("desktop claim signature invalid")]
    ClaimSignatureInvalid,
    #[error("gateway already claimed by another desktop")]
    AlreadyClaimed,
    #[error("gateway not claimed by desktop yet")]
    NotClaimed,
    #[error("desktop signature invalid")]
    DesktopSignatureInvalid,
    #[error("attestation signature invalid")]
    AttestationSignatureInvalid,
    #[error("attestation blob is not valid JSON")]
    AttestationNotJson,
    #[error("attestation missing {0}")]
    AttestationMissingField(&'static str),
    #[error("attestation expires_at invalid")]
    AttestationExpiryInvalid,
    #[error("attestation expired")]
    AttestationExpired,
    #[error("device nonce signature invalid")]
    DeviceSignatureInvalid,
}

/// Create a random challenge nonce encoded as hex.
pub fn generate_nonce() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Stores the desktop trust root and validates handshake payloads.
///
/// Corrupt or missing state is treated as "unclaimed" so the gateway can
/// always be re-claimed instead of refusing to start.
pub struct AuthStore {
    state_file: PathBuf,
    desktop_key: Option<VerifyingKey>,
}

impl AuthStore {
    /// Open the store, seeding from `state_file` if it exists. An explicit
    /// `desktop_public_key_b64` (operator flag) overrides and persists.
    pub fn open(state_file: PathBuf, desktop_public_key_b64: Option<&str>) -> anyhow::Result<Self> {
        if let Some(parent) = state_file.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut store = Self {
            state_file,
            desktop_key: None,
        };
        store.load_state_if_exists();

        if let Some(key_b64) = desktop_public_key_b64 {
            store.desktop_key = Some(crypto::load_verifying_key_b64(key_b64)?);
            store.save_state();
        }
        Ok(store)
    }

    pub fn is_claimed(&self) -> bool {
        self.desktop_key.is_some()
    }

    pub fn desktop_public_key_b64(&self) -> Option<String> {
        self.desktop_key
            .as_ref()
            .map(|key| crypto::b64_encode(key.as_bytes()))
    }

    /// Verify a desktop-claim payload: proof of possession of the supplied
    /// key. First valid claim persists the trust root; repeat claims from
    /// the same key succeed idempotently.
    pub fn verify_desktop_claim(
        &mut self,
        nonce_hex: &str,
        public_key_b64: &str,
        signature_b64: &str,
    ) -> Result<(), AuthError> {
        let key = crypto::load_verifying_key_b64(public_key_b64)
            .map_err(|_| AuthError::ClaimSignatureInvalid)?;
        verify_nonce(&key, nonce_hex, signature_b64).map_err(|_| AuthError::ClaimSignatureInvalid)?;

        if let Some(current) = &self.desktop_key {
            if current.as_bytes() != key.as_bytes() {
                return Err(AuthError::AlreadyClaimed);
            }
            return Ok(());
        }

        self.desktop_key = Some(key);
        self.save_state();
        Ok(())
    }

    /// Verify a reconnecting desktop against the stored root.
    pub fn verify_desktop_auth(
        &self,
        nonce_hex: &str,
        signature_b64: &str,
    ) -> Result<(), AuthError> {
        let key = self.desktop_key.as_ref().ok_or(AuthError::NotClaimed)?;
        verify_nonce(key, nonce_hex, signature_b64)
            .map_err(|_| AuthError::DesktopSignatureInvalid)
    }

    /// Verify a device: attestation signed by the desktop, blob fields
    /// present, not expired, and nonce signed by the attested device key.
    /// Returns the authenticated device id.
    pub fn verify_device_auth(
        &self,
        nonce_hex: &str,
        attestation_blob: &str,
        desktop_signature_b64: &str,
        nonce_signature_b64: &str,
    ) -> Result<String, AuthError> {
        let root = self.desktop_key.as_ref().ok_or(AuthError::NotClaimed)?;

        if !crypto::verify_b64(root, attestation_blob.as_bytes(), desktop_signature_b64) {
            return Err(AuthError::AttestationSignatureInvalid);
        }

        let blob: Value =
            serde_json::from_str(attestation_blob).map_err(|_| AuthError::AttestationNotJson)?;
        let device_id = required_field(&blob, "device_id")?;
        let device_public_key = required_field(&blob, "device_public_key")?;
        let expires_at = required_field(&blob, "expires_at")?;

        let expiry = DateTime::parse_from_rfc3339(expires_at)
            .map_err(|_| AuthError::AttestationExpiryInvalid)?
            .with_timezone(&Utc);
        if expiry <= Utc::now() {
            return Err(AuthError::AttestationExpired);
        }

        let device_key = crypto::load_verifying_key_b64(device_public_key)
            .map_err(|_| AuthError::DeviceSignatureInvalid)?;
        verify_nonce(&device_key, nonce_hex, nonce_signature_b64)
            .map_err(|_| AuthError::DeviceSignatureInvalid)?;

        Ok(device_id.to_string())
    }

    fn load_state_if_exists(&mut self) {
        let Ok(raw) = std::fs::read_to_string(&self.state_file) else {
            return;
        };
        let parsed: Option<VerifyingKey> = serde_json::from_str::<Value>(&raw)
            .ok()
            .and_then(|payload| {
                payload
                    .get("desktop_public_key")
                    .and_then(Value::as_str)
                    .filter(|s| !s.is_empty())
                    .and_then(|key_b64| crypto::load_verifying_key_b64(key_b64).ok())
            });
        if parsed.is_none() {
            tracing::warn!(
                "trust-root state at {} is corrupt or empty; gateway can be re-claimed",
                self.state_file.display()
            );
        }
        self.desktop_key = parsed;
    }

    fn save_state(&self) {
        let payload = serde_json::json!({
            "desktop_public_key": self.desktop_public_key_b64(),
            "claimed_at": crypto::rfc3339_utc(Utc::now()),
        });
        let raw = serde_json::to_string_pretty(&payload).unwrap_or_default();
        if let Err(err) = std::fs::write(&self.state_file, raw) {
            tracing::error!(
                "failed to persist trust root at {}: {err}",
                self.state_file.display()
            );
        }
    }
}

fn verify_nonce(key: &VerifyingKey, nonce_hex: &str, signature_b64: &str) -> Result<(), ()> {
    let nonce = hex::decode(nonce_hex).map_err(|_| ())?;
    if crypto::verify_b64(key, &nonce, signature_b64) {
        Ok(())
    } else {
        Err(())
    }
}

fn required_field<'a>(blob: &'a Value, field: &'static str) -> Result<&'a str, AuthError> {
    blob.get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or(AuthError::AttestationMissingField(field))
}
