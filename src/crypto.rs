//! Ed25519 helpers for the desktop identity and device attestations.
//!
//! The hub's master key is the trust root for the whole system: it claims
//! the gateway, authenticates reconnections by signing nonces, and signs
//! the attestations that let paired mobile devices authenticate on their
//! own. Attestation blobs are canonical JSON (sorted keys, compact
//! separators) so the gateway can verify the exact bytes it receives.

use std::path::Path;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, SecondsFormat, Utc};
use ed25519_dalek::pkcs8::{DecodePrivateKey, EncodePrivateKey};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

pub const MASTER_KEY_FILE: &str = "master_key.pem";

/// A signed assertion binding a device public key to a device id,
/// time-bounded and verified by the gateway against the desktop key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attestation {
    /// Canonical JSON: `device_id`, `device_public_key`, `issued_at`,
    /// `expires_at`, sorted keys, no whitespace.
    pub blob: String,
    /// base64 Ed25519 signature over the literal blob bytes.
    pub desktop_signature: String,
}

pub fn b64_encode(data: &[u8]) -> String {
    BASE64.encode(data)
}

pub fn b64_decode(data: &str) -> Result<Vec<u8>> {
    BASE64.decode(data).context("invalid base64")
}

/// RFC-3339 UTC with a `Z` suffix, the one timestamp format on the wire.
pub fn rfc3339_utc(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn generate_signing_key() -> SigningKey {
    SigningKey::generate(&mut OsRng)
}

/// Load the desktop master key, creating and persisting one on first boot.
///
/// The key is stored as unencrypted PKCS#8 PEM with `0o600` permissions
/// where the OS supports them.
pub fn load_or_create_master_key(app_dir: &Path, filename: &str) -> Result<SigningKey> {
    std::fs::create_dir_all(app_dir)
        .with_context(|| format!("failed to create {}", app_dir.display()))?;
    let key_path = app_dir.join(filename);
    if key_path.exists() {
        let pem = std::fs::read_to_string(&key_path)
            .with_context(|| format!("failed to read {}", key_path.display()))?;
        return SigningKey::from_pkcs8_pem(&pem)
            .with_context(|| format!("invalid master key at {}", key_path.display()));
    }

    let key = generate_signing_key();
    let pem = key
        .to_pkcs8_pem(Default::default())
        .context("failed to encode master key")?;
    std::fs::write(&key_path, pem.as_bytes())
        .with_context(|| format!("failed to write {}", key_path.display()))?;
    restrict_permissions(&key_path);
    Ok(key)
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) {
    // Windows has no POSIX mode bits; the key inherits the profile ACL.
}

/// Public half of a signing key, base64 over the raw 32 bytes.
pub fn public_key_b64(key: &SigningKey) -> String {
    b64_encode(key.verifying_key().as_bytes())
}

/// Load an Ed25519 public key from base64 raw bytes.
pub fn load_verifying_key_b64(public_key_b64: &str) -> Result<VerifyingKey> {
    let raw = b64_decode(public_key_b64)?;
    let bytes: [u8; 32] = raw
        .as_slice()
        .try_into()
        .map_err(|_| anyhow::anyhow!("Ed25519 public key must be exactly 32 bytes"))?;
    VerifyingKey::from_bytes(&bytes).context("invalid Ed25519 public key")
}

/// Sign arbitrary bytes, returning a base64 signature.
pub fn sign_b64(key: &SigningKey, data: &[u8]) -> String {
    b64_encode(&key.sign(data).to_bytes())
}

/// Verify a base64 signature over arbitrary bytes.
pub fn verify_b64(key: &VerifyingKey, data: &[u8], signature_b64: &str) -> bool {
    let Ok(sig_bytes) = b64_decode(signature_b64) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(&sig_bytes) else {
        return false;
    };
    key.verify(data, &signature).is_ok()
}

/// Sign the raw bytes of a hex nonce from a gateway challenge.
pub fn sign_nonce_hex(key: &SigningKey, nonce_hex: &str) -> Result<String> {
    let nonce = hex::decode(nonce_hex).context("nonce is not valid hex")?;
    Ok(sign_b64(key, &nonce))
}

/// Create and sign a device attestation.
///
/// `serde_json` objects are BTreeMap-backed, so `to_string` yields sorted
/// keys with compact separators — the canonical form the gateway verifies
/// byte-for-byte.
pub fn create_device_attestation(
    key: &SigningKey,
    device_id: &str,
    device_public_key_b64: &str,
    expires_days: i64,
) -> Result<Attestation> {
    let issued_at = Utc::now();
    let expires_at = issued_at + chrono::Duration::days(expires_days);
    let blob_value = serde_json::json!({
        "device_id": device_id,
        "device_public_key": device_public_key_b64,
        "issued_at": rfc3339_utc(issued_at),
        "expires_at": rfc3339_utc(expires_at),
    });
    let blob = serde_json::to_string(&blob_value).context("failed to serialize attestation")?;
    let desktop_signature = sign_b64(key, blob.as_bytes());
    Ok(Attestation {
        blob,
        desktop_signature,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_roundtrip() {
        let key = generate_signing_key();
        let vkey = load_verifying_key_b64(&public_key_b64(&key)).unwrap();
        let sig = sign_b64(&key, b"hello");
        assert!(verify_b64(&vkey, b"hello", &sig));
        assert!(!verify_b64(&vkey, b"hellp", &sig));
        assert!(!verify_b64(&vkey, b"hello", "not base64!!"));
    }

    #[test]
    fn nonce_signature_covers_raw_bytes() {
        let key = generate_signing_key();
        let vkey = key.verifying_key();
        let nonce_hex = "deadbeef00112233";
        let sig = sign_nonce_hex(&key, nonce_hex).unwrap();
        assert!(verify_b64(&vkey, &hex::decode(nonce_hex).unwrap(), &sig));
        assert!(sign_nonce_hex(&key, "zz").is_err());
    }

    #[test]
    fn attestation_blob_is_canonical_and_verifiable() {
        let key = generate_signing_key();
        let att = create_device_attestation(&key, "mobile-abc", "cHVia2V5", 30).unwrap();

        // Sorted keys, compact separators.
        assert!(att.blob.starts_with(r#"{"device_id":"mobile-abc","device_public_key":"cHVia2V5","expires_at":"#));
        assert!(!att.blob.contains(": "));

        let vkey = key.verifying_key();
        assert!(verify_b64(&vkey, att.blob.as_bytes(), &att.desktop_signature));

        // Any byte flip breaks verification.
        let tampered = att.blob.replace("mobile-abc", "mobile-abd");
        assert!(!verify_b64(&vkey, tampered.as_bytes(), &att.desktop_signature));
    }

    #[test]
    fn attestation_timestamps_are_rfc3339_z() {
        let key = generate_signing_key();
        let att = create_device_attestation(&key, "mobile-abc", "cHVia2V5", 1).unwrap();
        let blob: serde_json::Value = serde_json::from_str(&att.blob).unwrap();
        let expires = blob["expires_at"].as_str().unwrap();
        assert!(expires.ends_with('Z'));
        let parsed = DateTime::parse_from_rfc3339(expires).unwrap();
        assert!(parsed.timestamp() > Utc::now().timestamp());
    }

    #[test]
    fn master_key_persists_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let first = load_or_create_master_key(dir.path(), MASTER_KEY_FILE).unwrap();
        let second = load_or_create_master_key(dir.path(), MASTER_KEY_FILE).unwrap();
        assert_eq!(public_key_b64(&first), public_key_b64(&second));
    }
}
