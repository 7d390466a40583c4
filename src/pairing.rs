//! Device pairing — short-lived numeric codes, approved-device persistence,
//! and the controller that turns a bridged `pairing_request` into a signed
//! attestation.
//!
//! At most one pairing session is active at a time. A session is a
//! `(code, ttl)` tuple created on user request; it is destroyed by a
//! successful pairing, expiry, or an explicit clear.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, Utc};
use ed25519_dalek::SigningKey;
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::crypto;

pub const PAIRING_SESSION_FILE: &str = "pairing_session.json";
pub const APPROVED_DEVICES_FILE: &str = "devices.json";

pub const DEFAULT_CODE_LENGTH: usize = 6;
pub const DEFAULT_TTL_SECONDS: i64 = 300;

// ── Pairing session ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingSession {
    pub code: String,
    pub created_at: DateTime<Utc>,
    pub ttl_seconds: i64,
}

impl PairingSession {
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.created_at + Duration::seconds(self.ttl_seconds)
    }

    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at()
    }

    pub fn remaining_seconds(&self, now: DateTime<Utc>) -> i64 {
        (self.expires_at() - now).num_seconds().max(0)
    }
}

/// Random numeric pairing code.
pub fn generate_pairing_code(length: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..length).map(|_| rng.gen_range(0..10).to_string()).collect()
}

pub fn create_pairing_session(code_length: usize, ttl_seconds: i64) -> Result<PairingSession> {
    if code_length == 0 {
        bail!("pairing code length must be > 0");
    }
    if ttl_seconds <= 0 {
        bail!("pairing code ttl_seconds must be > 0");
    }
    Ok(PairingSession {
        code: generate_pairing_code(code_length),
        created_at: Utc::now(),
        ttl_seconds,
    })
}

fn session_path(app_dir: &Path) -> PathBuf {
    app_dir.join(PAIRING_SESSION_FILE)
}

/// Load the active session, expired or not; callers decide what expiry
/// means for them.
pub fn load_pairing_session(app_dir: &Path) -> Option<PairingSession> {
    let raw = std::fs::read_to_string(session_path(app_dir)).ok()?;
    serde_json::from_str(&raw).ok()
}

pub fn save_pairing_session(app_dir: &Path, session: &PairingSession) -> Result<()> {
    std::fs::create_dir_all(app_dir)?;
    let raw = serde_json::to_string_pretty(session).context("failed to serialize session")?;
    std::fs::write(session_path(app_dir), raw).context("failed to write pairing session")
}

pub fn clear_pairing_session(app_dir: &Path) {
    let _ = std::fs::remove_file(session_path(app_dir));
}

// ── Approved devices ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovedDevice {
    pub device_id: String,
    pub device_public_key: String,
    pub paired_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

fn devices_path(app_dir: &Path) -> PathBuf {
    app_dir.join(APPROVED_DEVICES_FILE)
}

pub fn load_approved_devices(app_dir: &Path) -> Vec<ApprovedDevice> {
    let Ok(raw) = std::fs::read_to_string(devices_path(app_dir)) else {
        return Vec::new();
    };
    // Corrupt entries are skipped rather than poisoning the whole list.
    let Ok(values) = serde_json::from_str::<Vec<Value>>(&raw) else {
        return Vec::new();
    };
    values
        .into_iter()
        .filter_map(|value| serde_json::from_value(value).ok())
        .collect()
}

pub fn save_approved_devices(app_dir: &Path, devices: &[ApprovedDevice]) -> Result<()> {
    std::fs::create_dir_all(app_dir)?;
    let raw = serde_json::to_string_pretty(devices).context("failed to serialize devices")?;
    std::fs::write(devices_path(app_dir), raw).context("failed to write approved devices")
}

pub fn upsert_approved_device(app_dir: &Path, device: ApprovedDevice) -> Result<()> {
    let mut by_id: HashMap<String, ApprovedDevice> = load_approved_devices(app_dir)
        .into_iter()
        .map(|d| (d.device_id.clone(), d))
        .collect();
    by_id.insert(device.device_id.clone(), device);
    let mut devices: Vec<ApprovedDevice> = by_id.into_values().collect();
    devices.sort_by(|a, b| a.device_id.cmp(&b.device_id));
    save_approved_devices(app_dir, &devices)
}

/// Remove a device from the approved list. Returns false if it was absent.
pub fn revoke_approved_device(app_dir: &Path, device_id: &str) -> Result<bool> {
    let devices = load_approved_devices(app_dir);
    let before = devices.len();
    let remaining: Vec<ApprovedDevice> = devices
        .into_iter()
        .filter(|d| d.device_id != device_id)
        .collect();
    if remaining.len() == before {
        return Ok(false);
    }
    save_approved_devices(app_dir, &remaining)?;
    Ok(true)
}

// ── Pairing controller ──────────────────────────────────────────────────────

/// Resolves bridged pairing requests against the active session and issues
/// attestations signed with the desktop master key.
pub struct PairingController {
    signing_key: SigningKey,
    app_dir: PathBuf,
    expires_days: i64,
}

impl PairingController {
    pub fn new(signing_key: SigningKey, app_dir: PathBuf, expires_days: i64) -> Self {
        Self {
            signing_key,
            app_dir,
            expires_days,
        }
    }

    /// Handle a `pairing_request` event from the devices channel.
    ///
    /// Returns the `pairing_response` event data to forward back, or
    /// `None` when the request carries no usable `request_id` (there is
    /// nobody to answer).
    pub fn handle_request(&self, data: &Value) -> Option<Value> {
        let request_id = non_empty_str(data.get("request_id"))?;

        let Some(pairing_code) = non_empty_str(data.get("pairing_code")) else {
            return Some(rejection(request_id, "invalid_pairing_code"));
        };
        let Some(device_public_key) = non_empty_str(data.get("device_public_key")) else {
            return Some(rejection(request_id, "invalid_device_public_key"));
        };

        let Some(session) = load_pairing_session(&self.app_dir) else {
            return Some(rejection(request_id, "no_active_pairing_session"));
        };
        if !session.is_valid(Utc::now()) || session.code != pairing_code {
            return Some(rejection(request_id, "pairing_code_invalid_or_expired"));
        }

        let device_id = new_mobile_device_id();
        let attestation = match crypto::create_device_attestation(
            &self.signing_key,
            &device_id,
            device_public_key,
            self.expires_days,
        ) {
            Ok(att) => att,
            Err(err) => {
                tracing::error!("failed to build attestation: {err:#}");
                return Some(rejection(request_id, "attestation_failed"));
            }
        };

        let expires_at = serde_json::from_str::<Value>(&attestation.blob)
            .ok()
            .and_then(|blob| {
                blob.get("expires_at")
                    .and_then(Value::as_str)
                    .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            })
            .map(|dt| dt.with_timezone(&Utc));

        let device = ApprovedDevice {
            device_id: device_id.clone(),
            device_public_key: device_public_key.to_string(),
            paired_at: Utc::now(),
            expires_at,
            metadata: HashMap::from([("source".to_string(), "gateway_pairing".to_string())]),
        };
        if let Err(err) = upsert_approved_device(&self.app_dir, device) {
            tracing::warn!("failed to persist approved device {device_id}: {err:#}");
        }
        clear_pairing_session(&self.app_dir);

        tracing::info!("pairing approved: device_id={device_id}");
        Some(json!({
            "request_id": request_id,
            "status": "approved",
            "device_id": device_id,
            "attestation": attestation,
        }))
    }
}

fn rejection(request_id: &str, reason: &str) -> Value {
    json!({
        "request_id": request_id,
        "status": "rejected",
        "reason": reason,
    })
}

fn non_empty_str(value: Option<&Value>) -> Option<&str> {
    value.and_then(Value::as_str).filter(|s| !s.is_empty())
}

fn new_mobile_device_id() -> String {
    let mut bytes = [0u8; 6];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("mobile-{}", hex::encode(bytes))
}
