//! Hub configuration and state files.
//!
//! Everything lives under the app directory (default `~/.homelink`):
//!
//! ```text
//! config.toml           persistent settings
//! state.json            runtime state written by the running hub
//! master_key.pem        desktop Ed25519 master key
//! pairing_session.json  active pairing session, if any
//! devices.json          approved devices
//! channels/<name>.json  one config per channel plugin
//! agent/config.json     LLM provider and generation settings
//! agent/system_prompt.md
//! homelink.pid          daemon PID file
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const CONFIG_FILE: &str = "config.toml";
pub const STATE_FILE: &str = "state.json";

fn default_app_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".homelink")
}

fn default_device_id() -> String {
    let mut bytes = [0u8; 6];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("desktop-{}", hex::encode(bytes))
}

fn default_gateway_url() -> String {
    "ws://localhost:8765".to_string()
}

fn default_plugin_port() -> u16 {
    18081
}

fn default_ping_interval() -> f64 {
    30.0
}

fn default_attestation_expires_days() -> i64 {
    30
}

fn default_master_key_file() -> String {
    crate::crypto::MASTER_KEY_FILE.to_string()
}

/// Persistent hub settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// App state directory.
    #[serde(default = "default_app_dir")]
    pub app_dir: PathBuf,
    /// This desktop's device id on the gateway.
    #[serde(default = "default_device_id")]
    pub device_id: String,
    /// Gateway WebSocket URL the devices channel connects to.
    #[serde(default = "default_gateway_url")]
    pub gateway_url: String,
    /// Local plugin RPC server port (loopback only).
    #[serde(default = "default_plugin_port")]
    pub plugin_port: u16,
    /// Keepalive ping interval for the gateway socket, seconds.
    #[serde(default = "default_ping_interval")]
    pub ping_interval: f64,
    /// Attestation lifetime handed to newly paired devices.
    #[serde(default = "default_attestation_expires_days")]
    pub attestation_expires_days: i64,
    /// Master key filename inside the app dir.
    #[serde(default = "default_master_key_file")]
    pub master_key_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            app_dir: default_app_dir(),
            device_id: default_device_id(),
            gateway_url: default_gateway_url(),
            plugin_port: default_plugin_port(),
            ping_interval: default_ping_interval(),
            attestation_expires_days: default_attestation_expires_days(),
            master_key_file: default_master_key_file(),
        }
    }
}

impl Config {
    /// Load configuration, creating defaults (and the file) if absent.
    pub fn load(app_dir: Option<PathBuf>) -> Result<Self> {
        let dir = app_dir.unwrap_or_else(default_app_dir);
        let path = dir.join(CONFIG_FILE);
        if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let mut config: Config = toml::from_str(&content)
                .with_context(|| format!("invalid config at {}", path.display()))?;
            config.app_dir = dir;
            Ok(config)
        } else {
            let config = Config {
                app_dir: dir,
                ..Config::default()
            };
            config.save()?;
            Ok(config)
        }
    }

    pub fn save(&self) -> Result<()> {
        std::fs::create_dir_all(&self.app_dir)
            .with_context(|| format!("failed to create {}", self.app_dir.display()))?;
        let content = toml::to_string_pretty(self).context("failed to serialize config")?;
        std::fs::write(self.app_dir.join(CONFIG_FILE), content).context("failed to write config")
    }

    pub fn master_key_path(&self) -> PathBuf {
        self.app_dir.join(&self.master_key_file)
    }

    /// URL plugins use to reach the hub's RPC server.
    pub fn plugin_ws_url(&self) -> String {
        format!("ws://127.0.0.1:{}", self.plugin_port)
    }
}

// ── Runtime state ───────────────────────────────────────────────────────────

/// Runtime state updated by the running hub process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct State {
    #[serde(default)]
    pub ws_connected: bool,
    /// RFC-3339 timestamp of the last successful gateway connection.
    #[serde(default)]
    pub last_connected: Option<String>,
    #[serde(default)]
    pub gateway_url: Option<String>,
}

pub fn load_state(app_dir: &Path) -> State {
    let path = app_dir.join(STATE_FILE);
    std::fs::read_to_string(&path)
        .ok()
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default()
}

pub fn save_state(app_dir: &Path, state: &State) -> Result<()> {
    std::fs::create_dir_all(app_dir)?;
    let raw = serde_json::to_string_pretty(state).context("failed to serialize state")?;
    std::fs::write(app_dir.join(STATE_FILE), raw).context("failed to write state")
}

pub fn mark_connected(app_dir: &Path, gateway_url: &str) {
    let mut state = load_state(app_dir);
    state.ws_connected = true;
    state.last_connected = Some(crate::crypto::rfc3339_utc(chrono::Utc::now()));
    state.gateway_url = Some(gateway_url.to_string());
    if let Err(err) = save_state(app_dir, &state) {
        tracing::warn!("failed to persist connected state: {err:#}");
    }
}

pub fn mark_disconnected(app_dir: &Path) {
    let mut state = load_state(app_dir);
    state.ws_connected = false;
    if let Err(err) = save_state(app_dir, &state) {
        tracing::warn!("failed to persist disconnected state: {err:#}");
    }
}

// ── Channel plugin configs ──────────────────────────────────────────────────

/// Persisted configuration for one channel plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub name: String,
    #[serde(default = "enabled_default")]
    pub enabled: bool,
    /// Command used to start the plugin process. The supervisor appends
    /// `["--hub-ws", <url>]`. Defaults to `homelink-channel-<name>`.
    #[serde(default)]
    pub command: Vec<String>,
    /// Working directory for the child process, if set.
    #[serde(default)]
    pub workspace_dir: String,
    /// Channel-specific settings, pushed via `channel.configure` after
    /// registration.
    #[serde(default)]
    pub config: serde_json::Map<String, Value>,
}

fn enabled_default() -> bool {
    true
}

impl ChannelConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            enabled: true,
            command: Vec::new(),
            workspace_dir: String::new(),
            config: serde_json::Map::new(),
        }
    }

    pub fn effective_command(&self) -> Vec<String> {
        if self.command.is_empty() {
            vec![format!("homelink-channel-{}", self.name)]
        } else {
            self.command.clone()
        }
    }
}

pub fn channels_dir(app_dir: &Path) -> PathBuf {
    app_dir.join("channels")
}

pub fn channel_config_path(app_dir: &Path, name: &str) -> PathBuf {
    channels_dir(app_dir).join(format!("{name}.json"))
}

pub fn load_channel_config(app_dir: &Path, name: &str) -> Option<ChannelConfig> {
    let path = channel_config_path(app_dir, name);
    let raw = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&raw).ok()
}

pub fn save_channel_config(app_dir: &Path, cfg: &ChannelConfig) -> Result<()> {
    std::fs::create_dir_all(channels_dir(app_dir))?;
    let raw = serde_json::to_string_pretty(cfg).context("failed to serialize channel config")?;
    std::fs::write(channel_config_path(app_dir, &cfg.name), raw)
        .with_context(|| format!("failed to write channel config for {}", cfg.name))
}

pub fn list_channel_configs(app_dir: &Path) -> Vec<ChannelConfig> {
    let dir = channels_dir(app_dir);
    let Ok(entries) = std::fs::read_dir(&dir) else {
        return Vec::new();
    };
    let mut configs: Vec<ChannelConfig> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "json"))
        .filter_map(|entry| {
            let raw = std::fs::read_to_string(entry.path()).ok()?;
            serde_json::from_str(&raw).ok()
        })
        .collect();
    configs.sort_by(|a, b| a.name.cmp(&b.name));
    configs
}

pub fn list_enabled_channels(app_dir: &Path) -> Vec<ChannelConfig> {
    list_channel_configs(app_dir)
        .into_iter()
        .filter(|cfg| cfg.enabled)
        .collect()
}

// ── Agent configuration ─────────────────────────────────────────────────────

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful home assistant running on homelink.\n\
Answer questions concisely and helpfully.\n";

fn default_provider() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gpt-4.1-mini".to_string()
}

fn default_agent_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_temperature() -> f64 {
    0.7
}

fn default_max_tokens() -> u32 {
    1024
}

/// LLM provider and generation settings for the agent worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// OpenAI-compatible API base, without the trailing endpoint path.
    #[serde(default = "default_agent_base_url")]
    pub base_url: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: default_agent_base_url(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
        }
    }
}

pub fn agent_dir(app_dir: &Path) -> PathBuf {
    app_dir.join("agent")
}

/// Load agent config, writing defaults on first run.
pub fn load_agent_config(app_dir: &Path) -> AgentConfig {
    let dir = agent_dir(app_dir);
    let path = dir.join("config.json");
    match std::fs::read_to_string(&path) {
        Ok(raw) => match serde_json::from_str(&raw) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!("failed to parse agent config, using defaults: {err}");
                AgentConfig::default()
            }
        },
        Err(_) => {
            let config = AgentConfig::default();
            if std::fs::create_dir_all(&dir).is_ok() {
                if let Ok(raw) = serde_json::to_string_pretty(&config) {
                    let _ = std::fs::write(&path, raw);
                }
            }
            config
        }
    }
}

/// Load the system prompt, writing the default on first run.
pub fn load_system_prompt(app_dir: &Path) -> String {
    let dir = agent_dir(app_dir);
    let path = dir.join("system_prompt.md");
    if let Ok(raw) = std::fs::read_to_string(&path) {
        return raw.trim().to_string();
    }
    if std::fs::create_dir_all(&dir).is_ok() {
        let _ = std::fs::write(&path, DEFAULT_SYSTEM_PROMPT);
    }
    DEFAULT_SYSTEM_PROMPT.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_roundtrip_creates_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let first = Config::load(Some(dir.path().to_path_buf())).unwrap();
        assert!(dir.path().join(CONFIG_FILE).exists());
        let second = Config::load(Some(dir.path().to_path_buf())).unwrap();
        assert_eq!(first.device_id, second.device_id);
        assert_eq!(second.plugin_port, 18081);
        assert!(second.device_id.starts_with("desktop-"));
    }

    #[test]
    fn effective_command_defaults_to_binary_name() {
        let cfg = ChannelConfig::new("echo");
        assert_eq!(cfg.effective_command(), vec!["homelink-channel-echo"]);

        let mut custom = ChannelConfig::new("echo");
        custom.command = vec!["./target/debug/homelink-channel-echo".into()];
        assert_eq!(custom.effective_command(), custom.command);
    }

    #[test]
    fn enabled_channel_listing_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        let mut devices = ChannelConfig::new("devices");
        devices
            .config
            .insert("gateway_url".into(), serde_json::json!("ws://x"));
        save_channel_config(dir.path(), &devices).unwrap();
        let mut echo = ChannelConfig::new("echo");
        echo.enabled = false;
        save_channel_config(dir.path(), &echo).unwrap();

        let all = list_channel_configs(dir.path());
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].name, "devices");

        let enabled = list_enabled_channels(dir.path());
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].name, "devices");
        assert_eq!(enabled[0].config["gateway_url"], "ws://x");
    }

    #[test]
    fn state_marks_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        mark_connected(dir.path(), "ws://gw:8765");
        let state = load_state(dir.path());
        assert!(state.ws_connected);
        assert_eq!(state.gateway_url.as_deref(), Some("ws://gw:8765"));
        mark_disconnected(dir.path());
        assert!(!load_state(dir.path()).ws_connected);
    }

    #[test]
    fn agent_defaults_written_on_first_load() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_agent_config(dir.path());
        assert_eq!(config.provider, "openai");
        assert!(agent_dir(dir.path()).join("config.json").exists());
        let prompt = load_system_prompt(dir.path());
        assert!(prompt.contains("homelink"));
        assert!(agent_dir(dir.path()).join("system_prompt.md").exists());
    }
}
