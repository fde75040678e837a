//! Configuration types and loading.
//!
//! Config is loaded once from a JSON file (e.g. `~/.relay/config.json`) and environment,
//! then shared read-only (`Arc<Config>`) with every component that needs it.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Broker connection and subscription settings.
    #[serde(default)]
    pub broker: BrokerConfig,

    /// Script generation endpoint.
    #[serde(default)]
    pub generation: GenerationConfig,

    /// Local script execution.
    #[serde(default)]
    pub execution: ExecutionConfig,

    /// Per-message dispatch.
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

/// MQTT broker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerConfig {
    /// Broker URL, e.g. `mqtts://broker.example.com:8883`. Overridden by RELAY_BROKER_ADDRESS env.
    #[serde(default = "default_broker_address")]
    pub address: String,

    /// Overridden by RELAY_BROKER_USERNAME env.
    #[serde(default)]
    pub username: Option<String>,

    /// Overridden by RELAY_BROKER_PASSWORD env.
    #[serde(default)]
    pub password: Option<String>,

    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Topic carrying `{"prompt": "..."}` payloads.
    #[serde(default = "default_topic")]
    pub topic: String,

    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,

    /// Wait between reconnect attempts after the transport drops. Attempts are unbounded.
    #[serde(default = "default_reconnect_interval_secs")]
    pub reconnect_interval_secs: u64,

    /// Upper bound on the orderly disconnect at shutdown.
    #[serde(default = "default_disconnect_grace_ms")]
    pub disconnect_grace_ms: u64,
}

/// Generation endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    /// POST target. Overridden by RELAY_GENERATION_ENDPOINT env.
    #[serde(default = "default_generation_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_generation_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionConfig {
    /// Command interpreter invoked as `<shell> -c <script>`.
    #[serde(default = "default_shell")]
    pub shell: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineConfig {
    /// Maximum number of messages processed at the same time.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// How long shutdown waits for in-flight messages before exiting anyway.
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
}

fn default_broker_address() -> String {
    "mqtts://localhost:8883".to_string()
}

fn default_client_id() -> String {
    "relay-executor".to_string()
}

fn default_topic() -> String {
    "relay/commands".to_string()
}

fn default_keep_alive_secs() -> u64 {
    30
}

fn default_reconnect_interval_secs() -> u64 {
    5
}

fn default_disconnect_grace_ms() -> u64 {
    250
}

fn default_generation_endpoint() -> String {
    "http://localhost:8080/generate-shell".to_string()
}

fn default_generation_timeout_secs() -> u64 {
    60
}

fn default_shell() -> String {
    "/bin/sh".to_string()
}

fn default_max_concurrency() -> usize {
    4
}

fn default_drain_timeout_secs() -> u64 {
    30
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            address: default_broker_address(),
            username: None,
            password: None,
            client_id: default_client_id(),
            topic: default_topic(),
            keep_alive_secs: default_keep_alive_secs(),
            reconnect_interval_secs: default_reconnect_interval_secs(),
            disconnect_grace_ms: default_disconnect_grace_ms(),
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            endpoint: default_generation_endpoint(),
            timeout_secs: default_generation_timeout_secs(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            drain_timeout_secs: default_drain_timeout_secs(),
        }
    }
}

impl BrokerConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_secs)
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_millis(self.disconnect_grace_ms)
    }
}

impl GenerationConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl PipelineConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }
}

/// Transport scheme of the broker address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerScheme {
    Tls,
    Plain,
}

/// Parsed broker address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub scheme: BrokerScheme,
    pub host: String,
    pub port: u16,
}

/// Parse `mqtts://host:port` style addresses. `mqtts`, `ssl` and `tls` select TLS; `mqtt` and `tcp` are plain.
pub fn parse_broker_address(address: &str) -> Result<BrokerAddress, String> {
    let url = reqwest::Url::parse(address.trim())
        .map_err(|e| format!("invalid broker address {}: {}", address, e))?;
    let (scheme, default_port) = match url.scheme() {
        "mqtts" | "ssl" | "tls" => (BrokerScheme::Tls, 8883),
        "mqtt" | "tcp" => (BrokerScheme::Plain, 1883),
        other => {
            return Err(format!(
                "unsupported broker scheme {} in {}",
                other, address
            ))
        }
    };
    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| format!("broker address has no host: {}", address))?
        .to_string();
    Ok(BrokerAddress {
        scheme,
        host,
        port: url.port().unwrap_or(default_port),
    })
}

/// Environment variable names that override config fields.
pub const ENV_BROKER_ADDRESS: &str = "RELAY_BROKER_ADDRESS";
pub const ENV_BROKER_USERNAME: &str = "RELAY_BROKER_USERNAME";
pub const ENV_BROKER_PASSWORD: &str = "RELAY_BROKER_PASSWORD";
pub const ENV_CLIENT_ID: &str = "RELAY_CLIENT_ID";
pub const ENV_TOPIC: &str = "RELAY_TOPIC";
pub const ENV_GENERATION_ENDPOINT: &str = "RELAY_GENERATION_ENDPOINT";

impl Config {
    /// Apply overrides from `lookup` (normally the process environment). Blank values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(name)
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        };
        if let Some(v) = get(ENV_BROKER_ADDRESS) {
            self.broker.address = v;
        }
        if let Some(v) = get(ENV_BROKER_USERNAME) {
            self.broker.username = Some(v);
        }
        if let Some(v) = get(ENV_BROKER_PASSWORD) {
            self.broker.password = Some(v);
        }
        if let Some(v) = get(ENV_CLIENT_ID) {
            self.broker.client_id = v;
        }
        if let Some(v) = get(ENV_TOPIC) {
            self.broker.topic = v;
        }
        if let Some(v) = get(ENV_GENERATION_ENDPOINT) {
            self.generation.endpoint = v;
        }
    }

    /// Broker credentials when a username is configured. Blank strings count as unset.
    pub fn credentials(&self) -> Option<(String, String)> {
        let username = self
            .broker
            .username
            .as_ref()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())?;
        let password = self.broker.password.clone().unwrap_or_default();
        Some((username, password))
    }

    /// Log the effective configuration. The password is never printed.
    pub fn log_summary(&self) {
        log::info!("configuration loaded:");
        log::info!("  broker: {}", self.broker.address);
        log::info!("  client id: {}", self.broker.client_id);
        log::info!("  topic: {}", self.broker.topic);
        log::info!(
            "  credentials: {}",
            if self.credentials().is_some() { "set" } else { "none" }
        );
        log::info!("  generation endpoint: {}", self.generation.endpoint);
        log::info!("  max concurrency: {}", self.pipeline.max_concurrency);
    }
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("RELAY_CONFIG_PATH").map(PathBuf::from).unwrap_or_else(|_| {
        dirs::home_dir()
            .map(|h| h.join(".relay").join("config.json"))
            .unwrap_or_else(|| PathBuf::from("config.json"))
    })
}

/// Load config from `path` (or the default path). Missing file => default config.
/// Environment overrides are applied on top. Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let mut config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    config.apply_overrides(|name| std::env::var(name).ok());
    Ok((config, path))
}

/// Write the default config to `path` unless a file already exists there. Returns true when written.
pub fn write_default_config(path: &std::path::Path) -> Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    if let Some(dir) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating config directory {}", dir.display()))?;
    }
    let body = serde_json::to_string_pretty(&Config::default())?;
    std::fs::write(path, body).with_context(|| format!("writing config to {}", path.display()))?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults() {
        let c = Config::default();
        assert_eq!(c.broker.keep_alive_secs, 30);
        assert_eq!(c.broker.reconnect_interval_secs, 5);
        assert_eq!(c.broker.disconnect_grace(), Duration::from_millis(250));
        assert_eq!(c.generation.endpoint, "http://localhost:8080/generate-shell");
        assert_eq!(c.execution.shell, "/bin/sh");
        assert!(c.credentials().is_none());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let c: Config =
            serde_json::from_str(r#"{"broker":{"topic":"ops/cmds","username":"bot"}}"#).unwrap();
        assert_eq!(c.broker.topic, "ops/cmds");
        assert_eq!(c.broker.client_id, "relay-executor");
        assert_eq!(c.pipeline.max_concurrency, 4);
        assert_eq!(c.credentials(), Some(("bot".to_string(), String::new())));
    }

    #[test]
    fn env_overrides_replace_non_blank_values() {
        let env: HashMap<&str, &str> = [
            (ENV_TOPIC, "  other/topic "),
            (ENV_BROKER_PASSWORD, "secret"),
            (ENV_CLIENT_ID, "   "),
        ]
        .into_iter()
        .collect();
        let mut c = Config::default();
        c.apply_overrides(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(c.broker.topic, "other/topic");
        assert_eq!(c.broker.password.as_deref(), Some("secret"));
        assert_eq!(c.broker.client_id, "relay-executor");
        // password alone does not make credentials
        assert!(c.credentials().is_none());
    }

    #[test]
    fn parse_tls_and_plain_addresses() {
        let a = parse_broker_address("mqtts://queue.example.com:443").unwrap();
        assert_eq!(a.scheme, BrokerScheme::Tls);
        assert_eq!(a.host, "queue.example.com");
        assert_eq!(a.port, 443);

        let b = parse_broker_address("mqtt://127.0.0.1").unwrap();
        assert_eq!(b.scheme, BrokerScheme::Plain);
        assert_eq!(b.port, 1883);

        assert_eq!(parse_broker_address("ssl://h").unwrap().port, 8883);
    }

    #[test]
    fn parse_rejects_unknown_scheme_and_garbage() {
        assert!(parse_broker_address("http://broker:80").is_err());
        assert!(parse_broker_address("not a url").is_err());
    }

    #[test]
    fn load_missing_file_gives_defaults_and_write_default_round_trips() {
        let dir = std::env::temp_dir().join(format!("relay-config-test-{}", uuid::Uuid::new_v4()));
        let path = dir.join("config.json");
        let (c, used) = load_config(Some(path.clone())).unwrap();
        assert_eq!(used, path);
        assert_eq!(c.execution.shell, "/bin/sh");

        assert!(write_default_config(&path).unwrap());
        assert!(!write_default_config(&path).unwrap());
        let (c, _) = load_config(Some(path)).unwrap();
        assert_eq!(c.broker.reconnect_interval_secs, 5);
        let _ = std::fs::remove_dir_all(dir);
    }
}
