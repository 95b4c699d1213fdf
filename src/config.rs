//! Settings and static configuration.
//!
//! Runtime settings come from environment variables (with `.env` support in
//! main); the destination list and timing defaults come from an optional
//! YAML document. A YAML document that cannot be read or decoded is fatal
//! at startup — everything after bootstrap recovers locally instead.

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::warn;
use uuid::Uuid;

pub const DEF_CLIENT_ID: &str = "pingrelay_agent"; // no longer than 23 characters
pub const DEF_BROKER_URL: &str = "tcp://broker.hivemq.com:1883";
pub const DEF_TOPIC_PREFIX: &str = "pingrelay/";

const DEF_BROKER_PORT: u16 = 1883;
const MAX_CLIENT_ID_LEN: usize = 23;

/// Broker connection settings, resolved once at startup.
#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub client_id: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub pass: String,
}

/// All environment-derived settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub mqtt: MqttSettings,
    pub topic_prefix: String,
    pub config_path: String,
    pub debug: bool,
}

impl Settings {
    pub fn from_env() -> Self {
        let (host, port) = parse_broker_url(&env_or("BROKERURL", DEF_BROKER_URL));
        Self {
            mqtt: MqttSettings {
                client_id: resolve_client_id(&env_or("CLIENTID", DEF_CLIENT_ID)),
                host,
                port,
                user: env_or("MQTTUSER", ""),
                pass: env_or("MQTTPASS", ""),
            },
            topic_prefix: env_or("PREFIX", DEF_TOPIC_PREFIX),
            config_path: env_or("CONFIG", ""),
            debug: env_or("DEBUG", "") == "1",
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

/// Accepts `tcp://host:port`, `mqtt://host:port`, `host:port` or a bare
/// hostname (port defaults to 1883).
pub fn parse_broker_url(url: &str) -> (String, u16) {
    let rest = url
        .strip_prefix("tcp://")
        .or_else(|| url.strip_prefix("mqtt://"))
        .unwrap_or(url);
    match rest.rsplit_once(':') {
        Some((host, port)) => match port.parse::<u16>() {
            Ok(port) => (host.to_string(), port),
            Err(_) => (rest.to_string(), DEF_BROKER_PORT),
        },
        None => (rest.to_string(), DEF_BROKER_PORT),
    }
}

/// `random` (or empty) asks for an auto-generated id; rumqttc wants a
/// concrete one, so generate it here and clamp to the MQTT v3 limit.
pub fn resolve_client_id(raw: &str) -> String {
    if raw.is_empty() || raw.eq_ignore_ascii_case("random") {
        let id = format!("pingrelay-{}", Uuid::new_v4().simple());
        id[..MAX_CLIENT_ID_LEN].to_string()
    } else {
        raw.to_string()
    }
}

/// Static YAML configuration document. All keys optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    /// Default probe interval in seconds for destinations that omit one.
    #[serde(default)]
    pub interval: u64,
    /// Advertise-all period in seconds; zero or negative disables it.
    #[serde(default)]
    pub advertisements: i64,
    /// Liveness evaluation period in seconds (clamped to a minimum of 2).
    #[serde(default, rename = "update-interval")]
    pub update_interval: u64,
    #[serde(default)]
    pub destinations: Vec<DestinationDef>,
}

/// One destination entry, from YAML or from a bus config message.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DestinationDef {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub interval: u64,
}

/// Loads the YAML config. An empty path is allowed (destinations can still
/// arrive over the bus); an unreadable or unparsable file is not.
pub async fn load_app_config(path: &str) -> Result<AppConfig> {
    if path.is_empty() {
        warn!("no config yaml file provided");
        return Ok(AppConfig::default());
    }
    let txt = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("unable to open destinations config {path}"))?;
    if txt.trim().is_empty() {
        return Ok(AppConfig::default());
    }
    serde_yaml::from_str(&txt).with_context(|| format!("unable to parse destinations config {path}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_broker_url_forms() {
        assert_eq!(parse_broker_url("tcp://broker.hivemq.com:1883"), ("broker.hivemq.com".to_string(), 1883));
        assert_eq!(parse_broker_url("mqtt://10.0.0.2:8883"), ("10.0.0.2".to_string(), 8883));
        assert_eq!(parse_broker_url("localhost:1884"), ("localhost".to_string(), 1884));
        assert_eq!(parse_broker_url("localhost"), ("localhost".to_string(), 1883));
    }

    #[test]
    fn test_resolve_client_id() {
        assert_eq!(resolve_client_id("my-bridge"), "my-bridge");
        let generated = resolve_client_id("random");
        assert!(generated.starts_with("pingrelay-"));
        assert!(generated.len() <= 23);
        assert_ne!(resolve_client_id(""), resolve_client_id(""));
    }

    #[tokio::test]
    async fn test_load_app_config() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            f,
            "interval: 3\nadvertisements: 60\nupdate-interval: 5\ndestinations:\n  - name: router\n    address: 192.168.1.1\n    interval: 5\n  - address: 8.8.8.8"
        )
        .unwrap();

        let cfg = load_app_config(f.path().to_str().unwrap()).await.unwrap();
        assert_eq!(cfg.interval, 3);
        assert_eq!(cfg.advertisements, 60);
        assert_eq!(cfg.update_interval, 5);
        assert_eq!(cfg.destinations.len(), 2);
        assert_eq!(cfg.destinations[0].name, "router");
        assert_eq!(cfg.destinations[1].name, "");
        assert_eq!(cfg.destinations[1].address, "8.8.8.8");
        assert_eq!(cfg.destinations[1].interval, 0);
    }

    #[tokio::test]
    async fn test_load_app_config_empty_path_defaults() {
        let cfg = load_app_config("").await.unwrap();
        assert_eq!(cfg.interval, 0);
        assert!(cfg.destinations.is_empty());
    }

    #[tokio::test]
    async fn test_load_app_config_bad_yaml_is_fatal() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "destinations: {{not a list").unwrap();
        assert!(load_app_config(f.path().to_str().unwrap()).await.is_err());
    }

    #[tokio::test]
    async fn test_load_app_config_missing_file_is_fatal() {
        assert!(load_app_config("/nonexistent/pingrelay.yaml").await.is_err());
    }
}
