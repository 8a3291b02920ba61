//! Configuration loading: a TOML file for persistent, admin-managed entities
//! (seed devices, alert rules) layered under env vars for deployment knobs
//! (broker address, bind address, credentials). Read once at startup; never
//! hot-reloaded — restart the process to pick up changes.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

#[derive(Debug, Clone, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub devices: Vec<SeedDevice>,
    #[serde(default)]
    pub alert_rules: Vec<AlertRuleEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedDevice {
    pub device_id: String,
    pub kind: String,
    #[serde(default)]
    pub credentials_fingerprint: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlertRuleEntry {
    pub rule_id: String,
    pub predicate: String,
    pub severity: String,
    #[serde(default = "default_hold_down_secs")]
    pub hold_down_secs: u64,
    #[serde(default = "default_scope")]
    pub scope: String,
}

fn default_hold_down_secs() -> u64 {
    60
}

fn default_scope() -> String {
    "*".to_owned()
}

fn load_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    toml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })
}

/// Full runtime configuration: the TOML seed data plus env-derived knobs.
#[derive(Debug, Clone)]
pub struct Config {
    pub file: FileConfig,
    pub mqtt: MqttConfig,
    pub http: HttpConfig,
    pub pipeline: PipelineConfig,
    pub durable: DurableConfig,
    pub subscribers: SubscribersConfig,
    pub shutdown: ShutdownConfig,
    pub registry: RegistryConfig,
    pub db_url: String,
    pub db_backup_path: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub qos: u8,
    pub topic_root: String,
    pub keepalive_secs: u64,
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub bind: String,
    pub auth_token: String,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub shards: usize,
    pub device_queue: usize,
}

#[derive(Debug, Clone)]
pub struct DurableConfig {
    pub batch_size: usize,
    pub batch_age: Duration,
    pub wab_capacity: usize,
    pub retry_backoff_min: Duration,
    pub retry_backoff_max: Duration,
}

#[derive(Debug, Clone)]
pub struct SubscribersConfig {
    pub outbox_capacity: usize,
    pub drop_policy: String,
    pub heartbeat_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    pub drain_deadline: Duration,
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub unknown_device_policy: String,
    pub shards: usize,
    pub idle_evict_after: Duration,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let file = load_file(path)?;
        let cfg = Config {
            file,
            mqtt: MqttConfig {
                host: env_or("GATEWAY_MQTT_HOST", "localhost"),
                port: env_parse("GATEWAY_MQTT_PORT", 1883),
                client_id: env_or("GATEWAY_MQTT_CLIENT_ID", "sensor-gateway"),
                qos: env_parse("GATEWAY_MQTT_QOS", 1),
                topic_root: env_or("GATEWAY_MQTT_TOPIC_ROOT", "fleet"),
                keepalive_secs: env_parse("GATEWAY_MQTT_KEEPALIVE_SECS", 30),
            },
            http: HttpConfig {
                bind: env_or("GATEWAY_HTTP_BIND", "0.0.0.0:8080"),
                auth_token: env_or("GATEWAY_HTTP_AUTH_TOKEN", "dev-token"),
            },
            pipeline: PipelineConfig {
                shards: env_parse("GATEWAY_PIPELINE_SHARDS", 64),
                device_queue: env_parse("GATEWAY_PIPELINE_DEVICE_QUEUE", 256),
            },
            durable: DurableConfig {
                batch_size: env_parse("GATEWAY_DURABLE_BATCH_SIZE", 1000),
                batch_age: Duration::from_millis(env_parse("GATEWAY_DURABLE_BATCH_AGE_MS", 500)),
                wab_capacity: env_parse("GATEWAY_DURABLE_WAB_CAPACITY", 1_000_000),
                retry_backoff_min: Duration::from_millis(env_parse(
                    "GATEWAY_DURABLE_RETRY_BACKOFF_MIN_MS",
                    100,
                )),
                retry_backoff_max: Duration::from_secs(env_parse(
                    "GATEWAY_DURABLE_RETRY_BACKOFF_MAX_SECS",
                    30,
                )),
            },
            subscribers: SubscribersConfig {
                outbox_capacity: env_parse("GATEWAY_SUBSCRIBERS_OUTBOX_CAPACITY", 1024),
                drop_policy: env_or("GATEWAY_SUBSCRIBERS_DROP_POLICY", "slow_drop"),
                heartbeat_interval: Duration::from_secs(env_parse(
                    "GATEWAY_SUBSCRIBERS_HEARTBEAT_INTERVAL_SECS",
                    15,
                )),
            },
            shutdown: ShutdownConfig {
                drain_deadline: Duration::from_secs(env_parse(
                    "GATEWAY_SHUTDOWN_DRAIN_DEADLINE_SECS",
                    30,
                )),
            },
            registry: RegistryConfig {
                unknown_device_policy: env_or("GATEWAY_REGISTRY_UNKNOWN_DEVICE_POLICY", "reject"),
                shards: env_parse("GATEWAY_REGISTRY_SHARDS", 16),
                idle_evict_after: Duration::from_secs(env_parse(
                    "GATEWAY_REGISTRY_IDLE_EVICT_SECS",
                    7 * 24 * 3600,
                )),
            },
            db_url: env_or("GATEWAY_DB_URL", "sqlite:gateway.db?mode=rwc"),
            db_backup_path: std::env::var("GATEWAY_DB_BACKUP_PATH")
                .ok()
                .filter(|s| !s.is_empty()),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !self.pipeline.shards.is_power_of_two() {
            return Err(ConfigError::Invalid(format!(
                "pipeline.shards must be a power of two, got {}",
                self.pipeline.shards
            )));
        }
        if !matches!(
            self.subscribers.drop_policy.as_str(),
            "slow_drop" | "disconnect"
        ) {
            return Err(ConfigError::Invalid(format!(
                "subscribers.drop_policy must be slow_drop|disconnect, got {}",
                self.subscribers.drop_policy
            )));
        }
        if !matches!(
            self.registry.unknown_device_policy.as_str(),
            "reject" | "auto_provision" | "quarantine"
        ) {
            return Err(ConfigError::Invalid(format!(
                "registry.unknown_device_policy invalid: {}",
                self.registry.unknown_device_policy
            )));
        }
        if !matches!(self.mqtt.qos, 0 | 1 | 2) {
            return Err(ConfigError::Invalid("mqtt.qos must be 0, 1, or 2".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn loads_minimal_toml() {
        let f = tempfile_toml(
            r#"
            [[devices]]
            device_id = "HK_000001"
            kind = "tpms"

            [[alert_rules]]
            rule_id = "tpms_low"
            predicate = "threshold_below(pressure, 200.0)"
            severity = "critical"
            "#,
        );
        let file = load_file(f.path()).unwrap();
        assert_eq!(file.devices.len(), 1);
        assert_eq!(file.alert_rules[0].hold_down_secs, 60);
    }

    #[test]
    fn rejects_non_power_of_two_shards() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("GATEWAY_PIPELINE_SHARDS", "60");
        let f = tempfile_toml("");
        let err = Config::load(f.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        std::env::remove_var("GATEWAY_PIPELINE_SHARDS");
    }

    #[test]
    fn missing_file_is_read_error() {
        let err = load_file(Path::new("/nonexistent/path/config.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    fn tempfile_toml(contents: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f
    }
}
