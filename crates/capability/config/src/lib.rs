//! 桥接进程运行配置加载。

use rumqttc::valid_filter;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::env;

const DEFAULT_CLIENT_ID: &str = "dht-sensor01";
const DEFAULT_MQTT_PORT: u16 = 1883;

/// 配置加载错误。
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required env: {0}")]
    Missing(String),
    #[error("invalid value for {0}: {1}")]
    Invalid(String, String),
}

/// 桥接进程运行配置。
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub broker: BrokerConfig,
    /// payload 与 topic 规则均未给出 deviceId 时使用的默认值。
    pub device_id: String,
    pub topics: Vec<TopicConfig>,
    pub buffer: BufferSettings,
    pub storage: StorageConfig,
    pub shutdown_grace_ms: u64,
    pub dead_letter_path: Option<String>,
}

/// broker 连接配置。
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub qos: u8,
    pub keep_alive_seconds: u64,
    pub connect_timeout_ms: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    pub reconnect_jitter: f64,
}

/// topic 规则的解码方式。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopicKind {
    Data,
    Status,
}

/// 单条 topic 规则（`BRIDGE_TOPICS` JSON 数组的元素）。
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicConfig {
    pub pattern: String,
    pub kind: TopicKind,
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// 写缓冲参数。
#[derive(Debug, Clone)]
pub struct BufferSettings {
    pub max_batch_size: usize,
    pub max_batch_age_ms: u64,
    pub max_batch_bytes: usize,
    pub high_water_mark: usize,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub write_concurrency: usize,
}

/// 时序库连接配置。
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub url: String,
    /// 目标表名（仅允许字母、数字与下划线）。
    pub database: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub write_timeout_ms: u64,
    pub startup_retries: u32,
}

impl BridgeConfig {
    /// 从环境变量读取配置。
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// 从任意键值来源读取配置（空字符串视为未设置）。
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let source = Source { lookup };

        let endpoint = source
            .string("BRIDGE_MQTT_ENDPOINT")
            .unwrap_or_else(|| format!("mqtt://127.0.0.1:{}", DEFAULT_MQTT_PORT));
        let (host, port) = parse_endpoint("BRIDGE_MQTT_ENDPOINT", &endpoint)?;
        let client_id = source
            .string("BRIDGE_MQTT_CLIENT_ID")
            .unwrap_or_else(|| DEFAULT_CLIENT_ID.to_string());
        let qos = source.parse_or("BRIDGE_MQTT_QOS", 1u8)?;
        if qos > 2 {
            return Err(ConfigError::Invalid(
                "BRIDGE_MQTT_QOS".to_string(),
                qos.to_string(),
            ));
        }
        let reconnect_jitter = source.parse_or("BRIDGE_RECONNECT_JITTER", 0.5f64)?;
        if !(0.0..=1.0).contains(&reconnect_jitter) {
            return Err(ConfigError::Invalid(
                "BRIDGE_RECONNECT_JITTER".to_string(),
                reconnect_jitter.to_string(),
            ));
        }
        let broker = BrokerConfig {
            host,
            port,
            username: source.string("BRIDGE_MQTT_USERNAME"),
            password: source.string("BRIDGE_MQTT_PASSWORD"),
            qos,
            keep_alive_seconds: source.parse_or("BRIDGE_MQTT_KEEP_ALIVE_SECONDS", 30)?,
            connect_timeout_ms: source.parse_or("BRIDGE_MQTT_CONNECT_TIMEOUT_MS", 10_000)?,
            reconnect_base_ms: source.parse_or("BRIDGE_RECONNECT_BASE_MS", 1_000)?,
            reconnect_max_ms: source.parse_or("BRIDGE_RECONNECT_MAX_MS", 60_000)?,
            reconnect_jitter,
            client_id: client_id.clone(),
        };

        let device_id = source.string("BRIDGE_DEVICE_ID").unwrap_or(client_id);
        let topics = match source.string("BRIDGE_TOPICS") {
            Some(raw) => parse_topics(&raw)?,
            None => default_topics(),
        };

        let buffer = BufferSettings {
            max_batch_size: source.positive_or("BRIDGE_BUFFER_MAX_BATCH_SIZE", 100)?,
            max_batch_age_ms: source.positive_or("BRIDGE_BUFFER_MAX_BATCH_AGE_MS", 5_000)?,
            max_batch_bytes: source.positive_or("BRIDGE_BUFFER_MAX_BATCH_BYTES", 1_048_576)?,
            high_water_mark: source.positive_or("BRIDGE_BUFFER_HIGH_WATER_MARK", 10_000)?,
            max_retries: source.parse_or("BRIDGE_BUFFER_MAX_RETRIES", 5)?,
            backoff_base_ms: source.parse_or("BRIDGE_BUFFER_BACKOFF_BASE_MS", 500)?,
            backoff_max_ms: source.parse_or("BRIDGE_BUFFER_BACKOFF_MAX_MS", 30_000)?,
            write_concurrency: source.positive_or("BRIDGE_BUFFER_WRITE_CONCURRENCY", 1)?,
        };

        let url = source
            .string("BRIDGE_STORAGE_URL")
            .ok_or_else(|| ConfigError::Missing("BRIDGE_STORAGE_URL".to_string()))?;
        let database = source
            .string("BRIDGE_STORAGE_DATABASE")
            .unwrap_or_else(|| "iot_monitoring".to_string());
        if !is_identifier(&database) {
            return Err(ConfigError::Invalid(
                "BRIDGE_STORAGE_DATABASE".to_string(),
                database,
            ));
        }
        let storage = StorageConfig {
            url,
            database,
            username: source.string("BRIDGE_STORAGE_USERNAME"),
            password: source.string("BRIDGE_STORAGE_PASSWORD"),
            write_timeout_ms: source.positive_or("BRIDGE_STORAGE_WRITE_TIMEOUT_MS", 5_000)?,
            startup_retries: source.parse_or("BRIDGE_STORAGE_STARTUP_RETRIES", 5)?,
        };

        Ok(Self {
            broker,
            device_id,
            topics,
            buffer,
            storage,
            shutdown_grace_ms: source.parse_or("BRIDGE_SHUTDOWN_GRACE_MS", 10_000)?,
            dead_letter_path: source.string("BRIDGE_DEAD_LETTER_PATH"),
        })
    }
}

/// 默认 topic 规则：DHT 传感器的数据与状态通道。
pub fn default_topics() -> Vec<TopicConfig> {
    vec![
        TopicConfig {
            pattern: "/sensor/dht/data".to_string(),
            kind: TopicKind::Data,
            fields: vec!["temperature".to_string(), "humidity".to_string()],
            required: vec!["temperature".to_string(), "humidity".to_string()],
            device_id: None,
            tags: BTreeMap::new(),
        },
        TopicConfig {
            pattern: "/sensor/dht/status".to_string(),
            kind: TopicKind::Status,
            fields: Vec::new(),
            required: Vec::new(),
            device_id: None,
            tags: BTreeMap::new(),
        },
    ]
}

/// 解析 `BRIDGE_TOPICS`（JSON 数组）并校验每条规则。
pub fn parse_topics(raw: &str) -> Result<Vec<TopicConfig>, ConfigError> {
    let invalid = |reason: String| ConfigError::Invalid("BRIDGE_TOPICS".to_string(), reason);
    let topics: Vec<TopicConfig> =
        serde_json::from_str(raw).map_err(|err| invalid(err.to_string()))?;
    if topics.is_empty() {
        return Err(invalid("no topics configured".to_string()));
    }
    for topic in &topics {
        if !valid_filter(&topic.pattern) {
            return Err(invalid(format!("bad pattern {}", topic.pattern)));
        }
        if topic.kind == TopicKind::Data {
            if topic.fields.is_empty() || topic.fields.iter().any(|f| f.is_empty()) {
                return Err(invalid(format!("{} has no field names", topic.pattern)));
            }
            if let Some(extra) = topic.required.iter().find(|r| !topic.fields.contains(*r)) {
                return Err(invalid(format!(
                    "{} requires undeclared field {}",
                    topic.pattern, extra
                )));
            }
        }
    }
    Ok(topics)
}

/// 解析 `mqtt://host:port` / `tcp://host:port` / `host[:port]`。
fn parse_endpoint(key: &str, endpoint: &str) -> Result<(String, u16), ConfigError> {
    let invalid = || ConfigError::Invalid(key.to_string(), endpoint.to_string());
    let rest = match endpoint.split_once("://") {
        Some(("mqtt" | "tcp", rest)) => rest,
        Some(_) => return Err(invalid()),
        None => endpoint,
    };
    let rest = rest.trim_end_matches('/');
    let (host, port) = match rest.rsplit_once(':') {
        Some((host, port)) => (host, port.parse::<u16>().map_err(|_| invalid())?),
        None => (rest, DEFAULT_MQTT_PORT),
    };
    if host.is_empty() {
        return Err(invalid());
    }
    Ok((host.to_string(), port))
}

fn is_identifier(value: &str) -> bool {
    let mut chars = value.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

struct Source<F> {
    lookup: F,
}

impl<F> Source<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, key: &str) -> Option<String> {
        match (self.lookup)(key) {
            Some(value) if !value.is_empty() => Some(value),
            _ => None,
        }
    }

    fn parse_or<T: std::str::FromStr>(&self, key: &str, default: T) -> Result<T, ConfigError> {
        let value = match self.string(key) {
            Some(value) => value,
            None => return Ok(default),
        };
        value
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::Invalid(key.to_string(), value))
    }

    fn positive_or<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: std::str::FromStr + PartialEq + Default + ToString,
    {
        let value = self.parse_or(key, default)?;
        if value == T::default() {
            return Err(ConfigError::Invalid(key.to_string(), value.to_string()));
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_forms() {
        assert_eq!(
            parse_endpoint("k", "mqtt://broker.local:1884").expect("endpoint"),
            ("broker.local".to_string(), 1884)
        );
        assert_eq!(
            parse_endpoint("k", "broker.local").expect("endpoint"),
            ("broker.local".to_string(), 1883)
        );
        assert!(parse_endpoint("k", "http://broker.local").is_err());
        assert!(parse_endpoint("k", "mqtt://:1883").is_err());
        assert!(parse_endpoint("k", "mqtt://host:port").is_err());
    }

    #[test]
    fn filter_wildcards() {
        assert!(valid_filter("/sensor/+/data"));
        assert!(valid_filter("sensor/#"));
        assert!(!valid_filter("sensor/#/data"));
        assert!(!valid_filter("sensor/a+/data"));
        assert!(!valid_filter(""));
    }

    #[test]
    fn identifiers() {
        assert!(is_identifier("iot_monitoring"));
        assert!(!is_identifier("iot-monitoring"));
        assert!(!is_identifier("1table"));
        assert!(!is_identifier("points; drop table x"));
    }
}
