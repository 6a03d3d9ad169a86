//! 原始报文 → 时序点位解码。
//!
//! 按 topic 规则选择解码方式：数据 topic 把 JSON 对象中每个配置字段展开为
//! 一个独立 measurement 的点位（`fields.value`），状态 topic 只确认不存储。
//! 解码是纯函数，不做 I/O，可并发调用。

pub mod topic;

use domain::{DEVICE_ID_TAG, Point, RawMessage, ValidationError};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub use topic::topic_matches;

/// 每个点位承载读数的 field 名。
pub const VALUE_FIELD: &str = "value";

const TIMESTAMP_KEYS: [&str; 3] = ["timestamp", "ts", "tsMs"];

/// 解码错误（单条报文级别，不影响后续报文）。
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("unknown topic: {0}")]
    UnknownTopic(String),
    #[error("missing fields: {}", .0.join(", "))]
    MissingField(Vec<String>),
    #[error("invalid field {field}: {reason}")]
    InvalidField { field: String, reason: String },
    #[error("invalid point: {0}")]
    Invalid(#[from] ValidationError),
}

/// 数据 topic 的解码规则。
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataRule {
    /// 期望的读数字段，每个字段对应一个 measurement。
    pub fields: Vec<String>,
    /// 必须出现的字段（`fields` 的子集）。
    pub required: Vec<String>,
    pub device_id: Option<String>,
    /// 追加到每个点位的静态 tag。
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecodeStrategy {
    Data(DataRule),
    Status,
}

/// topic 过滤器与解码方式的绑定。
#[derive(Debug, Clone, PartialEq)]
pub struct TopicRule {
    pub filter: String,
    pub strategy: DecodeStrategy,
}

impl TopicRule {
    pub fn data(filter: impl Into<String>, rule: DataRule) -> Self {
        Self {
            filter: filter.into(),
            strategy: DecodeStrategy::Data(rule),
        }
    }

    pub fn status(filter: impl Into<String>) -> Self {
        Self {
            filter: filter.into(),
            strategy: DecodeStrategy::Status,
        }
    }
}

/// RawMessage → Point 解码器。
#[derive(Debug, Clone)]
pub struct Decoder {
    rules: Vec<TopicRule>,
    default_device_id: String,
}

impl Decoder {
    pub fn new(rules: Vec<TopicRule>, default_device_id: impl Into<String>) -> Self {
        Self {
            rules,
            default_device_id: default_device_id.into(),
        }
    }

    /// 需要订阅的 topic 过滤器（按规则顺序）。
    pub fn subscriptions(&self) -> Vec<String> {
        self.rules.iter().map(|rule| rule.filter.clone()).collect()
    }

    /// 按第一条匹配的规则解码报文。
    pub fn decode(&self, message: &RawMessage) -> Result<Vec<Point>, DecodeError> {
        let rule = self
            .rules
            .iter()
            .find(|rule| topic_matches(&rule.filter, message.topic.trim()))
            .ok_or_else(|| DecodeError::UnknownTopic(message.topic.clone()))?;
        match &rule.strategy {
            DecodeStrategy::Status => Ok(Vec::new()),
            DecodeStrategy::Data(data) => self.decode_data(data, message),
        }
    }

    fn decode_data(&self, rule: &DataRule, message: &RawMessage) -> Result<Vec<Point>, DecodeError> {
        let document: Value = serde_json::from_slice(&message.payload)
            .map_err(|err| DecodeError::Malformed(err.to_string()))?;
        let Value::Object(object) = document else {
            return Err(DecodeError::Malformed(
                "payload is not a JSON object".to_string(),
            ));
        };

        let missing: Vec<String> = rule
            .required
            .iter()
            .filter(|field| present(&object, field).is_none())
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(DecodeError::MissingField(missing));
        }

        let ts_ms = payload_timestamp(&object)?.unwrap_or(message.received_at_ms);
        let device_id = match object.get(DEVICE_ID_TAG) {
            Some(Value::String(id)) if !id.is_empty() => id.as_str(),
            _ => rule
                .device_id
                .as_deref()
                .unwrap_or(self.default_device_id.as_str()),
        };

        let mut points = Vec::with_capacity(rule.fields.len());
        for field in &rule.fields {
            let Some(value) = present(&object, field) else {
                continue;
            };
            let reading = value.as_f64().ok_or_else(|| DecodeError::InvalidField {
                field: field.clone(),
                reason: format!("expected a number, got {}", value),
            })?;
            let mut point = Point::new(field.clone(), ts_ms);
            point.tags = rule.tags.clone();
            point.tags.insert(DEVICE_ID_TAG.to_string(), device_id.to_string());
            point.fields.insert(VALUE_FIELD.to_string(), reading);
            point.validate()?;
            points.push(point);
        }

        // 数据 topic 一个读数都没有时视为缺字段，而不是静默确认。
        if points.is_empty() {
            return Err(DecodeError::MissingField(rule.fields.clone()));
        }
        Ok(points)
    }
}

fn present<'a>(object: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    object.get(key).filter(|value| !value.is_null())
}

/// 读取报文自带的毫秒时间戳；不存在时返回 `None`。
fn payload_timestamp(object: &Map<String, Value>) -> Result<Option<i64>, DecodeError> {
    for key in TIMESTAMP_KEYS {
        let Some(value) = present(object, key) else {
            continue;
        };
        return match value.as_i64() {
            Some(ts_ms) if ts_ms > 0 => Ok(Some(ts_ms)),
            _ => Err(DecodeError::InvalidField {
                field: key.to_string(),
                reason: format!("expected epoch milliseconds, got {}", value),
            }),
        };
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dht_decoder() -> Decoder {
        Decoder::new(
            vec![
                TopicRule::data(
                    "/sensor/+/data",
                    DataRule {
                        fields: vec!["temperature".to_string(), "humidity".to_string()],
                        required: vec!["temperature".to_string()],
                        ..Default::default()
                    },
                ),
                TopicRule::status("/sensor/+/status"),
            ],
            "dht-sensor01",
        )
    }

    #[test]
    fn payload_timestamp_overrides_receipt_time() {
        let message = RawMessage::new(
            "/sensor/dht/data",
            br#"{"temperature": 20.0, "timestamp": 1700000000000}"#.to_vec(),
            5,
        );
        let points = dht_decoder().decode(&message).expect("decode");
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].ts_ms, 1_700_000_000_000);
    }

    #[test]
    fn bad_timestamp_is_invalid_field() {
        let message = RawMessage::new(
            "/sensor/dht/data",
            br#"{"temperature": 20.0, "ts": "yesterday"}"#.to_vec(),
            5,
        );
        let err = dht_decoder().decode(&message).expect_err("bad ts");
        assert!(matches!(err, DecodeError::InvalidField { field, .. } if field == "ts"));
    }

    #[test]
    fn payload_device_id_overrides_default() {
        let message = RawMessage::new(
            "/sensor/dht/data",
            br#"{"temperature": 20.0, "deviceId": "dht-sensor07"}"#.to_vec(),
            5,
        );
        let points = dht_decoder().decode(&message).expect("decode");
        assert_eq!(points[0].device_id(), Some("dht-sensor07"));
    }

    #[test]
    fn non_numeric_reading_rejected() {
        let message = RawMessage::new(
            "/sensor/dht/data",
            br#"{"temperature": 20.0, "humidity": "wet"}"#.to_vec(),
            5,
        );
        let err = dht_decoder().decode(&message).expect_err("non numeric");
        assert!(matches!(err, DecodeError::InvalidField { field, .. } if field == "humidity"));
    }

    #[test]
    fn null_required_field_counts_as_missing() {
        let message = RawMessage::new(
            "/sensor/dht/data",
            br#"{"temperature": null, "humidity": 40}"#.to_vec(),
            5,
        );
        let err = dht_decoder().decode(&message).expect_err("missing");
        assert_eq!(err, DecodeError::MissingField(vec!["temperature".to_string()]));
    }

    #[test]
    fn non_object_payload_is_malformed() {
        let message = RawMessage::new("/sensor/dht/data", b"[1, 2]".to_vec(), 5);
        let err = dht_decoder().decode(&message).expect_err("array");
        assert!(matches!(err, DecodeError::Malformed(_)));
    }

    #[test]
    fn subscriptions_follow_rule_order() {
        assert_eq!(
            dht_decoder().subscriptions(),
            vec!["/sensor/+/data".to_string(), "/sensor/+/status".to_string()]
        );
    }
}
