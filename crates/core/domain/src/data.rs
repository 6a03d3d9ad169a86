use serde::Serialize;
use std::collections::BTreeMap;

/// 设备标识 tag 的键名，所有点位都必须携带。
pub const DEVICE_ID_TAG: &str = "deviceId";

/// 估算单点占用字节时附加的固定开销（时间戳 + 容器头）。
const POINT_OVERHEAD_BYTES: usize = 32;

/// 从 broker 收到的原始报文，创建后不再修改。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub received_at_ms: i64,
}

impl RawMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>, received_at_ms: i64) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            received_at_ms,
        }
    }

    /// 报文内容的可读形式（非 UTF-8 字节会被替换），用于日志与死信。
    pub fn payload_lossy(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// 一条待写入时序库的观测值。
///
/// tags 与 fields 使用有序映射，保证同一点位的键序稳定（幂等写入依赖
/// measurement + tags + 时间戳作为主键）。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Point {
    pub measurement: String,
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, f64>,
    pub ts_ms: i64,
}

impl Point {
    pub fn new(measurement: impl Into<String>, ts_ms: i64) -> Self {
        Self {
            measurement: measurement.into(),
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
            ts_ms,
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: f64) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    pub fn device_id(&self) -> Option<&str> {
        self.tags.get(DEVICE_ID_TAG).map(String::as_str)
    }

    /// 粗略估算该点位编码后的字节数（用于按大小触发刷写）。
    pub fn estimated_size(&self) -> usize {
        let tags: usize = self.tags.iter().map(|(k, v)| k.len() + v.len()).sum();
        let fields: usize = self.fields.keys().map(|k| k.len() + 8).sum();
        self.measurement.len() + tags + fields + POINT_OVERHEAD_BYTES
    }
}

/// 一次写入存储的有序点位批次。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BufferedBatch {
    pub id: u64,
    pub points: Vec<Point>,
    pub created_at_ms: i64,
    pub size_bytes: usize,
}

impl BufferedBatch {
    pub fn new(id: u64, created_at_ms: i64) -> Self {
        Self {
            id,
            points: Vec::new(),
            created_at_ms,
            size_bytes: 0,
        }
    }

    /// 追加点位并累计大小估算，保持接收顺序。
    pub fn push(&mut self, point: Point) {
        self.size_bytes += point.estimated_size();
        self.points.push(point);
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}
