//! 时序点位内存实现
//!
//! 以 measurement + tags + 时间戳为主键，与 Postgres 实现的 upsert 语义一致。
//! 仅用于测试与本地演练。

use crate::error::StorageError;
use crate::traits::TimeSeriesStore;
use domain::Point;
use std::collections::BTreeMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

type PointKey = (String, BTreeMap<String, String>, i64);

/// 时序点位内存存储
pub struct InMemoryTimeSeriesStore {
    points: RwLock<BTreeMap<PointKey, BTreeMap<String, f64>>>,
    target_exists: AtomicBool,
    write_calls: AtomicUsize,
}

impl InMemoryTimeSeriesStore {
    pub fn new() -> Self {
        Self {
            points: RwLock::new(BTreeMap::new()),
            target_exists: AtomicBool::new(false),
            write_calls: AtomicUsize::new(0),
        }
    }

    /// 当前存储的唯一点位数量
    pub fn len(&self) -> usize {
        self.points.read().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 调用 `write_points` 的次数（用于测试）
    pub fn write_calls(&self) -> usize {
        self.write_calls.load(Ordering::Relaxed)
    }

    pub fn target_exists(&self) -> bool {
        self.target_exists.load(Ordering::Relaxed)
    }

    /// 按主键顺序导出全部点位
    pub fn snapshot(&self) -> Vec<Point> {
        let Ok(points) = self.points.read() else {
            return Vec::new();
        };
        points
            .iter()
            .map(|((measurement, tags, ts_ms), fields)| Point {
                measurement: measurement.clone(),
                tags: tags.clone(),
                fields: fields.clone(),
                ts_ms: *ts_ms,
            })
            .collect()
    }
}

impl Default for InMemoryTimeSeriesStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl TimeSeriesStore for InMemoryTimeSeriesStore {
    async fn ensure_target(&self) -> Result<bool, StorageError> {
        Ok(!self.target_exists.swap(true, Ordering::Relaxed))
    }

    async fn write_points(&self, points: &[Point]) -> Result<usize, StorageError> {
        self.write_calls.fetch_add(1, Ordering::Relaxed);
        let mut store = self
            .points
            .write()
            .map_err(|_| StorageError::transient("lock failed"))?;
        for point in points {
            let key = (point.measurement.clone(), point.tags.clone(), point.ts_ms);
            store.insert(key, point.fields.clone());
        }
        Ok(points.len())
    }
}
