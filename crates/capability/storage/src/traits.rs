//! 存储接口 Trait 定义
//!
//! - TimeSeriesStore：时序库客户端（目标库初始化 + 批量写入）
//! - BatchSink：写缓冲使用的批次写入接口（已完成错误分类）

use crate::error::{SinkError, StorageError};
use async_trait::async_trait;
use domain::{BufferedBatch, Point};

/// 时序库客户端接口
///
/// 同一 measurement + tags + 时间戳的点位必须覆盖写入而不是重复追加，
/// 这样 broker 重复投递不会破坏存储。
#[async_trait]
pub trait TimeSeriesStore: Send + Sync {
    /// 检查写入目标是否存在，不存在则创建；返回是否新建。
    async fn ensure_target(&self) -> Result<bool, StorageError>;

    /// 按顺序写入点位，返回写入条数。
    async fn write_points(&self, points: &[Point]) -> Result<usize, StorageError>;
}

/// 批次写入接口
#[async_trait]
pub trait BatchSink: Send + Sync {
    async fn write(&self, batch: &BufferedBatch) -> Result<(), SinkError>;
}
