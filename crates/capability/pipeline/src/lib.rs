//! # Bridge Pipeline 模块
//!
//! 解码后的点位 → 批次 → 时序库的写缓冲。
//!
//! - [`buffer`]：`BufferHandle`（接收点位、背压、停机排空）
//! - [`retry`]：批次重试退避策略
//! - [`dead_letter`]：死信记录与落地
//!
//! 批次关闭、写入调度、重试与死信都在独立的刷写任务中完成，
//! 调用方只通过 `BufferHandle` 交互，接收点位不会等待写入。

pub mod buffer;
pub mod dead_letter;
pub mod retry;
mod worker;

use bridge_storage::BatchSink;
use domain::ValidationError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub use buffer::BufferHandle;
pub use dead_letter::{
    DeadLetter, DeadLetterSink, JsonLinesDeadLetterSink, LogDeadLetterSink, MemoryDeadLetterSink,
};
pub use retry::RetryPolicy;

/// 写缓冲参数。
#[derive(Debug, Clone)]
pub struct BufferConfig {
    /// 批次点数上限，达到即关闭批次。
    pub max_batch_size: usize,
    /// 批次打开时长上限。
    pub max_batch_age: Duration,
    /// 批次估算字节上限。
    pub max_batch_bytes: usize,
    /// 等待刷写的点位数上限（背压阈值）。
    pub high_water_mark: usize,
    pub retry: RetryPolicy,
    /// 同时写入的批次数；1 表示严格按批次顺序写入。
    pub write_concurrency: usize,
    /// 发送端全部释放时的排空时限。
    pub shutdown_grace: Duration,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            max_batch_age: Duration::from_secs(5),
            max_batch_bytes: 1024 * 1024,
            high_water_mark: 10_000,
            retry: RetryPolicy::default(),
            write_concurrency: 1,
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl BufferConfig {
    fn sanitized(mut self) -> Self {
        if self.max_batch_size == 0 {
            self.max_batch_size = 1;
        }
        if self.max_batch_bytes == 0 {
            self.max_batch_bytes = 1;
        }
        if self.max_batch_age.is_zero() {
            self.max_batch_age = Duration::from_millis(1);
        }
        if self.high_water_mark < self.max_batch_size {
            self.high_water_mark = self.max_batch_size;
        }
        if self.write_concurrency == 0 {
            self.write_concurrency = 1;
        }
        if self.retry.max_delay < self.retry.base_delay {
            self.retry.max_delay = self.retry.base_delay;
        }
        self
    }
}

/// 写缓冲错误。
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BufferError {
    #[error("buffer overflow: {pending} points pending, high water mark {high_water_mark}")]
    Overflow {
        pending: usize,
        high_water_mark: usize,
    },
    #[error("invalid point: {0}")]
    Invalid(#[from] ValidationError),
    #[error("buffer closed")]
    Closed,
}

/// 停机排空结果。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub flushed_batches: usize,
    pub dead_lettered_batches: usize,
    pub dead_lettered_points: usize,
    /// 排空时限内未能写完。
    pub timed_out: bool,
}

/// 一次批次写入的结果。
#[derive(Debug, Clone, PartialEq)]
pub enum FlushOutcome {
    Written,
    RetryScheduled { failures: u32, delay: Duration },
    DeadLettered { reason: String },
}

/// 写缓冲入口。
pub struct WriteBuffer;

impl WriteBuffer {
    /// 启动刷写任务，返回句柄与任务句柄。
    ///
    /// 所有 `BufferHandle` 被释放后，刷写任务按 `shutdown_grace` 排空并退出。
    pub fn spawn(
        config: BufferConfig,
        sink: Arc<dyn BatchSink>,
        dead_letter: Arc<dyn DeadLetterSink>,
    ) -> (BufferHandle, JoinHandle<()>) {
        let config = config.sanitized();
        let capacity = Arc::new(buffer::Capacity::new(config.high_water_mark));
        // 每条命令至少一个点位，计数不超过水位才放行，
        // 在途命令最多 high_water_mark + 1 条，通道不会先于计数被占满。
        let (tx, rx) = mpsc::channel(config.high_water_mark.saturating_add(1));
        let worker = worker::FlushWorker::new(config, sink, dead_letter, capacity.clone());
        let task = tokio::spawn(worker.run(rx));
        (BufferHandle::new(tx, capacity), task)
    }
}
