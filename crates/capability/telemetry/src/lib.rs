//! 日志初始化与桥接链路计数指标。

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing_subscriber::{EnvFilter, fmt};

/// 指标快照。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub messages_received: u64,
    pub messages_dropped: u64,
    pub points_decoded: u64,
    pub points_accepted: u64,
    pub backpressure_events: u64,
    pub batches_flushed: u64,
    pub points_written: u64,
    pub batch_retries: u64,
    pub batches_dead_lettered: u64,
    pub points_dead_lettered: u64,
    pub messages_dead_lettered: u64,
    pub reconnects: u64,
    pub write_latency_ms_total: u64,
    pub write_latency_ms_count: u64,
}

/// 进程级计数指标。
pub struct TelemetryMetrics {
    messages_received: AtomicU64,
    messages_dropped: AtomicU64,
    points_decoded: AtomicU64,
    points_accepted: AtomicU64,
    backpressure_events: AtomicU64,
    batches_flushed: AtomicU64,
    points_written: AtomicU64,
    batch_retries: AtomicU64,
    batches_dead_lettered: AtomicU64,
    points_dead_lettered: AtomicU64,
    messages_dead_lettered: AtomicU64,
    reconnects: AtomicU64,
    write_latency_ms_total: AtomicU64,
    write_latency_ms_count: AtomicU64,
}

impl TelemetryMetrics {
    pub fn new() -> Self {
        Self {
            messages_received: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
            points_decoded: AtomicU64::new(0),
            points_accepted: AtomicU64::new(0),
            backpressure_events: AtomicU64::new(0),
            batches_flushed: AtomicU64::new(0),
            points_written: AtomicU64::new(0),
            batch_retries: AtomicU64::new(0),
            batches_dead_lettered: AtomicU64::new(0),
            points_dead_lettered: AtomicU64::new(0),
            messages_dead_lettered: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            write_latency_ms_total: AtomicU64::new(0),
            write_latency_ms_count: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            points_decoded: self.points_decoded.load(Ordering::Relaxed),
            points_accepted: self.points_accepted.load(Ordering::Relaxed),
            backpressure_events: self.backpressure_events.load(Ordering::Relaxed),
            batches_flushed: self.batches_flushed.load(Ordering::Relaxed),
            points_written: self.points_written.load(Ordering::Relaxed),
            batch_retries: self.batch_retries.load(Ordering::Relaxed),
            batches_dead_lettered: self.batches_dead_lettered.load(Ordering::Relaxed),
            points_dead_lettered: self.points_dead_lettered.load(Ordering::Relaxed),
            messages_dead_lettered: self.messages_dead_lettered.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            write_latency_ms_total: self.write_latency_ms_total.load(Ordering::Relaxed),
            write_latency_ms_count: self.write_latency_ms_count.load(Ordering::Relaxed),
        }
    }
}

impl Default for TelemetryMetrics {
    fn default() -> Self {
        Self::new()
    }
}

static METRICS: OnceLock<TelemetryMetrics> = OnceLock::new();

/// 获取全局指标实例。
pub fn metrics() -> &'static TelemetryMetrics {
    METRICS.get_or_init(TelemetryMetrics::new)
}

/// 初始化 tracing（默认 info）。
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).try_init();
}

/// 记录收到的 broker 报文。
pub fn record_message_received() {
    metrics().messages_received.fetch_add(1, Ordering::Relaxed);
}

/// 记录解码/校验失败而丢弃的报文。
pub fn record_message_dropped() {
    metrics().messages_dropped.fetch_add(1, Ordering::Relaxed);
}

/// 记录解码产出的点位数。
pub fn record_points_decoded(count: usize) {
    metrics()
        .points_decoded
        .fetch_add(count as u64, Ordering::Relaxed);
}

/// 记录写缓冲接收的点位数。
pub fn record_points_accepted(count: usize) {
    metrics()
        .points_accepted
        .fetch_add(count as u64, Ordering::Relaxed);
}

/// 记录背压（缓冲溢出）次数。
pub fn record_backpressure() {
    metrics().backpressure_events.fetch_add(1, Ordering::Relaxed);
}

/// 记录一次成功的批量写入。
pub fn record_batch_flushed(points: usize) {
    let metrics = metrics();
    metrics.batches_flushed.fetch_add(1, Ordering::Relaxed);
    metrics
        .points_written
        .fetch_add(points as u64, Ordering::Relaxed);
}

/// 记录批次重试次数。
pub fn record_batch_retry() {
    metrics().batch_retries.fetch_add(1, Ordering::Relaxed);
}

/// 记录进入死信的批次。
pub fn record_batch_dead_lettered(points: usize) {
    let metrics = metrics();
    metrics.batches_dead_lettered.fetch_add(1, Ordering::Relaxed);
    metrics
        .points_dead_lettered
        .fetch_add(points as u64, Ordering::Relaxed);
}

/// 记录进入死信的原始报文。
pub fn record_message_dead_lettered() {
    metrics()
        .messages_dead_lettered
        .fetch_add(1, Ordering::Relaxed);
}

/// 记录 broker 重连次数。
pub fn record_reconnect() {
    metrics().reconnects.fetch_add(1, Ordering::Relaxed);
}

/// 记录写入延迟（毫秒）。
pub fn record_write_latency_ms(latency_ms: u64) {
    let metrics = metrics();
    metrics
        .write_latency_ms_total
        .fetch_add(latency_ms, Ordering::Relaxed);
    metrics
        .write_latency_ms_count
        .fetch_add(1, Ordering::Relaxed);
}
