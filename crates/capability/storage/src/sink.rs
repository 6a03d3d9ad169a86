//! 存储写入适配器
//!
//! 包装 TimeSeriesStore：写入超时、错误分类（Retryable / Fatal）与写入延迟指标。
//! 重试调度由写缓冲负责，这里只做一次写入。

use crate::error::SinkError;
use crate::traits::{BatchSink, TimeSeriesStore};
use async_trait::async_trait;
use bridge_telemetry::record_write_latency_ms;
use domain::BufferedBatch;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Clone)]
pub struct StorageSink {
    store: Arc<dyn TimeSeriesStore>,
    write_timeout: Duration,
}

impl StorageSink {
    pub fn new(store: Arc<dyn TimeSeriesStore>, write_timeout: Duration) -> Self {
        Self {
            store,
            write_timeout,
        }
    }
}

#[async_trait]
impl BatchSink for StorageSink {
    async fn write(&self, batch: &BufferedBatch) -> Result<(), SinkError> {
        if batch.is_empty() {
            return Ok(());
        }
        let started_at = Instant::now();
        let written =
            match tokio::time::timeout(self.write_timeout, self.store.write_points(&batch.points))
                .await
            {
                Ok(result) => result?,
                Err(_) => {
                    return Err(SinkError::Retryable(format!(
                        "write timed out after {}ms",
                        self.write_timeout.as_millis()
                    )));
                }
            };
        let latency_ms = started_at.elapsed().as_millis() as u64;
        record_write_latency_ms(latency_ms);
        debug!(
            target: "bridge.storage",
            batch_id = batch.id,
            written = written,
            size_bytes = batch.size_bytes,
            latency_ms = latency_ms,
            "batch_written"
        );
        Ok(())
    }
}
