//! 批次重试策略：指数退避，封顶，无抖动（保证延迟严格递增直到封顶）。

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// 首次写入之外允许的最大重试次数。
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// 第 `failure` 次（从 1 开始）可重试失败后的等待时间：`base * 2^(failure-1)`。
    pub fn delay_for(&self, failure: u32) -> Duration {
        let exponent = failure.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    /// 连续 `failures` 次失败后是否还能再试。
    pub fn allows_retry(&self, failures: u32) -> bool {
        failures <= self.max_retries
    }
}
