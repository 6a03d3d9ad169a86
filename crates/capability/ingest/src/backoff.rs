//! 重连退避：指数增长、封顶、随机抖动。

use rand_core::{OsRng, RngCore};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectBackoff {
    pub base: Duration,
    pub max: Duration,
    /// 抖动比例（0..=1）：实际延迟落在 `[d * (1 - jitter), d]`。
    pub jitter: f64,
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
            jitter: 0.5,
        }
    }
}

impl ReconnectBackoff {
    /// 第 `attempt` 次（从 1 开始）重连前的等待时间。
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let capped = self.ceiling_for(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return capped;
        }
        let sample = OsRng.next_u32() as f64 / u32::MAX as f64;
        capped.mul_f64(1.0 - jitter * sample)
    }

    /// 不含抖动的延迟上界。
    pub fn ceiling_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base.saturating_mul(1u32 << exponent).min(self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn without_jitter_doubles_until_cap() {
        let backoff = ReconnectBackoff {
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
            jitter: 0.0,
        };
        let delays: Vec<u64> = (1..=8).map(|n| backoff.delay_for(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60]);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let backoff = ReconnectBackoff::default();
        for attempt in 1..=10 {
            let ceiling = backoff.ceiling_for(attempt);
            let delay = backoff.delay_for(attempt);
            assert!(delay <= ceiling);
            assert!(delay >= ceiling.mul_f64(0.5));
        }
    }
}
