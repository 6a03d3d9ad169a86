use async_trait::async_trait;
use domain::RawMessage;

/// 单条报文的处理结果，决定是否确认投递。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// 已进入写缓冲（点位数，状态报文为 0）。
    Accepted(usize),
    /// 已记录并丢弃（解码失败等），照常确认。
    Dropped,
    /// 写缓冲已满，报文未被处理，不确认。
    Backpressure,
}

/// 报文处理器（解码 + 写入缓冲）。
#[async_trait]
pub trait MessageHandler: Send + Sync {
    fn handle(&self, message: &RawMessage) -> Disposition;

    /// 等待写缓冲回落到不超过高水位。
    async fn wait_for_capacity(&self);

    /// 暂存中未能处理的报文在会话结束时交还（clean session 下 broker 不会重投）。
    fn release(&self, message: &RawMessage, reason: &str);
}
