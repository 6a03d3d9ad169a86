//! Broker 传输抽象：监督器只通过它与 broker 交互，测试可注入脚本化实现。

use crate::ConnectionError;
use async_trait::async_trait;
use domain::RawMessage;

pub use rumqttc::QoS;

/// 投递编号，确认时回传。
pub type DeliveryId = u64;

#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub message: RawMessage,
    pub delivery_id: DeliveryId,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Message(InboundMessage),
    /// 连接断开（broker 断开、网络错误、心跳超时）。
    Disconnected(String),
}

#[async_trait]
pub trait BrokerTransport: Send {
    /// 建立新会话，收到 broker 确认后返回。
    async fn connect(&mut self) -> Result<(), ConnectionError>;

    async fn subscribe(&mut self, filter: &str, qos: QoS) -> Result<(), ConnectionError>;

    async fn unsubscribe(&mut self, filter: &str) -> Result<(), ConnectionError>;

    /// 下一个事件；必须可以安全取消（监督器会与停机信号竞争）。
    async fn next_event(&mut self) -> TransportEvent;

    async fn ack(&mut self, delivery_id: DeliveryId) -> Result<(), ConnectionError>;

    async fn disconnect(&mut self);
}

pub fn qos_from_u8(value: u8) -> QoS {
    match value {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}
