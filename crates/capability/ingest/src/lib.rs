//! # Bridge Ingest 模块
//!
//! broker 连接的投递监督：
//!
//! - [`supervisor`]：`DeliverySupervisor` 连接状态机（重连退避、订阅恢复、背压暂停）
//! - [`transport`]：`BrokerTransport` 传输抽象
//! - [`mqtt`]：rumqttc 实现
//! - [`backoff`]：重连退避
//! - [`handler`]：报文处理器接口

pub mod backoff;
pub mod handler;
pub mod mqtt;
pub mod state;
pub mod supervisor;
pub mod transport;

use std::time::Duration;

pub use backoff::ReconnectBackoff;
pub use handler::{Disposition, MessageHandler};
pub use mqtt::{MqttTransport, MqttTransportConfig};
pub use state::ConnectionState;
pub use supervisor::DeliverySupervisor;
pub use transport::{BrokerTransport, DeliveryId, InboundMessage, QoS, TransportEvent, qos_from_u8};

/// 连接错误（可自愈，驱动重连退避）。
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConnectionError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("connection rejected by broker: {0}")]
    Rejected(String),
    #[error("connect timed out after {0:?}")]
    Timeout(Duration),
    #[error("subscription change for {filter} failed: {reason}")]
    Subscribe { filter: String, reason: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("not connected")]
    NotConnected,
    #[error("no subscriptions configured")]
    NoSubscriptions,
}
