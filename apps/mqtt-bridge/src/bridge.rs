//! 桥接链路装配
//!
//! 把配置转换为各组件参数，并实现监督器使用的报文处理器：
//! 报文 → 解码 → 写缓冲；解码失败的报文记录死信后确认，缓冲满时通知监督器暂停。

use async_trait::async_trait;
use bridge_config::{BridgeConfig, BrokerConfig, TopicConfig, TopicKind};
use bridge_decode::{DataRule, Decoder, TopicRule};
use bridge_ingest::{Disposition, MessageHandler, MqttTransportConfig, ReconnectBackoff};
use bridge_pipeline::{
    BufferConfig, BufferError, BufferHandle, DeadLetter, DeadLetterSink, RetryPolicy,
};
use bridge_telemetry::{
    record_backpressure, record_message_dead_lettered, record_message_dropped,
    record_points_decoded,
};
use domain::RawMessage;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// 报文处理器：解码后整组写入缓冲。
pub struct BridgeHandler {
    decoder: Decoder,
    buffer: BufferHandle,
    dead_letter: Arc<dyn DeadLetterSink>,
}

impl BridgeHandler {
    pub fn new(
        decoder: Decoder,
        buffer: BufferHandle,
        dead_letter: Arc<dyn DeadLetterSink>,
    ) -> Self {
        Self {
            decoder,
            buffer,
            dead_letter,
        }
    }

    fn drop_message(&self, message: &RawMessage, reason: String) -> Disposition {
        record_message_dropped();
        warn!(
            target: "bridge.app",
            topic = %message.topic,
            payload = %message.payload_lossy(),
            reason = %reason,
            "message_dropped"
        );
        self.dead_letter.record(DeadLetter::message(message, reason));
        record_message_dead_lettered();
        Disposition::Dropped
    }
}

#[async_trait]
impl MessageHandler for BridgeHandler {
    fn handle(&self, message: &RawMessage) -> Disposition {
        let points = match self.decoder.decode(message) {
            Ok(points) => points,
            Err(err) => return self.drop_message(message, err.to_string()),
        };
        if points.is_empty() {
            debug!(target: "bridge.app", topic = %message.topic, "status_acknowledged");
            return Disposition::Accepted(0);
        }

        let count = points.len();
        match self.buffer.accept_all(points) {
            Ok(()) => {
                record_points_decoded(count);
                Disposition::Accepted(count)
            }
            Err(BufferError::Overflow {
                pending,
                high_water_mark,
            }) => {
                record_backpressure();
                warn!(
                    target: "bridge.app",
                    topic = %message.topic,
                    pending = pending,
                    high_water_mark = high_water_mark,
                    "buffer_overflow"
                );
                Disposition::Backpressure
            }
            Err(err) => self.drop_message(message, err.to_string()),
        }
    }

    async fn wait_for_capacity(&self) {
        self.buffer.wait_for_capacity().await;
    }

    fn release(&self, message: &RawMessage, reason: &str) {
        warn!(
            target: "bridge.app",
            topic = %message.topic,
            payload_bytes = message.payload.len(),
            reason = %reason,
            "held_message_dead_lettered"
        );
        self.dead_letter
            .record(DeadLetter::message(message, format!("released: {reason}")));
        record_message_dead_lettered();
    }
}

/// topic 配置 → 解码规则（保持配置顺序，先匹配者优先）。
pub fn topic_rules(topics: &[TopicConfig]) -> Vec<TopicRule> {
    topics
        .iter()
        .map(|topic| match topic.kind {
            TopicKind::Status => TopicRule::status(topic.pattern.clone()),
            TopicKind::Data => TopicRule::data(
                topic.pattern.clone(),
                DataRule {
                    fields: topic.fields.clone(),
                    required: topic.required.clone(),
                    device_id: topic.device_id.clone(),
                    tags: topic.tags.clone(),
                },
            ),
        })
        .collect()
}

pub fn buffer_config(config: &BridgeConfig) -> BufferConfig {
    let buffer = &config.buffer;
    BufferConfig {
        max_batch_size: buffer.max_batch_size,
        max_batch_age: Duration::from_millis(buffer.max_batch_age_ms),
        max_batch_bytes: buffer.max_batch_bytes,
        high_water_mark: buffer.high_water_mark,
        retry: storage_retry_policy(config, buffer.max_retries),
        write_concurrency: buffer.write_concurrency,
        shutdown_grace: Duration::from_millis(config.shutdown_grace_ms),
    }
}

/// 批次重试与启动时存储探测共用的退避曲线。
pub fn storage_retry_policy(config: &BridgeConfig, max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        base_delay: Duration::from_millis(config.buffer.backoff_base_ms),
        max_delay: Duration::from_millis(config.buffer.backoff_max_ms),
    }
}

/// 启动阶段的重试：失败后按 `policy` 退避，重试耗尽返回最后一次错误。
pub async fn retry_startup<T, E, F, Fut>(policy: &RetryPolicy, mut attempt: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut failures = 0;
    loop {
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                failures += 1;
                if !policy.allows_retry(failures) {
                    error!(
                        target: "bridge.app",
                        attempts = failures,
                        error = %err,
                        "storage_unavailable"
                    );
                    return Err(err);
                }
                let delay = policy.delay_for(failures);
                warn!(
                    target: "bridge.app",
                    attempt = failures,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "storage_connect_retry"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

pub fn transport_config(broker: &BrokerConfig) -> MqttTransportConfig {
    MqttTransportConfig {
        host: broker.host.clone(),
        port: broker.port,
        client_id: broker.client_id.clone(),
        username: broker.username.clone(),
        password: broker.password.clone(),
        // rumqttc 要求心跳间隔不小于 5 秒
        keep_alive: Duration::from_secs(broker.keep_alive_seconds.max(5)),
        connect_timeout: Duration::from_millis(broker.connect_timeout_ms),
    }
}

pub fn reconnect_backoff(broker: &BrokerConfig) -> ReconnectBackoff {
    ReconnectBackoff {
        base: Duration::from_millis(broker.reconnect_base_ms),
        max: Duration::from_millis(broker.reconnect_max_ms),
        jitter: broker.reconnect_jitter,
    }
}
