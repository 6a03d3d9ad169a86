//! 投递监督
//!
//! 状态机：
//! - `Disconnected -> Connecting`：启动
//! - `Connecting -> Connected`：连接成功，重新下发全部订阅
//! - `Connecting -> Backoff`、`Connected -> Backoff`：连接失败或断开
//! - `Backoff -> Connecting`：退避定时器到期
//! - 任意状态收到停机信号 -> `Disconnected`
//!
//! 写缓冲满时取消订阅并暂存已收到的报文（不确认），
//! 缓冲回落后按顺序重投暂存报文，全部接收后恢复订阅。

use crate::backoff::ReconnectBackoff;
use crate::handler::{Disposition, MessageHandler};
use crate::state::ConnectionState;
use crate::transport::{BrokerTransport, InboundMessage, QoS, TransportEvent};
use crate::ConnectionError;
use bridge_telemetry::{record_message_received, record_reconnect};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

enum SessionEnd {
    Shutdown,
    Lost(String),
}

pub struct DeliverySupervisor<T> {
    transport: T,
    subscriptions: Vec<String>,
    qos: QoS,
    backoff: ReconnectBackoff,
    handler: Arc<dyn MessageHandler>,
    state: watch::Sender<ConnectionState>,
}

impl<T: BrokerTransport> DeliverySupervisor<T> {
    pub fn new(
        transport: T,
        subscriptions: Vec<String>,
        backoff: ReconnectBackoff,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            transport,
            subscriptions,
            qos: QoS::AtLeastOnce,
            backoff,
            handler,
            state,
        }
    }

    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// 订阅状态变化。
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// 运行直到 `shutdown` 变为 `true`（或发送端被释放）。
    ///
    /// 连接错误只会触发重连，不会让函数返回错误。
    pub async fn run(
        &mut self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ConnectionError> {
        if self.subscriptions.is_empty() {
            return Err(ConnectionError::NoSubscriptions);
        }
        let mut attempt: u32 = 0;
        loop {
            self.set_state(ConnectionState::Connecting);
            let connected = tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => break,
                result = self.transport.connect() => result,
            };
            let reason = match connected {
                Ok(()) => {
                    attempt = 0;
                    self.set_state(ConnectionState::Connected);
                    match self.subscribe_all().await {
                        Ok(()) => match self.session(&mut shutdown).await {
                            SessionEnd::Shutdown => break,
                            SessionEnd::Lost(reason) => reason,
                        },
                        Err(err) => err.to_string(),
                    }
                }
                Err(err) => err.to_string(),
            };

            attempt = attempt.saturating_add(1);
            let delay = self.backoff.delay_for(attempt);
            self.set_state(ConnectionState::Backoff);
            warn!(
                target: "bridge.ingest",
                attempt = attempt,
                delay_ms = delay.as_millis() as u64,
                reason = %reason,
                "reconnect_scheduled"
            );
            tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown) => break,
                _ = tokio::time::sleep(delay) => {}
            }
            record_reconnect();
        }

        self.transport.disconnect().await;
        self.set_state(ConnectionState::Disconnected);
        info!(target: "bridge.ingest", "supervisor_stopped");
        Ok(())
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!(
                target: "bridge.ingest",
                from = %previous,
                to = %next,
                "connection_state_changed"
            );
        }
    }

    async fn subscribe_all(&mut self) -> Result<(), ConnectionError> {
        for filter in &self.subscriptions {
            self.transport.subscribe(filter, self.qos).await?;
            debug!(target: "bridge.ingest", filter = %filter, "subscribed");
        }
        Ok(())
    }

    async fn unsubscribe_all(&mut self) -> Result<(), ConnectionError> {
        for filter in &self.subscriptions {
            self.transport.unsubscribe(filter).await?;
        }
        Ok(())
    }

    /// 一次已连接会话内的报文循环。
    async fn session(&mut self, shutdown: &mut watch::Receiver<bool>) -> SessionEnd {
        let handler = self.handler.clone();
        let mut held: VecDeque<InboundMessage> = VecDeque::new();
        loop {
            if held.is_empty() {
                let event = tokio::select! {
                    biased;
                    _ = shutdown_requested(shutdown) => return SessionEnd::Shutdown,
                    event = self.transport.next_event() => event,
                };
                match event {
                    TransportEvent::Message(inbound) => {
                        record_message_received();
                        if !self.deliver(&inbound).await {
                            held.push_back(inbound);
                            if let Err(err) = self.unsubscribe_all().await {
                                release_held(handler.as_ref(), &mut held, "unsubscribe failed");
                                return SessionEnd::Lost(err.to_string());
                            }
                            warn!(
                                target: "bridge.ingest",
                                filters = self.subscriptions.len(),
                                "consumption_paused"
                            );
                        }
                    }
                    TransportEvent::Disconnected(reason) => return SessionEnd::Lost(reason),
                }
                continue;
            }

            // 暂停中：继续读取已在途的报文（只暂存），同时等待缓冲回落。
            let event = tokio::select! {
                biased;
                _ = shutdown_requested(shutdown) => {
                    release_held(handler.as_ref(), &mut held, "shutdown while paused");
                    return SessionEnd::Shutdown;
                }
                _ = handler.wait_for_capacity() => None,
                event = self.transport.next_event() => Some(event),
            };
            match event {
                None => {
                    while let Some(inbound) = held.pop_front() {
                        if !self.deliver(&inbound).await {
                            held.push_front(inbound);
                            break;
                        }
                    }
                    if held.is_empty() {
                        if let Err(err) = self.subscribe_all().await {
                            return SessionEnd::Lost(err.to_string());
                        }
                        info!(target: "bridge.ingest", "consumption_resumed");
                    }
                }
                Some(TransportEvent::Message(inbound)) => {
                    record_message_received();
                    held.push_back(inbound);
                }
                Some(TransportEvent::Disconnected(reason)) => {
                    release_held(handler.as_ref(), &mut held, "disconnected while paused");
                    return SessionEnd::Lost(reason);
                }
            }
        }
    }

    /// 交给处理器并在非背压时确认；返回 `false` 表示缓冲已满、报文未处理。
    async fn deliver(&mut self, inbound: &InboundMessage) -> bool {
        let disposition = self.handler.handle(&inbound.message);
        if disposition == Disposition::Backpressure {
            return false;
        }
        debug!(
            target: "bridge.ingest",
            topic = %inbound.message.topic,
            delivery_id = inbound.delivery_id,
            payload_bytes = inbound.message.payload.len(),
            disposition = ?disposition,
            "message_handled"
        );
        if let Err(err) = self.transport.ack(inbound.delivery_id).await {
            warn!(
                target: "bridge.ingest",
                delivery_id = inbound.delivery_id,
                error = %err,
                "ack_failed"
            );
        }
        true
    }
}

/// 会话结束时把未确认的暂存报文逐条交还处理器记录。
fn release_held(
    handler: &dyn MessageHandler,
    held: &mut VecDeque<InboundMessage>,
    reason: &str,
) {
    if held.is_empty() {
        return;
    }
    warn!(
        target: "bridge.ingest",
        held = held.len(),
        reason = reason,
        "held_messages_released"
    );
    for inbound in held.drain(..) {
        handler.release(&inbound.message, reason);
    }
}

/// 停机信号：值变为 `true` 或发送端被释放。
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
