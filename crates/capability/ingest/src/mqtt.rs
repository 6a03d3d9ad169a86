//! 基于 rumqttc 的 MQTT 传输
//!
//! 每次连接创建新的 client 与 eventloop（clean session、手动确认），
//! eventloop 在独立任务中轮询，报文经有界通道交给监督器，
//! 因此 `next_event` 可以安全取消，监督器暂停消费时心跳也不会中断。
//! broker 拒绝订阅（SubAck 失败码）按连接断开处理，由监督器退避后重新订阅。

use crate::transport::{BrokerTransport, DeliveryId, InboundMessage, QoS, TransportEvent};
use crate::ConnectionError;
use async_trait::async_trait;
use domain::{RawMessage, now_epoch_ms};
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, Publish,
    SubAck, SubscribeReasonCode,
};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const EVENT_CHANNEL_CAPACITY: usize = 64;
/// 主动断开时等待 DISCONNECT 发出的时长。
const DISCONNECT_GRACE: Duration = Duration::from_millis(500);

/// MQTT 连接参数。
#[derive(Debug, Clone)]
pub struct MqttTransportConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
}

enum LoopEvent {
    Publish(Publish),
    Closed(String),
}

struct Session {
    client: AsyncClient,
    events: mpsc::Receiver<LoopEvent>,
    poller: JoinHandle<()>,
    unacked: HashMap<DeliveryId, Publish>,
}

pub struct MqttTransport {
    config: MqttTransportConfig,
    session: Option<Session>,
    next_delivery_id: DeliveryId,
}

impl MqttTransport {
    pub fn new(config: MqttTransportConfig) -> Self {
        Self {
            config,
            session: None,
            next_delivery_id: 1,
        }
    }

    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(
            self.config.client_id.clone(),
            self.config.host.clone(),
            self.config.port,
        );
        options.set_keep_alive(self.config.keep_alive);
        options.set_clean_session(true);
        options.set_manual_acks(true);
        if let (Some(username), Some(password)) =
            (self.config.username.as_ref(), self.config.password.as_ref())
        {
            options.set_credentials(username, password);
        }
        options
    }

    fn session(&mut self) -> Result<&mut Session, ConnectionError> {
        self.session.as_mut().ok_or(ConnectionError::NotConnected)
    }

    /// 发送 DISCONNECT 并等待轮询任务把它写出，超时后终止。
    async fn end_session(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        if session.poller.is_finished() {
            return;
        }
        let _ = session.client.try_disconnect();
        if tokio::time::timeout(DISCONNECT_GRACE, &mut session.poller).await.is_err() {
            debug!(target: "bridge.ingest", "disconnect_not_flushed");
            session.poller.abort();
        }
    }

    fn abort_session(&mut self) {
        if let Some(session) = self.session.take() {
            let _ = session.client.try_disconnect();
            session.poller.abort();
        }
    }
}

/// broker 拒绝了其中任一订阅时返回原因。
fn suback_failure(ack: &SubAck) -> Option<String> {
    ack.return_codes
        .iter()
        .any(|code| matches!(code, SubscribeReasonCode::Failure))
        .then(|| format!("subscription rejected (pkid {}): {:?}", ack.pkid, ack.return_codes))
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<(), ConnectionError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return if ack.code == ConnectReturnCode::Success {
                    Ok(())
                } else {
                    Err(ConnectionError::Rejected(format!("{:?}", ack.code)))
                };
            }
            Ok(_) => {}
            Err(err) => return Err(ConnectionError::Connect(err.to_string())),
        }
    }
}

async fn poll_loop(mut eventloop: EventLoop, tx: mpsc::Sender<LoopEvent>) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                if tx.send(LoopEvent::Publish(publish)).await.is_err() {
                    return;
                }
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                if let Some(reason) = suback_failure(&ack) {
                    warn!(target: "bridge.ingest", reason = %reason, "subscription_rejected");
                    let _ = tx.send(LoopEvent::Closed(reason)).await;
                    return;
                }
                debug!(target: "bridge.ingest", pkid = ack.pkid, "subscription_acknowledged");
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                let _ = tx
                    .send(LoopEvent::Closed("broker sent disconnect".to_string()))
                    .await;
                return;
            }
            // 主动断开，DISCONNECT 已写出
            Ok(Event::Outgoing(Outgoing::Disconnect)) => return,
            Ok(event) => {
                debug!(target: "bridge.ingest", event = ?event, "mqtt_event");
            }
            Err(err) => {
                let _ = tx.send(LoopEvent::Closed(err.to_string())).await;
                return;
            }
        }
    }
}

#[async_trait]
impl BrokerTransport for MqttTransport {
    async fn connect(&mut self) -> Result<(), ConnectionError> {
        self.end_session().await;
        let (client, mut eventloop) = AsyncClient::new(self.options(), EVENT_CHANNEL_CAPACITY);
        let timeout = self.config.connect_timeout;
        tokio::time::timeout(timeout, wait_for_connack(&mut eventloop))
            .await
            .map_err(|_| ConnectionError::Timeout(timeout))??;

        let (tx, events) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let poller = tokio::spawn(poll_loop(eventloop, tx));
        self.session = Some(Session {
            client,
            events,
            poller,
            unacked: HashMap::new(),
        });
        Ok(())
    }

    async fn subscribe(&mut self, filter: &str, qos: QoS) -> Result<(), ConnectionError> {
        self.session()?
            .client
            .try_subscribe(filter, qos)
            .map_err(|err| ConnectionError::Subscribe {
                filter: filter.to_string(),
                reason: err.to_string(),
            })
    }

    async fn unsubscribe(&mut self, filter: &str) -> Result<(), ConnectionError> {
        self.session()?
            .client
            .try_unsubscribe(filter)
            .map_err(|err| ConnectionError::Subscribe {
                filter: filter.to_string(),
                reason: err.to_string(),
            })
    }

    async fn next_event(&mut self) -> TransportEvent {
        let Some(session) = self.session.as_mut() else {
            return TransportEvent::Disconnected("not connected".to_string());
        };
        match session.events.recv().await {
            Some(LoopEvent::Publish(publish)) => {
                let delivery_id = self.next_delivery_id;
                self.next_delivery_id += 1;
                let message = RawMessage::new(
                    publish.topic.clone(),
                    publish.payload.to_vec(),
                    now_epoch_ms(),
                );
                session.unacked.insert(delivery_id, publish);
                TransportEvent::Message(InboundMessage {
                    message,
                    delivery_id,
                })
            }
            Some(LoopEvent::Closed(reason)) => {
                self.end_session().await;
                TransportEvent::Disconnected(reason)
            }
            None => {
                self.end_session().await;
                TransportEvent::Disconnected("event loop stopped".to_string())
            }
        }
    }

    async fn ack(&mut self, delivery_id: DeliveryId) -> Result<(), ConnectionError> {
        let session = self.session()?;
        let Some(publish) = session.unacked.remove(&delivery_id) else {
            warn!(target: "bridge.ingest", delivery_id = delivery_id, "unknown_delivery_ack");
            return Ok(());
        };
        session
            .client
            .try_ack(&publish)
            .map_err(|err| ConnectionError::Transport(err.to_string()))
    }

    async fn disconnect(&mut self) {
        self.end_session().await;
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        self.abort_session();
    }
}
