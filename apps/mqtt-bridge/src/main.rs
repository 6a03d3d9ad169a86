//! MQTT 传感器遥测 → 时序库桥接进程。

mod bridge;

use bridge::BridgeHandler;
use bridge_config::BridgeConfig;
use bridge_decode::Decoder;
use bridge_ingest::{ConnectionError, DeliverySupervisor, MqttTransport, qos_from_u8};
use bridge_pipeline::{DeadLetterSink, JsonLinesDeadLetterSink, LogDeadLetterSink, WriteBuffer};
use bridge_storage::{PgTimeSeriesStore, StorageError, StorageSink, TimeSeriesStore};
use bridge_telemetry::{init_tracing, metrics};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinError;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 加载本地 .env（如存在），便于直接 cargo run 启动
    dotenvy::dotenv().ok();
    // 从环境变量加载运行配置
    let config = BridgeConfig::from_env()?;
    // 初始化结构化日志
    init_tracing();
    info!(
        target: "bridge.app",
        broker_host = %config.broker.host,
        broker_port = config.broker.port,
        client_id = %config.broker.client_id,
        topics = config.topics.len(),
        table = %config.storage.database,
        "bridge_started"
    );

    // 存储目标只在启动时确认一次，重试耗尽则退出
    let store = connect_store(&config).await?;
    let sink = Arc::new(StorageSink::new(
        store,
        Duration::from_millis(config.storage.write_timeout_ms),
    ));
    let dead_letter_file = match config.dead_letter_path.as_deref() {
        Some(path) => Some(Arc::new(JsonLinesDeadLetterSink::open(path)?)),
        None => None,
    };
    let dead_letter: Arc<dyn DeadLetterSink> = match &dead_letter_file {
        Some(file) => file.clone(),
        None => Arc::new(LogDeadLetterSink),
    };
    let (buffer, buffer_task) =
        WriteBuffer::spawn(bridge::buffer_config(&config), sink, dead_letter.clone());

    let decoder = Decoder::new(bridge::topic_rules(&config.topics), config.device_id.clone());
    let subscriptions = decoder.subscriptions();
    let handler = Arc::new(BridgeHandler::new(decoder, buffer.clone(), dead_letter));
    let transport = MqttTransport::new(bridge::transport_config(&config.broker));
    let mut supervisor = DeliverySupervisor::new(
        transport,
        subscriptions,
        bridge::reconnect_backoff(&config.broker),
        handler,
    )
    .with_qos(qos_from_u8(config.broker.qos));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut supervisor_task = tokio::spawn(async move { supervisor.run(shutdown_rx).await });

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!(target: "bridge.app", "shutdown_requested");
            shutdown_tx.send_replace(true);
            log_supervisor_exit((&mut supervisor_task).await);
        }
        exit = &mut supervisor_task => log_supervisor_exit(exit),
    }

    // 监督器已停止接收，缓冲在宽限期内排空
    let grace = Duration::from_millis(config.shutdown_grace_ms);
    let report = buffer.shutdown(grace).await?;
    drop(buffer);
    if let Err(err) = buffer_task.await {
        warn!(target: "bridge.app", error = %err, "buffer_task_failed");
    }
    if let Some(file) = &dead_letter_file {
        file.flush().await;
    }

    let snapshot = metrics().snapshot();
    info!(
        target: "bridge.app",
        flushed_batches = report.flushed_batches,
        dead_lettered_batches = report.dead_lettered_batches,
        dead_lettered_points = report.dead_lettered_points,
        timed_out = report.timed_out,
        messages_received = snapshot.messages_received,
        messages_dropped = snapshot.messages_dropped,
        points_written = snapshot.points_written,
        batch_retries = snapshot.batch_retries,
        reconnects = snapshot.reconnects,
        "bridge_stopped"
    );
    Ok(())
}

/// 连接存储并确认写入目标，按缓冲退避曲线重试 `startup_retries` 次。
async fn connect_store(config: &BridgeConfig) -> Result<Arc<dyn TimeSeriesStore>, StorageError> {
    let policy = bridge::storage_retry_policy(config, config.storage.startup_retries);
    bridge::retry_startup(&policy, || open_store(config)).await
}

async fn open_store(config: &BridgeConfig) -> Result<Arc<dyn TimeSeriesStore>, StorageError> {
    let storage = &config.storage;
    let store = PgTimeSeriesStore::connect(
        &storage.url,
        storage.username.as_deref(),
        storage.password.as_deref(),
        storage.database.clone(),
    )
    .await?;
    let created = store.ensure_target().await?;
    info!(
        target: "bridge.app",
        table = %store.table(),
        created = created,
        "storage_target_ready"
    );
    Ok(Arc::new(store))
}

fn log_supervisor_exit(exit: Result<Result<(), ConnectionError>, JoinError>) {
    match exit {
        Ok(Ok(())) => info!(target: "bridge.app", "supervisor_exited"),
        Ok(Err(err)) => error!(target: "bridge.app", error = %err, "supervisor_failed"),
        Err(err) => error!(target: "bridge.app", error = %err, "supervisor_panicked"),
    }
}
