//! 死信记录
//!
//! 无法投递的数据（重试耗尽或致命错误的批次、解码失败的报文）都会留下一条
//! 带完整内容的记录，便于人工恢复。

use domain::{BufferedBatch, Point, RawMessage, now_epoch_ms};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::error;

/// 一条死信。
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeadLetter {
    Batch {
        id: String,
        batch_id: u64,
        reason: String,
        attempts: u32,
        failed_at_ms: i64,
        points: Vec<Point>,
    },
    Message {
        id: String,
        topic: String,
        payload: String,
        reason: String,
        failed_at_ms: i64,
    },
}

impl DeadLetter {
    pub fn batch(batch: &BufferedBatch, reason: impl Into<String>, attempts: u32) -> Self {
        DeadLetter::Batch {
            id: uuid::Uuid::new_v4().to_string(),
            batch_id: batch.id,
            reason: reason.into(),
            attempts,
            failed_at_ms: now_epoch_ms(),
            points: batch.points.clone(),
        }
    }

    pub fn message(message: &RawMessage, reason: impl Into<String>) -> Self {
        DeadLetter::Message {
            id: uuid::Uuid::new_v4().to_string(),
            topic: message.topic.clone(),
            payload: message.payload_lossy(),
            reason: reason.into(),
            failed_at_ms: now_epoch_ms(),
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            DeadLetter::Batch { reason, .. } | DeadLetter::Message { reason, .. } => reason,
        }
    }

    fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|err| format!("{:?} ({})", self, err))
    }
}

/// 死信落地接口。
pub trait DeadLetterSink: Send + Sync {
    fn record(&self, letter: DeadLetter);
}

/// 仅写日志的死信（默认）。
#[derive(Debug, Default)]
pub struct LogDeadLetterSink;

impl DeadLetterSink for LogDeadLetterSink {
    fn record(&self, letter: DeadLetter) {
        error!(target: "bridge.pipeline", letter = %letter.to_json(), "dead_letter");
    }
}

/// JSON Lines 文件死信，同时写日志。
///
/// 文件追加在独立的写入任务中进行，`record` 只把行送入通道，
/// 不会阻塞 flush 任务或报文处理路径。
pub struct JsonLinesDeadLetterSink {
    writes: mpsc::UnboundedSender<WriteOp>,
}

enum WriteOp {
    Line(String),
    Flush(oneshot::Sender<()>),
}

impl JsonLinesDeadLetterSink {
    /// 打开（或创建）文件并启动写入任务，需在 tokio 运行时内调用。
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let (writes, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_lines(file, rx));
        Ok(Self { writes })
    }

    /// 等待此前记录的死信全部落盘。
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.writes.send(WriteOp::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }
}

impl DeadLetterSink for JsonLinesDeadLetterSink {
    fn record(&self, letter: DeadLetter) {
        let line = letter.to_json();
        error!(target: "bridge.pipeline", letter = %line, "dead_letter");
        if self.writes.send(WriteOp::Line(line)).is_err() {
            error!(target: "bridge.pipeline", "dead_letter_writer_stopped");
        }
    }
}

async fn write_lines(mut file: File, mut rx: mpsc::UnboundedReceiver<WriteOp>) {
    while let Some(op) = rx.recv().await {
        let mut chunk = String::new();
        let mut waiters = Vec::new();
        let mut next = Some(op);
        while let Some(op) = next {
            match op {
                WriteOp::Line(line) => {
                    chunk.push_str(&line);
                    chunk.push('\n');
                }
                WriteOp::Flush(done) => waiters.push(done),
            }
            next = rx.try_recv().ok();
        }

        if !chunk.is_empty() {
            let written = tokio::task::spawn_blocking(move || {
                let result = file
                    .write_all(chunk.as_bytes())
                    .and_then(|()| file.flush());
                (file, result)
            })
            .await;
            match written {
                Ok((returned, result)) => {
                    file = returned;
                    if let Err(err) = result {
                        error!(
                            target: "bridge.pipeline",
                            error = %err,
                            "dead_letter_write_failed"
                        );
                    }
                }
                Err(err) => {
                    error!(target: "bridge.pipeline", error = %err, "dead_letter_writer_failed");
                    return;
                }
            }
        }
        for done in waiters {
            let _ = done.send(());
        }
    }
}

/// 内存死信（测试与演练）。
#[derive(Debug, Default)]
pub struct MemoryDeadLetterSink {
    letters: Mutex<Vec<DeadLetter>>,
}

impl MemoryDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn letters(&self) -> Vec<DeadLetter> {
        self.letters.lock().map(|l| l.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.letters.lock().map(|l| l.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DeadLetterSink for MemoryDeadLetterSink {
    fn record(&self, letter: DeadLetter) {
        if let Ok(mut letters) = self.letters.lock() {
            letters.push(letter);
        }
    }
}
