//! 写缓冲的刷写任务
//!
//! 独立任务持有打开中的批次、待写/待重试队列与写入中的批次：
//! - 批次在点数达到 `max_batch_size`、大小达到 `max_batch_bytes`、
//!   打开时长达到 `max_batch_age` 或收到停机指令时关闭；
//! - 关闭的批次按关闭顺序排队写入，`write_concurrency == 1` 时只写队首，
//!   队首重试期间后续批次等待（保持写入顺序）；大于 1 时为宽松模式，不保证批次间顺序；
//! - Retryable 失败按 `RetryPolicy` 退避后重试，超过 `max_retries` 或 Fatal 失败进入死信。

use crate::buffer::Capacity;
use crate::dead_letter::{DeadLetter, DeadLetterSink};
use crate::{BufferConfig, DrainReport, FlushOutcome};
use bridge_storage::{BatchSink, SinkError};
use bridge_telemetry::{record_batch_dead_lettered, record_batch_flushed, record_batch_retry};
use domain::{BufferedBatch, Point, now_epoch_ms};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, error, info, warn};

pub(crate) enum Command {
    Points(Vec<Point>),
    Shutdown {
        grace: Duration,
        done: oneshot::Sender<DrainReport>,
    },
}

type Completion = (u64, Result<(), SinkError>);

/// 写入任务结束时回报结果；任务被中止或 panic 时由 Drop 回报失败，批次不会丢失。
struct CompletionGuard {
    batch_id: u64,
    tx: mpsc::UnboundedSender<Completion>,
    reported: bool,
}

impl CompletionGuard {
    fn report(mut self, result: Result<(), SinkError>) {
        self.reported = true;
        let _ = self.tx.send((self.batch_id, result));
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if !self.reported {
            let _ = self.tx.send((
                self.batch_id,
                Err(SinkError::Retryable("write task aborted".to_string())),
            ));
        }
    }
}

struct OpenBatch {
    batch: BufferedBatch,
    opened_at: Instant,
}

/// 已关闭、等待（重新）写入的批次及其重试记录。
struct PendingBatch {
    batch: Arc<BufferedBatch>,
    failures: u32,
    not_before: Instant,
}

struct InFlight {
    pending: PendingBatch,
    handle: JoinHandle<()>,
}

pub(crate) struct FlushWorker {
    config: BufferConfig,
    sink: Arc<dyn BatchSink>,
    dead_letter: Arc<dyn DeadLetterSink>,
    capacity: Arc<Capacity>,
    open: Option<OpenBatch>,
    queue: VecDeque<PendingBatch>,
    in_flight: HashMap<u64, InFlight>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions_rx: mpsc::UnboundedReceiver<Completion>,
    next_batch_id: u64,
    report: DrainReport,
}

impl FlushWorker {
    pub(crate) fn new(
        config: BufferConfig,
        sink: Arc<dyn BatchSink>,
        dead_letter: Arc<dyn DeadLetterSink>,
        capacity: Arc<Capacity>,
    ) -> Self {
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        Self {
            config,
            sink,
            dead_letter,
            capacity,
            open: None,
            queue: VecDeque::new(),
            in_flight: HashMap::new(),
            completions_tx,
            completions_rx,
            next_batch_id: 1,
            report: DrainReport::default(),
        }
    }

    pub(crate) async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        loop {
            let now = Instant::now();
            self.close_if_aged(now);
            self.dispatch(now);
            let wake = self.next_wake(now);
            tokio::select! {
                command = rx.recv() => match command {
                    Some(Command::Points(points)) => self.push_points(points),
                    Some(Command::Shutdown { grace, done }) => {
                        let report = self.drain(&mut rx, grace).await;
                        let _ = done.send(report);
                        return;
                    }
                    None => {
                        let grace = self.config.shutdown_grace;
                        self.drain(&mut rx, grace).await;
                        return;
                    }
                },
                Some((batch_id, result)) = self.completions_rx.recv(), if !self.in_flight.is_empty() => {
                    if let Some(outcome) = self.complete(batch_id, result, Instant::now()) {
                        debug!(target: "bridge.pipeline", batch_id = batch_id, outcome = ?outcome, "flush_completed");
                    }
                }
                _ = sleep_until(wake.unwrap_or(now)), if wake.is_some() => {}
            }
        }
    }

    fn push_points(&mut self, points: Vec<Point>) {
        for point in points {
            let open = self.open.get_or_insert_with(|| {
                let id = self.next_batch_id;
                self.next_batch_id += 1;
                OpenBatch {
                    batch: BufferedBatch::new(id, now_epoch_ms()),
                    opened_at: Instant::now(),
                }
            });
            open.batch.push(point);
            if open.batch.len() >= self.config.max_batch_size {
                self.close_open("size");
            } else if open.batch.size_bytes >= self.config.max_batch_bytes {
                self.close_open("bytes");
            }
        }
    }

    fn close_if_aged(&mut self, now: Instant) {
        let aged = self
            .open
            .as_ref()
            .is_some_and(|open| now >= open.opened_at + self.config.max_batch_age);
        if aged {
            self.close_open("age");
        }
    }

    fn close_open(&mut self, trigger: &'static str) {
        let Some(open) = self.open.take() else {
            return;
        };
        debug!(
            target: "bridge.pipeline",
            batch_id = open.batch.id,
            points = open.batch.len(),
            size_bytes = open.batch.size_bytes,
            trigger = trigger,
            "batch_closed"
        );
        self.queue.push_back(PendingBatch {
            batch: Arc::new(open.batch),
            failures: 0,
            not_before: Instant::now(),
        });
    }

    fn ordered(&self) -> bool {
        self.config.write_concurrency <= 1
    }

    /// 在并发上限内启动所有到期批次的写入。
    fn dispatch(&mut self, now: Instant) {
        while self.in_flight.len() < self.config.write_concurrency {
            let index = if self.ordered() {
                self.queue
                    .front()
                    .filter(|pending| pending.not_before <= now)
                    .map(|_| 0)
            } else {
                self.queue
                    .iter()
                    .position(|pending| pending.not_before <= now)
            };
            let Some(pending) = index.and_then(|index| self.queue.remove(index)) else {
                return;
            };
            self.spawn_write(pending);
        }
    }

    fn spawn_write(&mut self, pending: PendingBatch) {
        let batch = pending.batch.clone();
        let sink = self.sink.clone();
        let guard = CompletionGuard {
            batch_id: batch.id,
            tx: self.completions_tx.clone(),
            reported: false,
        };
        debug!(
            target: "bridge.pipeline",
            batch_id = batch.id,
            points = batch.len(),
            attempt = pending.failures + 1,
            "batch_write_started"
        );
        let handle = tokio::spawn(async move {
            let result = sink.write(&batch).await;
            guard.report(result);
        });
        self.in_flight
            .insert(pending.batch.id, InFlight { pending, handle });
    }

    /// 处理一次写入结果。
    fn complete(
        &mut self,
        batch_id: u64,
        result: Result<(), SinkError>,
        now: Instant,
    ) -> Option<FlushOutcome> {
        let InFlight { mut pending, .. } = self.in_flight.remove(&batch_id)?;
        let attempts = pending.failures + 1;
        let outcome = match result {
            Ok(()) => {
                let points = pending.batch.len();
                record_batch_flushed(points);
                self.capacity.release(points);
                self.report.flushed_batches += 1;
                info!(
                    target: "bridge.pipeline",
                    batch_id = batch_id,
                    points = points,
                    attempts = attempts,
                    "batch_flushed"
                );
                FlushOutcome::Written
            }
            Err(SinkError::Fatal(reason)) => {
                let reason = format!("fatal: {}", reason);
                self.dead_letter(&pending, &reason, attempts);
                FlushOutcome::DeadLettered { reason }
            }
            Err(SinkError::Retryable(reason)) => {
                pending.failures += 1;
                if self.config.retry.allows_retry(pending.failures) {
                    let delay = self.config.retry.delay_for(pending.failures);
                    pending.not_before = now + delay;
                    record_batch_retry();
                    warn!(
                        target: "bridge.pipeline",
                        batch_id = batch_id,
                        failures = pending.failures,
                        delay_ms = delay.as_millis() as u64,
                        error = %reason,
                        "batch_retry_scheduled"
                    );
                    self.requeue(pending);
                    FlushOutcome::RetryScheduled {
                        failures: attempts,
                        delay,
                    }
                } else {
                    let reason = format!("retries exhausted: {}", reason);
                    self.dead_letter(&pending, &reason, attempts);
                    FlushOutcome::DeadLettered { reason }
                }
            }
        };
        Some(outcome)
    }

    /// 按批次编号放回队列，保持关闭顺序。
    fn requeue(&mut self, pending: PendingBatch) {
        let index = self
            .queue
            .iter()
            .position(|queued| queued.batch.id > pending.batch.id)
            .unwrap_or(self.queue.len());
        self.queue.insert(index, pending);
    }

    fn dead_letter(&mut self, pending: &PendingBatch, reason: &str, attempts: u32) {
        let points = pending.batch.len();
        error!(
            target: "bridge.pipeline",
            batch_id = pending.batch.id,
            points = points,
            attempts = attempts,
            reason = %reason,
            "batch_dead_lettered"
        );
        self.dead_letter
            .record(DeadLetter::batch(&pending.batch, reason, attempts));
        record_batch_dead_lettered(points);
        self.capacity.release(points);
        self.report.dead_lettered_batches += 1;
        self.report.dead_lettered_points += points;
    }

    /// 下一次需要醒来的时刻：打开批次到龄，或有空闲并发槽时最早可重试的批次。
    fn next_wake(&self, now: Instant) -> Option<Instant> {
        let aged = self
            .open
            .as_ref()
            .map(|open| open.opened_at + self.config.max_batch_age);
        let retry = if self.in_flight.len() < self.config.write_concurrency {
            if self.ordered() {
                self.queue.front().map(|pending| pending.not_before)
            } else {
                self.queue.iter().map(|pending| pending.not_before).min()
            }
        } else {
            None
        };
        [aged, retry]
            .into_iter()
            .flatten()
            .filter(|at| *at > now)
            .min()
    }

    async fn drain(&mut self, rx: &mut mpsc::Receiver<Command>, grace: Duration) -> DrainReport {
        rx.close();
        while let Ok(command) = rx.try_recv() {
            match command {
                Command::Points(points) => self.push_points(points),
                Command::Shutdown { done, .. } => {
                    // 重复的停机请求只会收到空报告。
                    let _ = done.send(DrainReport::default());
                }
            }
        }
        self.close_open("shutdown");
        let deadline = Instant::now() + grace;
        info!(
            target: "bridge.pipeline",
            queued = self.queue.len(),
            in_flight = self.in_flight.len(),
            grace_ms = grace.as_millis() as u64,
            "buffer_draining"
        );

        loop {
            if self.queue.is_empty() && self.in_flight.is_empty() {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                self.report.timed_out = true;
                break;
            }
            self.dispatch(now);
            let wake = self.next_wake(now).map_or(deadline, |at| at.min(deadline));
            tokio::select! {
                Some((batch_id, result)) = self.completions_rx.recv(), if !self.in_flight.is_empty() => {
                    self.complete(batch_id, result, Instant::now());
                }
                _ = sleep_until(wake) => {}
            }
        }

        let in_flight: Vec<InFlight> = self.in_flight.drain().map(|(_, entry)| entry).collect();
        for entry in in_flight {
            entry.handle.abort();
            let attempts = entry.pending.failures + 1;
            self.dead_letter(&entry.pending, "shutdown: write still in flight", attempts);
        }
        let queued: Vec<PendingBatch> = self.queue.drain(..).collect();
        for pending in queued {
            self.dead_letter(&pending, "shutdown: grace period elapsed", pending.failures);
        }

        let report = self.report.clone();
        info!(
            target: "bridge.pipeline",
            flushed_batches = report.flushed_batches,
            dead_lettered_batches = report.dead_lettered_batches,
            dead_lettered_points = report.dead_lettered_points,
            timed_out = report.timed_out,
            "buffer_drained"
        );
        report
    }
}
