//! 写缓冲的接收端：背压计数与有界交接通道。

use crate::worker::Command;
use crate::{BufferError, DrainReport};
use bridge_telemetry::record_points_accepted;
use domain::Point;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, mpsc, oneshot};

/// 等待刷写的点位计数（打开批次 + 排队/重试中/写入中的批次 + 通道内）。
pub(crate) struct Capacity {
    pending: AtomicUsize,
    high_water_mark: usize,
    notify: Notify,
}

impl Capacity {
    pub(crate) fn new(high_water_mark: usize) -> Self {
        Self {
            pending: AtomicUsize::new(0),
            high_water_mark,
            notify: Notify::new(),
        }
    }

    /// 预占 `count` 个名额；计数已超过高水位时返回当前计数。
    ///
    /// 未超过高水位时整组放行（计数可能越过水位线最多一组），与 `has_capacity`
    /// 判定一致，暂停中的调用方被唤醒后重试必然成功。
    fn try_reserve(&self, count: usize) -> Result<(), usize> {
        self.pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                if current > self.high_water_mark {
                    None
                } else {
                    Some(current + count)
                }
            })
            .map(|_| ())
    }

    pub(crate) fn release(&self, count: usize) {
        let _ = self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(count))
            });
        self.notify.notify_waiters();
    }

    fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    fn has_capacity(&self) -> bool {
        self.pending() <= self.high_water_mark
    }
}

/// 写缓冲句柄，可克隆，供监督器侧调用。
#[derive(Clone)]
pub struct BufferHandle {
    tx: mpsc::Sender<Command>,
    capacity: Arc<Capacity>,
}

impl BufferHandle {
    pub(crate) fn new(tx: mpsc::Sender<Command>, capacity: Arc<Capacity>) -> Self {
        Self { tx, capacity }
    }

    /// 接收单个点位。
    pub fn accept(&self, point: Point) -> Result<(), BufferError> {
        self.accept_all(vec![point])
    }

    /// 原子地接收一组点位（同一报文解码结果）：要么全部进入缓冲，要么全部拒绝。
    ///
    /// 等待刷写的点位数已超过高水位时返回 `BufferError::Overflow`，
    /// 调用方应暂停消费直到 [`wait_for_capacity`](Self::wait_for_capacity) 返回。
    pub fn accept_all(&self, points: Vec<Point>) -> Result<(), BufferError> {
        if points.is_empty() {
            return Ok(());
        }
        for point in &points {
            point.validate()?;
        }
        let count = points.len();
        self.capacity
            .try_reserve(count)
            .map_err(|pending| BufferError::Overflow {
                pending,
                high_water_mark: self.capacity.high_water_mark,
            })?;
        match self.tx.try_send(Command::Points(points)) {
            Ok(()) => {
                record_points_accepted(count);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.capacity.release(count);
                Err(BufferError::Overflow {
                    pending: self.capacity.pending(),
                    high_water_mark: self.capacity.high_water_mark,
                })
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.capacity.release(count);
                Err(BufferError::Closed)
            }
        }
    }

    /// 当前等待刷写的点位数。
    pub fn pending(&self) -> usize {
        self.capacity.pending()
    }

    pub fn high_water_mark(&self) -> usize {
        self.capacity.high_water_mark
    }

    /// 等待刷写的点位数是否未超过高水位。
    pub fn has_capacity(&self) -> bool {
        self.capacity.has_capacity()
    }

    /// 等待直到点位数回落到不超过高水位。
    pub async fn wait_for_capacity(&self) {
        loop {
            let notified = self.capacity.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.capacity.has_capacity() {
                return;
            }
            notified.await;
        }
    }

    /// 停止接收，在 `grace` 内尽量写完所有批次，剩余批次进入死信。
    pub async fn shutdown(&self, grace: Duration) -> Result<DrainReport, BufferError> {
        let (done, report) = oneshot::channel();
        self.tx
            .send(Command::Shutdown { grace, done })
            .await
            .map_err(|_| BufferError::Closed)?;
        report.await.map_err(|_| BufferError::Closed)
    }
}
