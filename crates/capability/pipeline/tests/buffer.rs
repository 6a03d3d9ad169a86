use async_trait::async_trait;
use bridge_pipeline::{
    BufferConfig, BufferError, DeadLetter, MemoryDeadLetterSink, RetryPolicy, WriteBuffer,
};
use bridge_storage::{BatchSink, SinkError};
use domain::{BufferedBatch, DEVICE_ID_TAG, Point};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};
use tokio::time::Instant;

#[derive(Debug)]
struct Attempt {
    batch_id: u64,
    points: usize,
    at: Instant,
    ok: bool,
}

/// 按脚本返回结果的批次写入；脚本耗尽后使用 `fallback`。
struct ScriptedSink {
    script: Mutex<VecDeque<Result<(), SinkError>>>,
    fallback: Result<(), SinkError>,
    gate: Option<Arc<Semaphore>>,
    attempts: mpsc::UnboundedSender<Attempt>,
}

impl ScriptedSink {
    fn new(
        script: Vec<Result<(), SinkError>>,
        fallback: Result<(), SinkError>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Attempt>) {
        Self::build(script, fallback, None)
    }

    fn gated(gate: Arc<Semaphore>) -> (Arc<Self>, mpsc::UnboundedReceiver<Attempt>) {
        Self::build(Vec::new(), Ok(()), Some(gate))
    }

    fn build(
        script: Vec<Result<(), SinkError>>,
        fallback: Result<(), SinkError>,
        gate: Option<Arc<Semaphore>>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Attempt>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = Self {
            script: Mutex::new(script.into()),
            fallback,
            gate,
            attempts: tx,
        };
        (Arc::new(sink), rx)
    }
}

#[async_trait]
impl BatchSink for ScriptedSink {
    async fn write(&self, batch: &BufferedBatch) -> Result<(), SinkError> {
        if let Some(gate) = &self.gate {
            gate.acquire().await.expect("gate").forget();
        }
        let result = self
            .script
            .lock()
            .expect("script")
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        let _ = self.attempts.send(Attempt {
            batch_id: batch.id,
            points: batch.len(),
            at: Instant::now(),
            ok: result.is_ok(),
        });
        result
    }
}

fn reading(value: f64) -> Point {
    Point::new("temperature", 1_700_000_000_000)
        .with_tag(DEVICE_ID_TAG, "dht-sensor01")
        .with_field("value", value)
}

fn config() -> BufferConfig {
    BufferConfig {
        max_batch_size: 100,
        max_batch_age: Duration::from_secs(5),
        high_water_mark: 1_000,
        retry: RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
        },
        ..Default::default()
    }
}

fn retryable() -> Result<(), SinkError> {
    Err(SinkError::Retryable("connection reset".to_string()))
}

async fn wait_until(condition: impl Fn() -> bool) {
    for _ in 0..10_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached");
}

#[tokio::test(start_paused = true)]
async fn count_trigger_flushes_immediately() {
    let (sink, mut attempts) = ScriptedSink::new(Vec::new(), Ok(()));
    let dead = Arc::new(MemoryDeadLetterSink::new());
    let (buffer, _task) = WriteBuffer::spawn(
        BufferConfig {
            max_batch_size: 3,
            ..config()
        },
        sink,
        dead,
    );
    let start = Instant::now();
    for value in [20.0, 21.0, 22.0] {
        buffer.accept(reading(value)).expect("accept");
    }
    let attempt = attempts.recv().await.expect("write");
    assert_eq!(attempt.points, 3);
    assert_eq!(attempt.at - start, Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn age_trigger_flushes_partial_batch() {
    let (sink, mut attempts) = ScriptedSink::new(Vec::new(), Ok(()));
    let dead = Arc::new(MemoryDeadLetterSink::new());
    let (buffer, _task) = WriteBuffer::spawn(config(), sink, dead);
    let start = Instant::now();
    buffer
        .accept_all(vec![reading(20.0), reading(21.0)])
        .expect("accept");
    let attempt = attempts.recv().await.expect("write");
    assert_eq!(attempt.points, 2);
    assert_eq!(attempt.at - start, Duration::from_secs(5));
    let pending = buffer.clone();
    wait_until(move || pending.pending() == 0).await;
}

#[tokio::test(start_paused = true)]
async fn bytes_trigger_closes_batch() {
    let (sink, mut attempts) = ScriptedSink::new(Vec::new(), Ok(()));
    let dead = Arc::new(MemoryDeadLetterSink::new());
    let (buffer, _task) = WriteBuffer::spawn(
        BufferConfig {
            max_batch_bytes: reading(0.0).estimated_size() * 2,
            ..config()
        },
        sink,
        dead,
    );
    let start = Instant::now();
    for value in [20.0, 21.0, 22.0] {
        buffer.accept(reading(value)).expect("accept");
    }
    let first = attempts.recv().await.expect("first write");
    assert_eq!(first.points, 2);
    assert_eq!(first.at - start, Duration::ZERO);
    let second = attempts.recv().await.expect("second write");
    assert_eq!(second.points, 1);
    assert_eq!(second.at - start, Duration::from_secs(5));
}

#[tokio::test(start_paused = true)]
async fn retryable_failures_back_off_exponentially() {
    let (sink, mut attempts) =
        ScriptedSink::new(vec![retryable(), retryable(), retryable()], Ok(()));
    let dead = Arc::new(MemoryDeadLetterSink::new());
    let (buffer, _task) = WriteBuffer::spawn(
        BufferConfig {
            max_batch_size: 1,
            ..config()
        },
        sink,
        dead.clone(),
    );
    buffer.accept(reading(20.0)).expect("accept");

    let mut seen = Vec::new();
    for _ in 0..4 {
        seen.push(attempts.recv().await.expect("attempt"));
    }
    let gaps: Vec<u64> = seen
        .windows(2)
        .map(|pair| (pair[1].at - pair[0].at).as_millis() as u64)
        .collect();
    assert_eq!(gaps, vec![100, 200, 400]);
    assert_eq!(seen.iter().filter(|attempt| attempt.ok).count(), 1);
    assert!(seen.iter().all(|attempt| attempt.batch_id == seen[0].batch_id));

    let pending = buffer.clone();
    wait_until(move || pending.pending() == 0).await;
    assert!(dead.is_empty());
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_dead_letter_batch() {
    let (sink, mut attempts) = ScriptedSink::new(Vec::new(), retryable());
    let dead = Arc::new(MemoryDeadLetterSink::new());
    let (buffer, _task) = WriteBuffer::spawn(
        BufferConfig {
            max_batch_size: 2,
            retry: RetryPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(1),
            },
            ..config()
        },
        sink,
        dead.clone(),
    );
    buffer
        .accept_all(vec![reading(20.0), reading(21.0)])
        .expect("accept");

    let letters = dead.clone();
    wait_until(move || letters.len() == 1).await;
    let mut count = 0;
    while attempts.try_recv().is_ok() {
        count += 1;
    }
    assert_eq!(count, 3);

    match &dead.letters()[0] {
        DeadLetter::Batch {
            attempts, points, reason, ..
        } => {
            assert_eq!(*attempts, 3);
            assert_eq!(points.len(), 2);
            assert!(reason.contains("connection reset"));
        }
        other => panic!("unexpected letter {:?}", other),
    }
    assert_eq!(buffer.pending(), 0);
}

#[tokio::test(start_paused = true)]
async fn fatal_error_dead_letters_without_retry() {
    let (sink, mut attempts) = ScriptedSink::new(
        vec![Err(SinkError::Fatal("permission denied".to_string()))],
        Ok(()),
    );
    let dead = Arc::new(MemoryDeadLetterSink::new());
    let (buffer, _task) = WriteBuffer::spawn(
        BufferConfig {
            max_batch_size: 1,
            ..config()
        },
        sink,
        dead.clone(),
    );
    buffer.accept(reading(20.0)).expect("accept");

    let letters = dead.clone();
    wait_until(move || letters.len() == 1).await;
    assert_eq!(attempts.recv().await.map(|attempt| attempt.ok), Some(false));
    assert!(attempts.try_recv().is_err());
    assert!(dead.letters()[0].reason().starts_with("fatal"));
    assert_eq!(buffer.pending(), 0);
}

#[tokio::test(start_paused = true)]
async fn sequential_writes_keep_batch_order_across_retries() {
    let (sink, mut attempts) = ScriptedSink::new(vec![retryable()], Ok(()));
    let dead = Arc::new(MemoryDeadLetterSink::new());
    let (buffer, _task) = WriteBuffer::spawn(
        BufferConfig {
            max_batch_size: 1,
            ..config()
        },
        sink,
        dead,
    );
    buffer.accept(reading(20.0)).expect("first");
    buffer.accept(reading(21.0)).expect("second");

    let mut order = Vec::new();
    for _ in 0..3 {
        order.push(attempts.recv().await.expect("attempt").batch_id);
    }
    assert_eq!(order[0], order[1]);
    assert!(order[2] > order[0]);
}

#[tokio::test(start_paused = true)]
async fn high_water_mark_applies_backpressure() {
    let gate = Arc::new(Semaphore::new(0));
    let (sink, mut attempts) = ScriptedSink::gated(gate.clone());
    let dead = Arc::new(MemoryDeadLetterSink::new());
    let (buffer, _task) = WriteBuffer::spawn(
        BufferConfig {
            max_batch_size: 2,
            high_water_mark: 4,
            ..config()
        },
        sink,
        dead,
    );

    buffer
        .accept_all(vec![reading(1.0), reading(2.0)])
        .expect("first batch");
    buffer
        .accept_all(vec![reading(3.0), reading(4.0)])
        .expect("second batch");
    buffer.accept(reading(5.0)).expect("at the mark");
    let err = buffer.accept(reading(6.0)).expect_err("overflow");
    assert_eq!(
        err,
        BufferError::Overflow {
            pending: 5,
            high_water_mark: 4
        }
    );
    assert!(!buffer.has_capacity());

    let waiter = {
        let buffer = buffer.clone();
        tokio::spawn(async move { buffer.wait_for_capacity().await })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!waiter.is_finished());

    gate.add_permits(1);
    tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("capacity restored")
        .expect("waiter");
    assert_eq!(attempts.recv().await.map(|attempt| attempt.points), Some(2));
    assert!(buffer.has_capacity());
    assert_eq!(buffer.pending(), 3);
    buffer.accept(reading(6.0)).expect("accepted after drain");
}

#[tokio::test(start_paused = true)]
async fn invalid_point_rejected_at_accept() {
    let (sink, _attempts) = ScriptedSink::new(Vec::new(), Ok(()));
    let dead = Arc::new(MemoryDeadLetterSink::new());
    let (buffer, _task) = WriteBuffer::spawn(config(), sink, dead);

    let err = buffer
        .accept(Point::new("temperature", 1).with_field("value", 1.0))
        .expect_err("no device id");
    assert!(matches!(err, BufferError::Invalid(_)));

    let err = buffer
        .accept_all(vec![reading(1.0), reading(f64::NAN)])
        .expect_err("nan");
    assert!(matches!(err, BufferError::Invalid(_)));
    assert_eq!(buffer.pending(), 0);
}

#[tokio::test(start_paused = true)]
async fn shutdown_flushes_open_batch() {
    let (sink, mut attempts) = ScriptedSink::new(Vec::new(), Ok(()));
    let dead = Arc::new(MemoryDeadLetterSink::new());
    let (buffer, task) = WriteBuffer::spawn(config(), sink, dead.clone());
    let start = Instant::now();
    for value in [20.0, 21.0, 22.0] {
        buffer.accept(reading(value)).expect("accept");
    }

    let report = buffer
        .shutdown(Duration::from_secs(1))
        .await
        .expect("report");
    assert_eq!(report.flushed_batches, 1);
    assert_eq!(report.dead_lettered_batches, 0);
    assert!(!report.timed_out);
    let attempt = attempts.recv().await.expect("write");
    assert_eq!(attempt.points, 3);
    assert!(attempt.at - start < Duration::from_secs(5));
    assert!(dead.is_empty());

    task.await.expect("worker exits");
    assert_eq!(buffer.accept(reading(23.0)), Err(BufferError::Closed));
}

#[tokio::test(start_paused = true)]
async fn shutdown_dead_letters_unwritten_batches() {
    let (sink, _attempts) = ScriptedSink::new(Vec::new(), retryable());
    let dead = Arc::new(MemoryDeadLetterSink::new());
    let (buffer, _task) = WriteBuffer::spawn(
        BufferConfig {
            retry: RetryPolicy {
                max_retries: 5,
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(10),
            },
            ..config()
        },
        sink,
        dead.clone(),
    );
    buffer
        .accept_all(vec![reading(20.0), reading(21.0)])
        .expect("accept");

    let report = buffer
        .shutdown(Duration::from_millis(500))
        .await
        .expect("report");
    assert!(report.timed_out);
    assert_eq!(report.flushed_batches, 0);
    assert_eq!(report.dead_lettered_batches, 1);
    assert_eq!(report.dead_lettered_points, 2);
    assert_eq!(dead.len(), 1);
    assert!(dead.letters()[0].reason().starts_with("shutdown"));
}

/// 记录同时在途的写入数与峰值。
#[derive(Default)]
struct OverlapSink {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    done: AtomicUsize,
}

#[async_trait]
impl BatchSink for OverlapSink {
    async fn write(&self, _batch: &BufferedBatch) -> Result<(), SinkError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.done.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn relaxed_mode_writes_batches_concurrently() {
    let sink = Arc::new(OverlapSink::default());
    let dead = Arc::new(MemoryDeadLetterSink::new());
    let (buffer, _task) = WriteBuffer::spawn(
        BufferConfig {
            max_batch_size: 1,
            write_concurrency: 3,
            ..config()
        },
        sink.clone(),
        dead.clone(),
    );

    for value in 0..5 {
        buffer.accept(reading(value as f64)).expect("accepted");
    }
    wait_until(|| sink.done.load(Ordering::SeqCst) == 5 && buffer.pending() == 0).await;

    assert_eq!(sink.peak.load(Ordering::SeqCst), 3);
    let report = buffer.shutdown(Duration::from_secs(1)).await.expect("drain");
    assert_eq!(report.dead_lettered_batches, 0);
    assert!(dead.is_empty());
}
