use bridge_telemetry::{
    TelemetryMetrics, metrics, record_batch_dead_lettered, record_batch_flushed,
    record_write_latency_ms,
};

#[test]
fn fresh_metrics_are_zero() {
    let metrics = TelemetryMetrics::new();
    assert_eq!(metrics.snapshot(), Default::default());
}

#[test]
fn batch_counters_accumulate_points() {
    let before = metrics().snapshot();
    record_batch_flushed(3);
    record_batch_dead_lettered(2);
    record_write_latency_ms(15);
    let after = metrics().snapshot();

    assert!(after.batches_flushed >= before.batches_flushed + 1);
    assert!(after.points_written >= before.points_written + 3);
    assert!(after.batches_dead_lettered >= before.batches_dead_lettered + 1);
    assert!(after.points_dead_lettered >= before.points_dead_lettered + 2);
    assert!(after.write_latency_ms_total >= before.write_latency_ms_total + 15);
}
