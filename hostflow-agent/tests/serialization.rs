#![allow(unused_crate_dependencies)]
#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use message_queue::{BoundedQueue, PriorityQueue};
use metric_store::MetricStore;

use hostflow_agent::flush::{DropCounters, FlushData, MetricsSnapshot};
use hostflow_agent::sample::JsonSampleHandler;
use hostflow_agent::serializer::{FileEmission, FlushQueue, MetricSerializer, TransmitQueue};
use hostflow_agent::watchdog::Heartbeat;

fn snapshot(ts: u64) -> Arc<MetricsSnapshot> {
    Arc::new(MetricsSnapshot {
        ts,
        ipv4_connections: vec![],
        unix_connections: vec![],
        pipe_connections: vec![],
        files: vec![],
        tracked_threads: 0,
        drops: DropCounters::default(),
    })
}

fn flush_item(ts: u64) -> Arc<FlushData> {
    Arc::new(FlushData::new(ts, snapshot(ts)))
}

fn no_emission() -> FileEmission {
    FileEmission {
        enabled: false,
        as_json: false,
        directory: Utf8PathBuf::from("unused"),
    }
}

fn wait_for_completions(serializer: &MetricSerializer, expected: u64) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while serializer.num_serializations_completed() < expected && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn queue_overflow_drops_then_drain_serializes_everything() {
    let input: Arc<FlushQueue> = Arc::new(BoundedQueue::new(1000));
    let output: Arc<TransmitQueue> = Arc::new(PriorityQueue::new(2000));
    let store = MetricStore::new();

    let mut dropped = 0;
    for i in 0..1001_u64 {
        if !input.put(flush_item(i)) {
            dropped += 1;
        }
    }
    assert_eq!(dropped, 1);
    assert_eq!(input.size(), 1000);

    let mut serializer = MetricSerializer::new(
        Arc::clone(&input),
        Arc::clone(&output),
        store.clone(),
        Box::new(JsonSampleHandler),
        Heartbeat::new(),
        no_emission(),
    );
    assert_eq!(serializer.num_serializations_completed(), 0);

    serializer.start().unwrap();
    serializer.drain();
    wait_for_completions(&serializer, 1000);

    assert_eq!(input.size(), 0);
    assert_eq!(serializer.num_serializations_completed(), 1000);
    assert_eq!(output.size(), 1000);
    assert!(store.load().is_some());
}

#[test]
fn serialized_samples_are_published_and_marked_sent() {
    let input: Arc<FlushQueue> = Arc::new(BoundedQueue::new(4));
    let output: Arc<TransmitQueue> = Arc::new(PriorityQueue::new(4));
    let store = MetricStore::new();

    let item = flush_item(7);
    assert!(input.put(Arc::clone(&item)));
    assert!(!item.metrics_sent());

    let mut serializer = MetricSerializer::new(
        Arc::clone(&input),
        Arc::clone(&output),
        store.clone(),
        Box::new(JsonSampleHandler),
        Heartbeat::new(),
        no_emission(),
    );
    serializer.start().unwrap();
    wait_for_completions(&serializer, 1);

    assert!(item.metrics_sent());
    assert_eq!(store.load().unwrap().ts, 7);

    let sample = output.get(Duration::from_secs(1)).unwrap();
    assert_eq!(sample.ts, 7);
    assert!(!sample.buffer.is_empty());

    // Dropping the serializer clears the published slot.
    drop(serializer);
    assert!(store.load().is_none());
}

#[test]
fn stop_discards_queued_samples() {
    let input: Arc<FlushQueue> = Arc::new(BoundedQueue::new(4));
    let output: Arc<TransmitQueue> = Arc::new(PriorityQueue::new(4));

    for i in 0..3_u64 {
        input.put(flush_item(i));
    }

    let serializer = MetricSerializer::new(
        Arc::clone(&input),
        output,
        MetricStore::new(),
        Box::new(JsonSampleHandler),
        Heartbeat::new(),
        no_emission(),
    );
    serializer.stop();

    assert_eq!(input.size(), 0);
    assert_eq!(serializer.num_serializations_completed(), 0);
}

#[test]
fn samples_are_emitted_to_disk_when_enabled() {
    let tmp = tempfile::tempdir().unwrap();
    let directory = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf())
        .unwrap()
        .join("metrics");

    let input: Arc<FlushQueue> = Arc::new(BoundedQueue::new(4));
    let output: Arc<TransmitQueue> = Arc::new(PriorityQueue::new(4));

    let mut serializer = MetricSerializer::new(
        Arc::clone(&input),
        output,
        MetricStore::new(),
        Box::new(JsonSampleHandler),
        Heartbeat::new(),
        FileEmission {
            enabled: true,
            as_json: true,
            directory: directory.clone(),
        },
    );
    serializer.start().unwrap();

    input.put(flush_item(42));
    wait_for_completions(&serializer, 1);

    let path = directory.join(format!("{:020}.json", 42));
    let contents = std::fs::read_to_string(&path).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&contents).unwrap();
    assert_eq!(parsed["ts"], 42);
}

#[test]
fn worker_heartbeats_while_idle() {
    let input: Arc<FlushQueue> = Arc::new(BoundedQueue::new(4));
    let output: Arc<TransmitQueue> = Arc::new(PriorityQueue::new(4));

    let mut serializer = MetricSerializer::new(
        input,
        output,
        MetricStore::new(),
        Box::new(JsonSampleHandler),
        Heartbeat::new(),
        no_emission(),
    );
    serializer.start().unwrap();

    // The idle loop beats at least once per queue-read timeout.
    std::thread::sleep(Duration::from_secs(1));
    assert!(serializer.heartbeat().age() < Duration::from_millis(700));
}
