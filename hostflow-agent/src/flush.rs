//! Time-bucketed aggregates handed to the serializer.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use smol_str::SmolStr;

use crate::conn::{AnalysisFlags, Connection, ConnectionTable, Ipv4Tuple, PipeKey, SideMetrics, UnixTuple};
use crate::filestat::FileStat;
use crate::listener::FdListener;
use crate::thread::ThreadTable;

#[derive(Debug, Serialize)]
pub struct ConnectionSample<K> {
    pub key: K,
    pub comm: SmolStr,
    pub reused: bool,
    pub closed: bool,
    pub first_seen_ts: u64,
    pub last_activity_ts: u64,
    pub server: SideMetrics,
    pub client: SideMetrics,
}

#[derive(Debug, Default, Serialize)]
pub struct DropCounters {
    pub ipv4_connections: u64,
    pub unix_connections: u64,
    pub pipe_connections: u64,
    pub threads: u64,
    pub flush_queue: u64,
    pub events_skipped: u64,
}

/// Everything one flush interval contributes to a sample.
#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub ts: u64,
    pub ipv4_connections: Vec<ConnectionSample<Ipv4Tuple>>,
    pub unix_connections: Vec<ConnectionSample<UnixTuple>>,
    pub pipe_connections: Vec<ConnectionSample<PipeKey>>,
    pub files: Vec<FileStat>,
    pub tracked_threads: usize,
    pub drops: DropCounters,
}

impl MetricsSnapshot {
    /// Snapshots the current aggregates and performs the end-of-interval
    /// housekeeping the flush boundary owns: closed records are evicted,
    /// one-interval markers cleared, file stats drained.
    pub fn build(
        ts: u64,
        listener: &mut FdListener,
        threads: &ThreadTable,
        flush_queue_drops: u64,
        events_skipped: u64,
    ) -> Self {
        let snapshot = MetricsSnapshot {
            ts,
            ipv4_connections: collect(listener.ipv4_connections()),
            unix_connections: collect(listener.unix_connections()),
            pipe_connections: collect(listener.pipe_connections()),
            files: listener.file_stats_mut().drain(),
            tracked_threads: threads.len(),
            drops: DropCounters {
                ipv4_connections: listener.ipv4_connections().drop_count(),
                unix_connections: listener.unix_connections().drop_count(),
                pipe_connections: listener.pipe_connections().drop_count(),
                threads: threads.drop_count(),
                flush_queue: flush_queue_drops,
                events_skipped,
            },
        };

        listener.ipv4_connections_mut().sweep();
        listener.unix_connections_mut().sweep();
        listener.pipe_connections_mut().sweep();

        snapshot
    }
}

fn collect<K: Copy + Eq + std::hash::Hash>(table: &ConnectionTable<K>) -> Vec<ConnectionSample<K>> {
    table
        .iter_for_flush()
        .map(|(key, conn)| sample(*key, conn))
        .collect()
}

fn sample<K>(key: K, conn: &Connection) -> ConnectionSample<K> {
    ConnectionSample {
        key,
        comm: conn.comm.clone(),
        reused: conn.flags.contains(AnalysisFlags::REUSED),
        closed: conn.flags.contains(AnalysisFlags::CLOSED),
        first_seen_ts: conn.first_seen_ts,
        last_activity_ts: conn.last_activity_ts,
        server: conn.metrics.server,
        client: conn.metrics.client,
    }
}

/// One flush-queue item. The producer keeps its own reference and learns the
/// sample went out through `metrics_sent`.
#[derive(Debug)]
pub struct FlushData {
    pub ts: u64,
    pub metrics: Arc<MetricsSnapshot>,
    metrics_sent: AtomicBool,
}

impl FlushData {
    pub fn new(ts: u64, metrics: Arc<MetricsSnapshot>) -> Self {
        FlushData {
            ts,
            metrics,
            metrics_sent: AtomicBool::new(false),
        }
    }

    pub fn mark_sent(&self) {
        self.metrics_sent.store(true, Ordering::SeqCst);
    }

    pub fn metrics_sent(&self) -> bool {
        self.metrics_sent.load(Ordering::SeqCst)
    }
}
