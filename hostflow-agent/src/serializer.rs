//! Serializer worker: the single consumer draining the flush queue into the
//! transmit queue.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Context as _;
use camino::Utf8PathBuf;
use message_queue::{BoundedQueue, Priority, PriorityQueue};
use metric_store::MetricStore;

use crate::flush::{FlushData, MetricsSnapshot};
use crate::sample::{SampleHandler, SerializedSample};
use crate::watchdog::Heartbeat;

/// How long one queue read blocks; doubles as the stop-flag check cadence.
pub const DEFAULT_MQUEUE_READ_TIMEOUT: Duration = Duration::from_millis(300);

pub type FlushQueue = BoundedQueue<Arc<FlushData>>;
pub type TransmitQueue = PriorityQueue<Arc<SerializedSample>>;

pub struct FileEmission {
    pub enabled: bool,
    pub as_json: bool,
    pub directory: Utf8PathBuf,
}

pub struct MetricSerializer {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

struct Shared {
    stop: AtomicBool,
    completed: AtomicU64,
    input: Arc<FlushQueue>,
    output: Arc<TransmitQueue>,
    store: MetricStore<MetricsSnapshot>,
    handler: Box<dyn SampleHandler>,
    heartbeat: Heartbeat,
    emission: FileEmission,
}

impl MetricSerializer {
    pub fn new(
        input: Arc<FlushQueue>,
        output: Arc<TransmitQueue>,
        store: MetricStore<MetricsSnapshot>,
        handler: Box<dyn SampleHandler>,
        heartbeat: Heartbeat,
        emission: FileEmission,
    ) -> Self {
        MetricSerializer {
            shared: Arc::new(Shared {
                stop: AtomicBool::new(false),
                completed: AtomicU64::new(0),
                input,
                output,
                store,
                handler,
                heartbeat,
                emission,
            }),
            worker: None,
        }
    }

    pub fn start(&mut self) -> anyhow::Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }

        let shared = Arc::clone(&self.shared);
        let worker = std::thread::Builder::new()
            .name("serializer".to_owned())
            .spawn(move || worker_loop(&shared))
            .context("could not spawn the serializer worker")?;
        self.worker = Some(worker);

        Ok(())
    }

    /// Asks the worker to exit and discards whatever is still queued.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        self.shared.input.clear();
    }

    /// Waits for the worker to drain the input queue (1 ms polls).
    pub fn drain(&self) {
        while self.shared.input.size() > 0 && !self.shared.stop.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    pub fn num_serializations_completed(&self) -> u64 {
        self.shared.completed.load(Ordering::SeqCst)
    }

    pub fn heartbeat(&self) -> Heartbeat {
        self.shared.heartbeat.clone()
    }
}

impl Drop for MetricSerializer {
    fn drop(&mut self) {
        self.stop();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("Serializer worker panicked");
            }
        }
        // The published sample dies with its producer.
        self.shared.store.store(None);
    }
}

fn worker_loop(shared: &Shared) {
    debug!("Serializer worker started");

    while !shared.stop.load(Ordering::SeqCst) {
        shared.heartbeat.beat();

        let Some(data) = shared.input.get(DEFAULT_MQUEUE_READ_TIMEOUT) else {
            continue;
        };

        if shared.stop.load(Ordering::SeqCst) {
            break;
        }

        shared.heartbeat.beat();

        // A failed sample is dropped; the worker never dies over one item.
        if let Err(error) = do_serialization(shared, &data) {
            error!(error = format!("{error:#}"), "Failed to serialize sample");
        }
    }

    debug!("Serializer worker stopped");
}

fn do_serialization(shared: &Shared, data: &FlushData) -> anyhow::Result<()> {
    shared.store.store(Some(Arc::clone(&data.metrics)));
    data.mark_sent();

    let sample = shared
        .handler
        .handle_uncompressed_sample(data.ts, &data.metrics)
        .context("uncompressed sample handler failed")?;
    let sample = Arc::new(sample);

    if !shared.output.put(Arc::clone(&sample), Priority::Medium) {
        warn!("Transmit queue full, discarding sample");
    }

    if shared.emission.enabled {
        if let Err(error) = emit_to_file(&shared.emission, data, &sample) {
            warn!(error = format!("{error:#}"), "Could not write sample to disk");
        }
    }

    shared.completed.fetch_add(1, Ordering::SeqCst);
    Ok(())
}

/// One file per flush, named by timestamp; zero-padding keeps lexical order
/// chronological.
fn emit_to_file(
    emission: &FileEmission,
    data: &FlushData,
    sample: &SerializedSample,
) -> anyhow::Result<()> {
    std::fs::create_dir_all(&emission.directory)
        .with_context(|| format!("could not create {}", emission.directory))?;

    let path = if emission.as_json {
        emission.directory.join(format!("{:020}.json", data.ts))
    } else {
        emission.directory.join(format!("{:020}.pb", data.ts))
    };

    let contents = if emission.as_json {
        serde_json::to_vec_pretty(data.metrics.as_ref()).context("could not render sample as JSON")?
    } else {
        sample.buffer.clone()
    };

    std::fs::write(&path, contents).with_context(|| format!("could not write {path}"))?;
    Ok(())
}
