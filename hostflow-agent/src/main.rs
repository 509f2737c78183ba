#[macro_use]
extern crate tracing;

use std::sync::Arc;

use anyhow::Context as _;
use camino::Utf8PathBuf;
use message_queue::{BoundedQueue, PriorityQueue};
use metric_store::MetricStore;
use tap::prelude::*;

use hostflow_agent::config::{CaptureMode, Conf};
use hostflow_agent::engine::AnalyzerEngine;
use hostflow_agent::event::{EventSource, NoDriverSource, TraceFileSource};
use hostflow_agent::listener::StaticLocalNetwork;
use hostflow_agent::sample::JsonSampleHandler;
use hostflow_agent::serializer::{FileEmission, MetricSerializer};
use hostflow_agent::watchdog::Heartbeat;
use hostflow_agent::{log, serializer};

const USAGE: &str =
    "usage: hostflow-agent [--config <file>] [--capture-mode live|nodriver|trace-file] [--trace-file <file>]";

#[derive(Debug, Default)]
struct Args {
    config: Option<Utf8PathBuf>,
    capture_mode: Option<CaptureMode>,
    trace_file: Option<Utf8PathBuf>,
}

#[derive(Debug, thiserror::Error)]
enum ArgsError {
    #[error("unknown argument `{argument}` at position {position}")]
    Unknown { position: usize, argument: String },
    #[error("argument `{argument}` at position {position} is missing its value")]
    MissingValue { position: usize, argument: String },
    #[error("invalid value `{value}` for `{argument}` at position {position}")]
    InvalidValue {
        position: usize,
        argument: String,
        value: String,
    },
}

fn parse_args(raw: Vec<String>) -> Result<Args, ArgsError> {
    let mut args = Args::default();
    let mut i = 0;

    while i < raw.len() {
        let argument = raw[i].as_str();
        let value = |raw: &[String]| -> Result<String, ArgsError> {
            raw.get(i + 1).cloned().ok_or_else(|| ArgsError::MissingValue {
                position: i + 1,
                argument: argument.to_owned(),
            })
        };

        match argument {
            "--config" | "-c" => args.config = Some(value(&raw)?.into()),
            "--trace-file" => args.trace_file = Some(value(&raw)?.into()),
            "--capture-mode" => {
                let value = value(&raw)?;
                args.capture_mode = Some(match value.as_str() {
                    "live" => CaptureMode::Live,
                    "nodriver" => CaptureMode::Nodriver,
                    "trace-file" | "trace_file" => CaptureMode::TraceFile,
                    _ => {
                        return Err(ArgsError::InvalidValue {
                            position: i + 2,
                            argument: argument.to_owned(),
                            value,
                        });
                    }
                });
            }
            _ => {
                return Err(ArgsError::Unknown {
                    position: i + 1,
                    argument: argument.to_owned(),
                });
            }
        }

        i += 2;
    }

    Ok(args)
}

fn main() -> anyhow::Result<()> {
    let args = parse_args(std::env::args().skip(1).collect())
        .map_err(|error| anyhow::anyhow!("{error}\n{USAGE}"))?;

    let conf = match &args.config {
        Some(path) => Conf::from_file(path)?,
        None => Conf::default(),
    };

    let _logger_guard = log::init(&conf.log_filter, conf.log_file.as_deref())?;

    info!(version = env!("CARGO_PKG_VERSION"), "Hostflow agent starting");

    let flush_queue = BoundedQueue::new(conf.flush_queue_size).pipe(Arc::new);
    let transmit_queue: Arc<serializer::TransmitQueue> =
        PriorityQueue::new(conf.transmit_queue_size).pipe(Arc::new);
    let store = MetricStore::new();

    let mut metric_serializer = MetricSerializer::new(
        Arc::clone(&flush_queue),
        Arc::clone(&transmit_queue),
        store.clone(),
        Box::new(JsonSampleHandler),
        Heartbeat::new(),
        FileEmission {
            enabled: conf.emit_metrics_to_file,
            as_json: conf.emit_protobuf_json,
            directory: conf.metrics_directory(),
        },
    );
    metric_serializer
        .start()
        .context("could not start the serializer worker")?;

    let local_network = Arc::new(StaticLocalNetwork::new(conf.local_addresses.clone()));
    let mut engine = AnalyzerEngine::new(&conf, local_network, Arc::clone(&flush_queue));

    let capture_mode = args.capture_mode.unwrap_or(conf.capture_mode);
    let mut source: Box<dyn EventSource> = match capture_mode {
        CaptureMode::Live => {
            anyhow::bail!(
                "live capture needs the kernel driver, which this build does not bundle; \
                 use `--capture-mode trace-file` or `--capture-mode nodriver`"
            );
        }
        CaptureMode::Nodriver => Box::new(NoDriverSource::default()),
        CaptureMode::TraceFile => {
            let path = args
                .trace_file
                .as_ref()
                .or(conf.trace_file.as_ref())
                .context("trace-file capture requires --trace-file (or TraceFile in the config)")?;
            Box::new(TraceFileSource::open(path)?)
        }
    };

    engine.run(source.as_mut())?;
    metric_serializer.drain();

    info!(
        serializations = metric_serializer.num_serializations_completed(),
        events_skipped = engine.events_skipped(),
        "Hostflow agent exiting"
    );

    Ok(())
}
