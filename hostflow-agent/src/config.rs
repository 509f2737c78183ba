//! Agent configuration.
//!
//! The on-disk file is JSON with PascalCase keys and every field optional;
//! `Conf` is the resolved form with defaults applied.

use std::net::Ipv4Addr;

use anyhow::Context as _;
use camino::{Utf8Path, Utf8PathBuf};
use cfg_if::cfg_if;
use serde::{Deserialize, Serialize};

pub const DEFAULT_FLUSH_QUEUE_SIZE: usize = 1000;
pub const DEFAULT_TRANSMIT_QUEUE_SIZE: usize = 1000;
pub const DEFAULT_MAX_CONNECTION_TABLE_SIZE: usize = 65_536;
pub const DEFAULT_MAX_THREAD_TABLE_SIZE: usize = 131_072;
pub const DEFAULT_THREAD_TIMEOUT_NS: u64 = 60_000_000_000;
pub const DEFAULT_INACTIVE_THREAD_SCAN_TIME_NS: u64 = 60_000_000_000;
pub const DEFAULT_MAX_TIMEOUTS: u32 = 3;

cfg_if! {
    if #[cfg(target_os = "windows")] {
        const DEFAULT_ROOT_DIR: &str = "C:\\ProgramData\\Hostflow";
    } else {
        const DEFAULT_ROOT_DIR: &str = "/opt/hostflow";
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureMode {
    Live,
    Nodriver,
    TraceFile,
}

/// On-disk configuration; everything is optional.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ConfFile {
    pub emit_metrics_to_file: Option<bool>,
    pub emit_protobuf_json: Option<bool>,
    pub flush_queue_size: Option<usize>,
    pub transmit_queue_size: Option<usize>,
    pub max_connection_table_size: Option<usize>,
    pub max_thread_table_size: Option<usize>,
    pub thread_timeout_ns: Option<u64>,
    pub inactive_thread_scan_time_ns: Option<u64>,
    pub capture_mode: Option<CaptureMode>,
    pub max_timeouts: Option<u32>,
    pub root_dir: Option<Utf8PathBuf>,
    pub log_file: Option<Utf8PathBuf>,
    pub log_filter: Option<String>,
    pub trace_file: Option<Utf8PathBuf>,
    pub local_addresses: Option<Vec<Ipv4Addr>>,
}

#[derive(Clone, Debug)]
pub struct Conf {
    pub emit_metrics_to_file: bool,
    pub emit_protobuf_json: bool,
    pub flush_queue_size: usize,
    pub transmit_queue_size: usize,
    pub max_connection_table_size: usize,
    pub max_thread_table_size: usize,
    pub thread_timeout_ns: u64,
    pub inactive_thread_scan_time_ns: u64,
    pub capture_mode: CaptureMode,
    pub max_timeouts: u32,
    pub root_dir: Utf8PathBuf,
    pub log_file: Option<Utf8PathBuf>,
    pub log_filter: String,
    pub trace_file: Option<Utf8PathBuf>,
    pub local_addresses: Vec<Ipv4Addr>,
}

impl Default for Conf {
    fn default() -> Self {
        Self::resolve(ConfFile::default())
    }
}

impl Conf {
    pub fn from_file(path: &Utf8Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("could not read configuration file {path}"))?;
        let file: ConfFile =
            serde_json::from_str(&contents).context("malformed configuration file")?;
        Ok(Self::resolve(file))
    }

    pub fn resolve(file: ConfFile) -> Self {
        Conf {
            emit_metrics_to_file: file.emit_metrics_to_file.unwrap_or(false),
            emit_protobuf_json: file.emit_protobuf_json.unwrap_or(false),
            flush_queue_size: file.flush_queue_size.unwrap_or(DEFAULT_FLUSH_QUEUE_SIZE),
            transmit_queue_size: file.transmit_queue_size.unwrap_or(DEFAULT_TRANSMIT_QUEUE_SIZE),
            max_connection_table_size: file
                .max_connection_table_size
                .unwrap_or(DEFAULT_MAX_CONNECTION_TABLE_SIZE),
            max_thread_table_size: file
                .max_thread_table_size
                .unwrap_or(DEFAULT_MAX_THREAD_TABLE_SIZE),
            thread_timeout_ns: file.thread_timeout_ns.unwrap_or(DEFAULT_THREAD_TIMEOUT_NS),
            inactive_thread_scan_time_ns: file
                .inactive_thread_scan_time_ns
                .unwrap_or(DEFAULT_INACTIVE_THREAD_SCAN_TIME_NS),
            capture_mode: file.capture_mode.unwrap_or(CaptureMode::Live),
            max_timeouts: file.max_timeouts.unwrap_or(DEFAULT_MAX_TIMEOUTS),
            root_dir: file.root_dir.unwrap_or_else(|| Utf8PathBuf::from(DEFAULT_ROOT_DIR)),
            log_file: file.log_file,
            log_filter: file.log_filter.unwrap_or_else(|| "info".to_owned()),
            trace_file: file.trace_file,
            local_addresses: file.local_addresses.unwrap_or_default(),
        }
    }

    pub fn metrics_directory(&self) -> Utf8PathBuf {
        self.root_dir.join("metrics")
    }
}
