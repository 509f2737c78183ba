//! Decoded capture events and the sources that produce them.
//!
//! The ring-buffer reader proper lives with the kernel driver; what arrives
//! here is already decoded. The bundled sources are a JSON-lines trace file
//! (one event per line) and an idle placeholder used when no driver is
//! loaded.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::time::Duration;

use anyhow::Context as _;
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use crate::conn::{Ipv4Tuple, UnixTuple};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic timestamp in nanoseconds.
    pub ts: u64,
    #[serde(default)]
    pub cpuid: u16,
    pub tid: i64,
    #[serde(default)]
    pub pid: Option<i64>,
    #[serde(default)]
    pub comm: Option<SmolStr>,
    /// Latency of the syscall behind this event, in nanoseconds.
    #[serde(default)]
    pub latency: u64,
    #[serde(default)]
    pub errorcode: i32,
    /// Materializes the descriptor when the open/socket event that would have
    /// described it was lost or predates the capture.
    #[serde(default)]
    pub fd_spec: Option<FdSpec>,
    #[serde(flatten)]
    pub kind: EventKind,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    Read {
        fd: i64,
        op: ReadOp,
        #[serde(default)]
        data: Vec<u8>,
        original_len: u32,
    },
    Write {
        fd: i64,
        #[serde(default)]
        data: Vec<u8>,
        original_len: u32,
    },
    Connect {
        fd: i64,
        addr: SockAddr,
    },
    Accept {
        new_fd: i64,
        addr: SockAddr,
    },
    Shutdown {
        fd: i64,
    },
    Close {
        fd: i64,
    },
    OpenFile {
        #[serde(default)]
        fd: Option<i64>,
        path: String,
    },
    IoError {
        fd: i64,
    },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadOp {
    Read,
    Recv,
    RecvFrom,
    RecvMsg,
}

impl ReadOp {
    /// The recv family reports a zero-length read when the peer has closed.
    pub fn signals_peer_close(self) -> bool {
        !matches!(self, ReadOp::Read)
    }
}

#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum SockAddr {
    Inet(Ipv4Tuple),
    Unix(UnixTuple),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FdSpec {
    Ipv4Socket(Ipv4Tuple),
    UnixSocket {
        source: u64,
        dest: u64,
        #[serde(default)]
        socketpair: bool,
    },
    Pipe {
        ino: u64,
    },
    File {
        path: String,
    },
}

pub enum SourceStatus {
    Event(Event),
    Timeout,
    Eof,
    Error(String),
}

pub trait EventSource {
    fn next(&mut self) -> SourceStatus;
    fn reopen(&mut self) -> anyhow::Result<()>;
}

/// Replays a capture recorded as one JSON event per line.
pub struct TraceFileSource {
    path: Utf8PathBuf,
    reader: BufReader<File>,
    line: String,
    lineno: u64,
}

impl TraceFileSource {
    pub fn open(path: &Utf8Path) -> anyhow::Result<Self> {
        let file = File::open(path).with_context(|| format!("could not open trace file {path}"))?;
        Ok(TraceFileSource {
            path: path.to_owned(),
            reader: BufReader::new(file),
            line: String::new(),
            lineno: 0,
        })
    }
}

impl EventSource for TraceFileSource {
    fn next(&mut self) -> SourceStatus {
        loop {
            self.line.clear();
            match self.reader.read_line(&mut self.line) {
                Ok(0) => return SourceStatus::Eof,
                Ok(_) => {
                    self.lineno += 1;
                    let line = self.line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Event>(line) {
                        Ok(event) => return SourceStatus::Event(event),
                        Err(error) => {
                            warn!(%error, line = self.lineno, "Skipping undecodable trace record");
                        }
                    }
                }
                Err(error) => return SourceStatus::Error(error.to_string()),
            }
        }
    }

    /// A trace cannot resume mid-stream; replay starts over from the top.
    fn reopen(&mut self) -> anyhow::Result<()> {
        let file = File::open(&self.path)
            .with_context(|| format!("could not reopen trace file {}", self.path))?;
        self.reader = BufReader::new(file);
        self.lineno = 0;
        Ok(())
    }
}

/// Source used when no capture driver is loaded; yields only timeouts.
pub struct NoDriverSource {
    poll_interval: Duration,
}

impl Default for NoDriverSource {
    fn default() -> Self {
        NoDriverSource {
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl EventSource for NoDriverSource {
    fn next(&mut self) -> SourceStatus {
        std::thread::sleep(self.poll_interval);
        SourceStatus::Timeout
    }

    fn reopen(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use crate::conn::L4Proto;

    use super::*;

    #[test]
    fn trace_records_roundtrip_through_json() {
        let event = Event {
            ts: 1_000,
            cpuid: 0,
            tid: 42,
            pid: Some(42),
            comm: Some(SmolStr::new("curl")),
            latency: 10,
            errorcode: 0,
            fd_spec: None,
            kind: EventKind::Connect {
                fd: 3,
                addr: SockAddr::Inet(Ipv4Tuple {
                    sip: "127.0.0.1".parse().expect("address literal"),
                    sport: 43210,
                    dip: "127.0.0.1".parse().expect("address literal"),
                    dport: 80,
                    proto: L4Proto::Tcp,
                }),
            },
        };

        let json = serde_json::to_string(&event).expect("serializable event");
        let back: Event = serde_json::from_str(&json).expect("deserializable event");

        assert_eq!(back.ts, 1_000);
        assert!(matches!(back.kind, EventKind::Connect { fd: 3, .. }));
    }

    #[test]
    fn trace_file_source_skips_garbage_lines() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, r#"{{"ts":1,"tid":5,"kind":"close","fd":3}}"#).expect("write");
        writeln!(file, "this is not json").expect("write");
        writeln!(file, r#"{{"ts":2,"tid":5,"kind":"close","fd":4}}"#).expect("write");

        let path = Utf8Path::from_path(file.path()).expect("utf-8 temp path");
        let mut source = TraceFileSource::open(path).expect("open trace");

        assert!(matches!(source.next(), SourceStatus::Event(Event { ts: 1, .. })));
        assert!(matches!(source.next(), SourceStatus::Event(Event { ts: 2, .. })));
        assert!(matches!(source.next(), SourceStatus::Eof));
    }
}
