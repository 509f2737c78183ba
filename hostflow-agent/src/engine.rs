//! Event-dispatch loop driving the listener and the flush cadence.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context as _;

use crate::config::Conf;
use crate::conn::{PipeKey, UnixTuple};
use crate::event::{Event, EventKind, EventSource, FdSpec, SourceStatus};
use crate::fd::{FdFlags, FdInfo, FdTable, FdType};
use crate::flush::{FlushData, MetricsSnapshot};
use crate::listener::{FdListener, LocalNetwork};
use crate::serializer::FlushQueue;
use crate::thread::ThreadTable;

pub const FLUSH_INTERVAL_NS: u64 = 1_000_000_000;

pub struct AnalyzerEngine {
    listener: FdListener,
    threads: ThreadTable,
    fds: FdTable,
    flush_queue: Arc<FlushQueue>,
    flush_interval_ns: u64,
    max_timeouts: u32,
    consecutive_timeouts: u32,
    last_event_ts: u64,
    last_flush_ts: u64,
    last_flush_at: Option<Instant>,
    events_skipped: u64,
    flush_drops: u64,
}

impl AnalyzerEngine {
    pub fn new(conf: &Conf, local_network: Arc<dyn LocalNetwork>, flush_queue: Arc<FlushQueue>) -> Self {
        AnalyzerEngine {
            listener: FdListener::new(conf.max_connection_table_size, local_network),
            threads: ThreadTable::new(
                conf.max_thread_table_size,
                conf.thread_timeout_ns,
                conf.inactive_thread_scan_time_ns,
            ),
            fds: FdTable::default(),
            flush_queue,
            flush_interval_ns: FLUSH_INTERVAL_NS,
            max_timeouts: conf.max_timeouts,
            consecutive_timeouts: 0,
            last_event_ts: 0,
            last_flush_ts: 0,
            last_flush_at: None,
            events_skipped: 0,
            flush_drops: 0,
        }
    }

    pub fn listener(&self) -> &FdListener {
        &self.listener
    }

    pub fn listener_mut(&mut self) -> &mut FdListener {
        &mut self.listener
    }

    pub fn threads(&self) -> &ThreadTable {
        &self.threads
    }

    pub fn fd_table_len(&self) -> usize {
        self.fds.len()
    }

    pub fn fd_info(&self, tid: i64, fd: i64) -> Option<&FdInfo> {
        self.fds.get(tid, fd)
    }

    pub fn events_skipped(&self) -> u64 {
        self.events_skipped
    }

    /// Consumes the source until end of stream. Too many consecutive
    /// timeouts and source errors both reopen the source; a final flush runs
    /// at end of stream.
    pub fn run(&mut self, source: &mut dyn EventSource) -> anyhow::Result<()> {
        self.last_flush_at.get_or_insert_with(Instant::now);

        loop {
            match source.next() {
                SourceStatus::Event(event) => {
                    self.consecutive_timeouts = 0;
                    self.process_event(event);
                }
                SourceStatus::Timeout => {
                    self.consecutive_timeouts += 1;
                    if self.consecutive_timeouts > self.max_timeouts {
                        warn!(
                            timeouts = self.consecutive_timeouts,
                            "Event source stalled, reopening"
                        );
                        source.reopen().context("could not reopen the event source")?;
                        self.consecutive_timeouts = 0;
                    }
                    self.idle_flush();
                }
                SourceStatus::Eof => {
                    debug!("Event source reached end of stream");
                    if self.last_event_ts != 0 {
                        self.flush_now(self.last_event_ts);
                    }
                    return Ok(());
                }
                SourceStatus::Error(error) => {
                    warn!(%error, "Event source failed, reopening");
                    source.reopen().context("could not reopen the event source")?;
                }
            }
        }
    }

    /// Dispatches one event and runs the flush cadence. Anything the tables
    /// cannot absorb degrades to a skipped event, never to a failure of the
    /// loop.
    pub fn process_event(&mut self, event: Event) {
        let now = event.ts;
        self.last_event_ts = now;
        if self.last_flush_ts == 0 {
            self.last_flush_ts = now;
        }
        self.threads.maybe_scan(now);
        self.dispatch(event);

        if now.saturating_sub(self.last_flush_ts) >= self.flush_interval_ns {
            self.flush_now(now);
        }
    }

    fn dispatch(&mut self, event: Event) {
        let now = event.ts;

        let Some(tinfo) = self
            .threads
            .get_or_create(event.tid, event.pid, event.comm.as_deref(), now)
        else {
            self.events_skipped += 1;
            return;
        };
        tinfo.latency = event.latency;

        match event.kind {
            EventKind::Read {
                fd,
                op,
                ref data,
                original_len,
            } => {
                tinfo.lastevent_fd = fd;
                install_fd_spec(&mut self.fds, event.tid, fd, event.fd_spec.as_ref());
                let Some(fdinfo) = self.fds.find(event.tid, fd) else {
                    self.events_skipped += 1;
                    return;
                };
                let len = u32::try_from(data.len()).unwrap_or(u32::MAX);
                self.listener
                    .on_read(now, tinfo, fd, fdinfo, op, data, original_len, len);
            }
            EventKind::Write {
                fd,
                ref data,
                original_len,
            } => {
                tinfo.lastevent_fd = fd;
                install_fd_spec(&mut self.fds, event.tid, fd, event.fd_spec.as_ref());
                let Some(fdinfo) = self.fds.find(event.tid, fd) else {
                    self.events_skipped += 1;
                    return;
                };
                let len = u32::try_from(data.len()).unwrap_or(u32::MAX);
                self.listener
                    .on_write(now, tinfo, fd, fdinfo, data, original_len, len);
            }
            EventKind::Connect { fd, addr } => {
                tinfo.lastevent_fd = fd;
                let fdinfo = self.fds.get_or_create(event.tid, fd);
                self.listener.on_connect(now, tinfo, fd, fdinfo, addr);
            }
            EventKind::Accept { new_fd, addr } => {
                tinfo.lastevent_fd = new_fd;
                // Accept always yields a brand-new descriptor; stale state
                // under a recycled fd number must not leak into it.
                self.fds.insert(event.tid, new_fd, FdInfo::default());
                let Some(fdinfo) = self.fds.find(event.tid, new_fd) else {
                    return;
                };
                self.listener.on_accept(now, tinfo, new_fd, fdinfo, addr);
            }
            EventKind::Shutdown { fd } => {
                let Some(fdinfo) = self.fds.find(event.tid, fd) else {
                    self.events_skipped += 1;
                    return;
                };
                self.listener.on_socket_shutdown(now, fdinfo);
            }
            EventKind::Close { fd } => {
                let Some(fdinfo) = self.fds.find(event.tid, fd) else {
                    self.events_skipped += 1;
                    return;
                };
                if event.errorcode != 0 {
                    // close() failed; the descriptor lives on.
                    fdinfo.flags.remove(FdFlags::CLOSE_IN_PROGRESS);
                    fdinfo.flags.insert(FdFlags::CLOSE_CANCELED);
                    return;
                }
                fdinfo.flags.insert(FdFlags::CLOSE_IN_PROGRESS);
                self.listener.on_erase_fd(now, fdinfo);
                self.fds.erase(event.tid, fd);
            }
            EventKind::OpenFile { fd, ref path } => {
                if event.errorcode != 0 || fd.is_none() {
                    self.listener.on_file_create(None, path);
                    return;
                }
                if let Some(fd) = fd {
                    self.fds.insert(event.tid, fd, FdInfo::file(path.clone()));
                    self.listener.on_file_create(self.fds.get(event.tid, fd), path);
                }
            }
            EventKind::IoError { fd } => {
                if event.errorcode == 0 {
                    return;
                }
                let Some(fdinfo) = self.fds.find(event.tid, fd) else {
                    self.events_skipped += 1;
                    return;
                };
                self.listener.on_error(fdinfo);
            }
        }
    }

    /// Snapshots the aggregates and enqueues them; a full queue drops the
    /// sample with a log.
    pub fn flush_now(&mut self, ts: u64) {
        let snapshot = MetricsSnapshot::build(
            ts,
            &mut self.listener,
            &self.threads,
            self.flush_drops,
            self.events_skipped,
        );
        let data = Arc::new(FlushData::new(ts, Arc::new(snapshot)));

        if !self.flush_queue.put(data) {
            warn!("Flush queue full, dropping sample");
            self.flush_drops += 1;
        }

        self.last_flush_ts = ts;
        self.last_flush_at = Some(Instant::now());
    }

    /// With no events to carry the clock, the cadence falls back to wall
    /// time and extrapolates the event clock.
    fn idle_flush(&mut self) {
        let Some(last) = self.last_flush_at else {
            return;
        };
        if self.last_event_ts == 0 {
            return;
        }

        let elapsed = last.elapsed();
        if elapsed.as_nanos() >= u128::from(self.flush_interval_ns) {
            let advance = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
            self.flush_now(self.last_flush_ts.saturating_add(advance));
        }
    }
}

fn install_fd_spec(fds: &mut FdTable, tid: i64, fd: i64, spec: Option<&FdSpec>) {
    if fds.find(tid, fd).is_some() {
        return;
    }
    let Some(spec) = spec else {
        return;
    };

    let mut fdinfo = FdInfo::default();
    match spec {
        FdSpec::Ipv4Socket(tuple) => fdinfo.fd_type = FdType::Ipv4Socket(*tuple),
        FdSpec::UnixSocket {
            source,
            dest,
            socketpair,
        } => {
            fdinfo.fd_type = FdType::UnixSocket(UnixTuple {
                source: *source,
                dest: *dest,
            });
            if *socketpair {
                fdinfo.flags.insert(FdFlags::SOCKET_PIPE);
            }
        }
        FdSpec::Pipe { ino } => fdinfo.fd_type = FdType::Pipe(PipeKey(*ino)),
        FdSpec::File { path } => {
            fdinfo.fd_type = FdType::File;
            fdinfo.name.clone_from(path);
        }
    }

    fds.insert(tid, fd, fdinfo);
}
