//! Thread bookkeeping consumed by the listener.
//!
//! Tracks just enough per-thread state to attribute I/O (command name, last
//! event, syscall latency) and to answer the port questions role inference
//! asks. The table is capped and idle entries are evicted on a fixed scan
//! cadence.

use std::collections::{HashMap, HashSet};

use smol_str::SmolStr;

#[derive(Debug)]
pub struct ThreadInfo {
    pub tid: i64,
    pub pid: i64,
    pub comm: SmolStr,
    pub lastevent_ts: u64,
    pub lastevent_fd: i64,
    /// Latency of the thread's most recent syscall, in nanoseconds.
    pub latency: u64,
    bound_ports: HashSet<u16>,
    client_ports: HashSet<u16>,
}

impl ThreadInfo {
    fn new(tid: i64, pid: i64, now: u64) -> Self {
        ThreadInfo {
            tid,
            pid,
            comm: SmolStr::default(),
            lastevent_ts: now,
            lastevent_fd: -1,
            latency: 0,
            bound_ports: HashSet::new(),
            client_ports: HashSet::new(),
        }
    }

    pub fn is_bound_to_port(&self, port: u16) -> bool {
        self.bound_ports.contains(&port)
    }

    pub fn uses_client_port(&self, port: u16) -> bool {
        self.client_ports.contains(&port)
    }

    pub fn bind_port(&mut self, port: u16) {
        self.bound_ports.insert(port);
    }

    pub fn add_client_port(&mut self, port: u16) {
        self.client_ports.insert(port);
    }
}

pub struct ThreadTable {
    threads: HashMap<i64, ThreadInfo>,
    max_size: usize,
    timeout_ns: u64,
    scan_interval_ns: u64,
    last_scan_ts: u64,
    drops: u64,
}

impl ThreadTable {
    pub fn new(max_size: usize, timeout_ns: u64, scan_interval_ns: u64) -> Self {
        ThreadTable {
            threads: HashMap::new(),
            max_size,
            timeout_ns,
            scan_interval_ns,
            last_scan_ts: 0,
            drops: 0,
        }
    }

    /// Looks the thread up, creating it on first sight. `pid` and `comm` are
    /// hints from the event stream and refresh the entry when present.
    /// Returns `None` (and counts a drop) when the table is saturated.
    pub fn get_or_create(
        &mut self,
        tid: i64,
        pid: Option<i64>,
        comm: Option<&str>,
        now: u64,
    ) -> Option<&mut ThreadInfo> {
        if !self.threads.contains_key(&tid) {
            if self.threads.len() >= self.max_size {
                self.drops += 1;
                return None;
            }
            self.threads.insert(tid, ThreadInfo::new(tid, pid.unwrap_or(tid), now));
        }

        let tinfo = self.threads.get_mut(&tid)?;
        if let Some(pid) = pid {
            tinfo.pid = pid;
        }
        if let Some(comm) = comm {
            if tinfo.comm != comm {
                tinfo.comm = SmolStr::new(comm);
            }
        }
        tinfo.lastevent_ts = now;
        Some(tinfo)
    }

    pub fn find(&self, tid: i64) -> Option<&ThreadInfo> {
        self.threads.get(&tid)
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    pub fn drop_count(&self) -> u64 {
        self.drops
    }

    /// Evicts threads idle past the timeout, at most once per scan interval.
    pub fn maybe_scan(&mut self, now: u64) {
        if now.saturating_sub(self.last_scan_ts) < self.scan_interval_ns {
            return;
        }
        self.last_scan_ts = now;

        let timeout = self.timeout_ns;
        let before = self.threads.len();
        self.threads.retain(|_, tinfo| now.saturating_sub(tinfo.lastevent_ts) <= timeout);

        let evicted = before - self.threads.len();
        if evicted > 0 {
            trace!(evicted, remaining = self.threads.len(), "Evicted idle threads");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECOND: u64 = 1_000_000_000;

    #[test]
    fn saturated_table_counts_drops() {
        let mut table = ThreadTable::new(1, 60 * SECOND, 60 * SECOND);

        assert!(table.get_or_create(1, None, None, 0).is_some());
        assert!(table.get_or_create(2, None, None, 0).is_none());
        assert!(table.get_or_create(1, None, None, 1).is_some());
        assert_eq!(table.drop_count(), 1);
    }

    #[test]
    fn hints_refresh_the_entry() {
        let mut table = ThreadTable::new(8, 60 * SECOND, 60 * SECOND);
        table.get_or_create(1, None, None, 0);

        let tinfo = table
            .get_or_create(1, Some(99), Some("nginx"), 5)
            .expect("entry exists");

        assert_eq!(tinfo.pid, 99);
        assert_eq!(tinfo.comm, "nginx");
        assert_eq!(tinfo.lastevent_ts, 5);
    }

    #[test]
    fn idle_threads_are_evicted_on_scan() {
        let mut table = ThreadTable::new(8, 60 * SECOND, 60 * SECOND);
        table.get_or_create(1, None, None, 0);
        table.get_or_create(2, None, None, 55 * SECOND);

        // Below the scan cadence: nothing happens yet.
        table.maybe_scan(SECOND);
        assert_eq!(table.len(), 2);

        table.maybe_scan(70 * SECOND);

        assert!(table.find(1).is_none());
        assert!(table.find(2).is_some());
    }
}
