//! Keyed connection store shared by the IPv4, unix and pipe flavors.

use std::collections::HashMap;
use std::hash::Hash;

use smol_str::SmolStr;

use super::{AnalysisFlags, Connection, EndpointRef};

pub struct ConnectionTable<K> {
    conns: HashMap<K, Connection>,
    max_size: usize,
    drops: u64,
}

impl<K: Copy + Eq + Hash> ConnectionTable<K> {
    pub fn new(max_size: usize) -> Self {
        ConnectionTable {
            conns: HashMap::new(),
            max_size,
            drops: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    /// Events refused because the table was at capacity.
    pub fn drop_count(&self) -> u64 {
        self.drops
    }

    pub fn get(&mut self, key: &K, now: u64) -> Option<&mut Connection> {
        let conn = self.conns.get_mut(key)?;
        conn.last_activity_ts = now;
        Some(conn)
    }

    /// Inserts a record for `key` or merges the observer into the existing
    /// one. A closed record under the same key is recycled rather than
    /// replaced, and a live record fully claimed by other descriptors is reset
    /// on the side the new observer stands for. Returns `None` (and counts a
    /// drop) only when the table is at capacity.
    #[allow(clippy::too_many_arguments)]
    pub fn add(
        &mut self,
        key: K,
        comm: &SmolStr,
        pid: i64,
        tid: i64,
        fd: i64,
        is_client: bool,
        now: u64,
    ) -> Option<&mut Connection> {
        let ep = EndpointRef { pid, tid, fd };

        if !self.conns.contains_key(&key) {
            if self.conns.len() >= self.max_size {
                self.drops += 1;
                return None;
            }
            self.conns.insert(key, Connection::new(comm.clone(), now));
        }

        let conn = self.conns.get_mut(&key)?;

        if conn.flags.contains(AnalysisFlags::CLOSED) {
            conn.mark_reused(now);
        } else if conn.is_full() && !conn.matches_endpoint(pid, fd) {
            // Unrelated descriptors claim a fully populated live key: recycle
            // the side the new observer stands for.
            if is_client {
                conn.reset_client();
            } else {
                conn.reset_server();
            }
            conn.flags.insert(AnalysisFlags::REUSED);
        }

        conn.comm = comm.clone();
        conn.last_activity_ts = now;
        conn.record_endpoint(is_client, ep);
        Some(conn)
    }

    /// Drops the record right away, or releases one descriptor reference and
    /// leaves eviction to the next flush boundary.
    pub fn remove(&mut self, key: &K, immediate: bool) {
        if immediate {
            self.conns.remove(key);
            return;
        }

        if let Some(conn) = self.conns.get_mut(key) {
            conn.flags.insert(AnalysisFlags::PENDING_REMOVAL);
            conn.refcount = conn.refcount.saturating_sub(1);
            if conn.refcount == 0 {
                conn.flags.remove(AnalysisFlags::REUSED);
                conn.flags.insert(AnalysisFlags::CLOSED);
            }
        }
    }

    pub fn iter_for_flush(&self) -> impl Iterator<Item = (&K, &Connection)> {
        self.conns.iter()
    }

    /// End-of-interval housekeeping: evicts records nothing references
    /// anymore and retires the one-interval NEW/REUSED markers.
    pub fn sweep(&mut self) {
        self.conns
            .retain(|_, conn| !(conn.refcount == 0 && conn.flags.contains(AnalysisFlags::CLOSED)));

        for conn in self.conns.values_mut() {
            conn.flags.remove(AnalysisFlags::NEW | AnalysisFlags::REUSED);
        }
    }
}
