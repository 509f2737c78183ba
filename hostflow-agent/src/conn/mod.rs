//! Connection records and the keyed tables that own them.
//!
//! Records are owned exclusively by their table; descriptor state refers to a
//! record by key only and looks it up on demand, so there are no pointer
//! cycles between the descriptor table and the connection tables.

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

pub mod table;

pub use table::ConnectionTable;

/// Which side of a connection a descriptor stands for.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Role {
    Client,
    Server,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum L4Proto {
    Tcp,
    Udp,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Ipv4Tuple {
    pub sip: Ipv4Addr,
    pub sport: u16,
    pub dip: Ipv4Addr,
    pub dport: u16,
    pub proto: L4Proto,
}

/// Kernel addresses of both unix socket endpoints. A null destination shows
/// up for socketpairs and is tolerated, but flagged on the record.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct UnixTuple {
    pub source: u64,
    pub dest: u64,
}

/// Pipes are identified by inode number.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct PipeKey(pub u64);

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AnalysisFlags: u8 {
        const NEW = 1 << 0;
        const REUSED = 1 << 1;
        const CLOSED = 1 << 2;
        const PENDING_REMOVAL = 1 << 3;
        const ZERO_DEST = 1 << 4;
    }
}

/// The descriptor that observed one side of a connection.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct EndpointRef {
    pub pid: i64,
    pub tid: i64,
    pub fd: i64,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct SideMetrics {
    pub in_bytes: u64,
    pub in_ops: u64,
    pub out_bytes: u64,
    pub out_ops: u64,
}

impl SideMetrics {
    pub fn add_in(&mut self, ops: u64, bytes: u64) {
        self.in_ops += ops;
        self.in_bytes += bytes;
    }

    pub fn add_out(&mut self, ops: u64, bytes: u64) {
        self.out_ops += ops;
        self.out_bytes += bytes;
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct ConnectionMetrics {
    pub server: SideMetrics,
    pub client: SideMetrics,
}

impl ConnectionMetrics {
    fn reset(&mut self) {
        *self = ConnectionMetrics::default();
    }
}

#[derive(Clone, Debug)]
pub struct Connection {
    pub comm: SmolStr,
    pub server: Option<EndpointRef>,
    pub client: Option<EndpointRef>,
    pub first_seen_ts: u64,
    pub last_activity_ts: u64,
    /// Live descriptors referencing this record.
    pub refcount: u32,
    pub flags: AnalysisFlags,
    pub metrics: ConnectionMetrics,
}

impl Connection {
    pub fn new(comm: SmolStr, now: u64) -> Self {
        Connection {
            comm,
            server: None,
            client: None,
            first_seen_ts: now,
            last_activity_ts: now,
            refcount: 0,
            flags: AnalysisFlags::NEW,
            metrics: ConnectionMetrics::default(),
        }
    }

    pub fn is_server_only(&self) -> bool {
        self.server.is_some() && self.client.is_none()
    }

    pub fn is_client_only(&self) -> bool {
        self.client.is_some() && self.server.is_none()
    }

    pub fn is_full(&self) -> bool {
        self.server.is_some() && self.client.is_some()
    }

    /// Whether `(pid, fd)` is one of the two descriptors already recorded.
    pub fn matches_endpoint(&self, pid: i64, fd: i64) -> bool {
        let matches = |side: &Option<EndpointRef>| side.is_some_and(|ep| ep.pid == pid && ep.fd == fd);
        matches(&self.server) || matches(&self.client)
    }

    pub(crate) fn record_endpoint(&mut self, is_client: bool, ep: EndpointRef) {
        let side = if is_client { &mut self.client } else { &mut self.server };
        match side {
            Some(existing) if *existing == ep => {}
            Some(_) => *side = Some(ep),
            None => {
                *side = Some(ep);
                self.refcount += 1;
            }
        }
    }

    /// Forgets everything measured so far, keeping only the key slot.
    pub fn reset(&mut self) {
        self.metrics.reset();
        self.server = None;
        self.client = None;
        self.refcount = 0;
    }

    pub fn reset_server(&mut self) {
        self.metrics.server = SideMetrics::default();
        if self.server.take().is_some() {
            self.refcount = self.refcount.saturating_sub(1);
        }
    }

    pub fn reset_client(&mut self) {
        self.metrics.client = SideMetrics::default();
        if self.client.take().is_some() {
            self.refcount = self.refcount.saturating_sub(1);
        }
    }

    /// Recycles a closed record in place so the key slot survives. CLOSED must
    /// be gone before the counters are zeroed, and REUSED only goes up after.
    pub(crate) fn mark_reused(&mut self, now: u64) {
        self.flags.remove(AnalysisFlags::CLOSED | AnalysisFlags::PENDING_REMOVAL);
        self.reset();
        self.flags.insert(AnalysisFlags::REUSED);
        self.first_seen_ts = now;
        self.last_activity_ts = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(pid: i64, fd: i64) -> EndpointRef {
        EndpointRef { pid, tid: pid, fd }
    }

    #[test]
    fn role_population_is_reflected_by_the_predicates() {
        let mut conn = Connection::new(SmolStr::new("nginx"), 1);
        assert!(!conn.is_server_only() && !conn.is_client_only() && !conn.is_full());

        conn.record_endpoint(false, endpoint(10, 3));
        assert!(conn.is_server_only());

        conn.record_endpoint(true, endpoint(20, 5));
        assert!(conn.is_full());
        assert_eq!(conn.refcount, 2);
    }

    #[test]
    fn recording_the_same_endpoint_twice_does_not_bump_the_refcount() {
        let mut conn = Connection::new(SmolStr::new("nginx"), 1);
        conn.record_endpoint(false, endpoint(10, 3));
        conn.record_endpoint(false, endpoint(10, 3));

        assert_eq!(conn.refcount, 1);
    }

    #[test]
    fn mark_reused_clears_closed_before_zeroing() {
        let mut conn = Connection::new(SmolStr::new("mysqld"), 1);
        conn.record_endpoint(false, endpoint(10, 3));
        conn.metrics.server.add_in(2, 100);
        conn.flags.insert(AnalysisFlags::CLOSED);

        conn.mark_reused(42);

        assert!(!conn.flags.contains(AnalysisFlags::CLOSED));
        assert!(conn.flags.contains(AnalysisFlags::REUSED));
        assert_eq!(conn.metrics, ConnectionMetrics::default());
        assert_eq!(conn.first_seen_ts, 42);
    }
}
