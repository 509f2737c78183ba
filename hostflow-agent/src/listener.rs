//! Syscall-event listener: turns descriptor I/O into connection and
//! transaction state.
//!
//! Every operation here runs synchronously on the event thread; the listener
//! is the single writer of the connection tables and the file-stat table.

use std::net::Ipv4Addr;
use std::sync::Arc;

use crate::conn::{AnalysisFlags, Connection, ConnectionTable, Ipv4Tuple, PipeKey, UnixTuple};
use crate::event::{ReadOp, SockAddr};
use crate::fd::{FdInfo, FdType};
use crate::filestat::FileStatTable;
use crate::proto::{self, Direction, ProtoType};
use crate::thread::ThreadInfo;

/// Answers whether an address belongs to this host. Backed by the interface
/// list in production; tests substitute a fixed set.
pub trait LocalNetwork: Send + Sync {
    fn is_ipv4_in_local_machine(&self, addr: Ipv4Addr) -> bool;
}

pub struct StaticLocalNetwork {
    addrs: Vec<Ipv4Addr>,
}

impl StaticLocalNetwork {
    pub fn new(addrs: Vec<Ipv4Addr>) -> Self {
        StaticLocalNetwork { addrs }
    }
}

impl LocalNetwork for StaticLocalNetwork {
    fn is_ipv4_in_local_machine(&self, addr: Ipv4Addr) -> bool {
        addr.is_loopback() || self.addrs.contains(&addr)
    }
}

/// What a connection lookup found, before the observer is merged in.
enum Found {
    Missing,
    Matching,
    Closed,
    ServerOnly,
    ClientOnly,
    Full,
}

pub struct FdListener {
    ipv4_connections: ConnectionTable<Ipv4Tuple>,
    unix_connections: ConnectionTable<UnixTuple>,
    pipe_connections: ConnectionTable<PipeKey>,
    file_stats: FileStatTable,
    local_network: Arc<dyn LocalNetwork>,
}

impl FdListener {
    pub fn new(max_connection_table_size: usize, local_network: Arc<dyn LocalNetwork>) -> Self {
        FdListener {
            ipv4_connections: ConnectionTable::new(max_connection_table_size),
            unix_connections: ConnectionTable::new(max_connection_table_size),
            pipe_connections: ConnectionTable::new(max_connection_table_size),
            file_stats: FileStatTable::default(),
            local_network,
        }
    }

    pub fn ipv4_connections(&self) -> &ConnectionTable<Ipv4Tuple> {
        &self.ipv4_connections
    }

    pub fn ipv4_connections_mut(&mut self) -> &mut ConnectionTable<Ipv4Tuple> {
        &mut self.ipv4_connections
    }

    pub fn unix_connections(&self) -> &ConnectionTable<UnixTuple> {
        &self.unix_connections
    }

    pub fn unix_connections_mut(&mut self) -> &mut ConnectionTable<UnixTuple> {
        &mut self.unix_connections
    }

    pub fn pipe_connections(&self) -> &ConnectionTable<PipeKey> {
        &self.pipe_connections
    }

    pub fn pipe_connections_mut(&mut self) -> &mut ConnectionTable<PipeKey> {
        &mut self.pipe_connections
    }

    pub fn file_stats(&self) -> &FileStatTable {
        &self.file_stats
    }

    pub fn file_stats_mut(&mut self) -> &mut FileStatTable {
        &mut self.file_stats
    }

    #[allow(clippy::too_many_arguments)]
    pub fn on_read(
        &mut self,
        ts: u64,
        tinfo: &mut ThreadInfo,
        fd: i64,
        fdinfo: &mut FdInfo,
        op: ReadOp,
        data: &[u8],
        original_len: u32,
        len: u32,
    ) {
        if fdinfo.is_file() {
            let stat = self.file_stats.get_or_create(&fdinfo.name);
            stat.bytes += u64::from(original_len);
            stat.time_ns += tinfo.latency;
            return;
        }

        // The recv family reports 0 when the peer has closed the connection.
        let dir = if len == 0 && op.signals_peer_close() {
            Direction::Close
        } else {
            Direction::In
        };

        self.socket_io(ts, tinfo, fd, fdinfo, dir, data, original_len);
    }

    #[allow(clippy::too_many_arguments)]
    pub fn on_write(
        &mut self,
        ts: u64,
        tinfo: &mut ThreadInfo,
        fd: i64,
        fdinfo: &mut FdInfo,
        data: &[u8],
        original_len: u32,
        _len: u32,
    ) {
        if fdinfo.is_file() {
            let stat = self.file_stats.get_or_create(&fdinfo.name);
            stat.bytes += u64::from(original_len);
            stat.time_ns += tinfo.latency;
            return;
        }

        self.socket_io(ts, tinfo, fd, fdinfo, Direction::Out, data, original_len);
    }

    pub fn on_connect(
        &mut self,
        ts: u64,
        tinfo: &mut ThreadInfo,
        fd: i64,
        fdinfo: &mut FdInfo,
        addr: SockAddr,
    ) {
        match addr {
            SockAddr::Inet(tuple) => {
                fdinfo.fd_type = FdType::Ipv4Socket(tuple);
                fdinfo.set_role_client();
                fdinfo.transaction_mut();
                tinfo.add_client_port(tuple.sport);

                // An existing record for the tuple is superseded: a closed one
                // is recycled in place, a live one has its client side
                // re-claimed. UDP sockets do this on every connect.
                self.ipv4_connections
                    .add(tuple, &tinfo.comm, tinfo.pid, tinfo.tid, fd, true, ts);
            }
            SockAddr::Unix(tuple) => {
                fdinfo.fd_type = FdType::UnixSocket(tuple);
                fdinfo.set_role_client();
                fdinfo.transaction_mut();

                let conn = self
                    .unix_connections
                    .add(tuple, &tinfo.comm, tinfo.pid, tinfo.tid, fd, true, ts);
                Self::flag_zero_dest(conn, tuple);
            }
        }
    }

    pub fn on_accept(
        &mut self,
        ts: u64,
        tinfo: &mut ThreadInfo,
        new_fd: i64,
        new_fdinfo: &mut FdInfo,
        addr: SockAddr,
    ) {
        match addr {
            SockAddr::Inet(tuple) => {
                new_fdinfo.fd_type = FdType::Ipv4Socket(tuple);
                new_fdinfo.set_role_server();
                tinfo.bind_port(tuple.dport);

                self.ipv4_connections
                    .add(tuple, &tinfo.comm, tinfo.pid, tinfo.tid, new_fd, false, ts);
            }
            SockAddr::Unix(tuple) => {
                new_fdinfo.fd_type = FdType::UnixSocket(tuple);
                new_fdinfo.set_role_server();

                let conn = self
                    .unix_connections
                    .add(tuple, &tinfo.comm, tinfo.pid, tinfo.tid, new_fd, false, ts);
                Self::flag_zero_dest(conn, tuple);
            }
        }

        new_fdinfo.transaction_mut();
    }

    pub fn on_socket_shutdown(&mut self, ts: u64, fdinfo: &mut FdInfo) {
        if !fdinfo.is_transaction() {
            return;
        }

        let fd_type = fdinfo.fd_type;
        let role = fdinfo.role();
        let Some(trinfo) = fdinfo.transaction.as_mut() else {
            return;
        };
        if !trinfo.is_active() {
            return;
        }

        let conn = match fd_type {
            FdType::Ipv4Socket(tuple) => self.ipv4_connections.get(&tuple, ts),
            FdType::UnixSocket(tuple) => self.unix_connections.get(&tuple, ts),
            _ => None,
        };

        trinfo.update(ts, Direction::Close, 0, role, conn, &[]);
        trinfo.mark_inactive();
    }

    /// The descriptor is going away: wind down its transaction and release its
    /// reference on the connection. Actual record eviction happens at the
    /// next flush boundary.
    pub fn on_erase_fd(&mut self, ts: u64, fdinfo: &mut FdInfo) {
        if fdinfo.is_transaction() {
            let fd_type = fdinfo.fd_type;
            let role = fdinfo.role();
            if let Some(trinfo) = fdinfo.transaction.as_mut() {
                if trinfo.is_active() {
                    let conn = match fd_type {
                        FdType::Ipv4Socket(tuple) => self.ipv4_connections.get(&tuple, ts),
                        FdType::UnixSocket(tuple) => self.unix_connections.get(&tuple, ts),
                        _ => None,
                    };
                    trinfo.update(ts, Direction::Close, 0, role, conn, &[]);
                }
                trinfo.mark_inactive();
            }
        }

        if fdinfo.is_role_none() {
            return;
        }

        match fdinfo.fd_type {
            FdType::Ipv4Socket(tuple) => self.ipv4_connections.remove(&tuple, false),
            FdType::UnixSocket(tuple) => self.unix_connections.remove(&tuple, false),
            _ => {}
        }
    }

    pub fn on_file_create(&mut self, fdinfo: Option<&FdInfo>, fullpath: &str) {
        let stat = self.file_stats.get_or_create(fullpath);
        match fdinfo {
            Some(fdinfo) if fdinfo.is_file() => stat.open_count += 1,
            Some(_) => {}
            None => stat.errors += 1,
        }
    }

    pub fn on_error(&mut self, fdinfo: &FdInfo) {
        if fdinfo.is_file() {
            self.file_stats.get_or_create(&fdinfo.name).errors += 1;
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn socket_io(
        &mut self,
        ts: u64,
        tinfo: &mut ThreadInfo,
        fd: i64,
        fdinfo: &mut FdInfo,
        dir: Direction,
        data: &[u8],
        original_len: u32,
    ) {
        let fd_type = fdinfo.fd_type;

        match fd_type {
            FdType::Ipv4Socket(tuple) => self.prepare_ipv4(ts, tinfo, fd, fdinfo, tuple, dir),
            FdType::UnixSocket(tuple) => self.prepare_unix(ts, tinfo, fd, fdinfo, tuple, dir),
            FdType::Pipe(key) => {
                self.track_pipe(ts, tinfo, fd, key, dir);
                return;
            }
            FdType::File | FdType::Other => return,
        }

        let role = fdinfo.role();
        let server_port = fdinfo.server_port();
        let trinfo = fdinfo.transaction_mut();

        // A transaction keeps discovering its protocol for the first two
        // direction switches; a type beyond Ip means the connection was reset
        // by something like a shutdown and only needs re-activation.
        if !trinfo.is_active()
            || (trinfo.direction_switches < 2 && trinfo.proto <= ProtoType::Ip)
        {
            if trinfo.proto <= ProtoType::Ip {
                let detection = proto::detect_proto(
                    &mut trinfo.reassembly,
                    server_port,
                    role,
                    dir,
                    trinfo.last_direction,
                    data,
                );
                if detection.parser.is_some() {
                    trinfo.parser = detection.parser;
                }
                trinfo.mark_active_and_reset(detection.proto);
            } else {
                let proto = trinfo.proto;
                trinfo.mark_active_and_reset(proto);
            }
        }

        let conn = match fd_type {
            FdType::Ipv4Socket(tuple) => self.ipv4_connections.get(&tuple, ts),
            FdType::UnixSocket(tuple) => self.unix_connections.get(&tuple, ts),
            _ => None,
        };

        trinfo.update(ts, dir, u64::from(original_len), role, conn, data);

        if dir == Direction::Close {
            trinfo.mark_inactive();
        }
    }

    /// Brings the IPv4 record for `tuple` in line with this observer,
    /// resolving the observer's role along the way when accept/connect was
    /// never seen.
    fn prepare_ipv4(
        &mut self,
        ts: u64,
        tinfo: &mut ThreadInfo,
        fd: i64,
        fdinfo: &mut FdInfo,
        tuple: Ipv4Tuple,
        dir: Direction,
    ) {
        let incoming = dir != Direction::Out;

        let found = match self.ipv4_connections.get(&tuple, ts) {
            None => Found::Missing,
            Some(conn) => Self::classify(conn, tinfo.pid, fd),
        };

        match found {
            Found::Matching => return,
            Found::Missing | Found::Closed | Found::Full => {
                if fdinfo.is_role_none() {
                    self.patch_network_role(tinfo, fdinfo, tuple, incoming);
                }
            }
            Found::ServerOnly => {
                if fdinfo.is_role_none() {
                    fdinfo.set_role_client();
                }
            }
            Found::ClientOnly => {
                if fdinfo.is_role_none() {
                    fdinfo.set_role_server();
                }
            }
        }

        self.ipv4_connections.add(
            tuple,
            &tinfo.comm,
            tinfo.pid,
            tinfo.tid,
            fd,
            fdinfo.has_role_client(),
            ts,
        );
    }

    fn prepare_unix(
        &mut self,
        ts: u64,
        tinfo: &mut ThreadInfo,
        fd: i64,
        fdinfo: &mut FdInfo,
        tuple: UnixTuple,
        dir: Direction,
    ) {
        let incoming = dir != Direction::Out;

        let found = match self.unix_connections.get(&tuple, ts) {
            None => Found::Missing,
            Some(conn) => Self::classify(conn, tinfo.pid, fd),
        };

        match found {
            Found::Matching => return,
            Found::Missing | Found::Closed | Found::Full => {
                // Servers usually start with a read, clients with a write.
                if fdinfo.is_role_none() {
                    if incoming {
                        fdinfo.set_role_server();
                    } else {
                        fdinfo.set_role_client();
                    }
                }
            }
            Found::ServerOnly => {
                if fdinfo.is_role_none() {
                    fdinfo.set_role_client();
                }
            }
            Found::ClientOnly => {
                if fdinfo.is_role_none() {
                    fdinfo.set_role_server();
                }
            }
        }

        let conn = self.unix_connections.add(
            tuple,
            &tinfo.comm,
            tinfo.pid,
            tinfo.tid,
            fd,
            fdinfo.has_role_client(),
            ts,
        );
        Self::flag_zero_dest(conn, tuple);
    }

    /// Pipes carry no transactions; reads keep the reader end fresh, writes
    /// the writer end.
    fn track_pipe(&mut self, ts: u64, tinfo: &mut ThreadInfo, fd: i64, key: PipeKey, dir: Direction) {
        let reading = dir != Direction::Out;

        let needs_add = match self.pipe_connections.get(&key, ts) {
            None => true,
            Some(conn) => {
                if reading {
                    conn.is_server_only()
                } else {
                    conn.is_client_only()
                }
            }
        };

        if needs_add {
            self.pipe_connections
                .add(key, &tinfo.comm, tinfo.pid, tinfo.tid, fd, reading, ts);
        }
    }

    /// Resolves the local role of a flow whose accept/connect was lost.
    fn patch_network_role(
        &self,
        tinfo: &ThreadInfo,
        fdinfo: &mut FdInfo,
        tuple: Ipv4Tuple,
        incoming: bool,
    ) {
        let sip_local = self.local_network.is_ipv4_in_local_machine(tuple.sip);
        let dip_local = self.local_network.is_ipv4_in_local_machine(tuple.dip);

        // Only one endpoint on this host: that endpoint is the local role.
        if sip_local && !dip_local {
            fdinfo.set_role_client();
            return;
        }
        if dip_local && !sip_local {
            fdinfo.set_role_server();
            return;
        }

        // Both endpoints local: the thread owning the destination port is the
        // server, unless it also uses the source port as a client port.
        if tinfo.is_bound_to_port(tuple.dport) {
            if !tinfo.uses_client_port(tuple.sport) {
                fdinfo.set_role_server();
                return;
            }
        } else {
            fdinfo.set_role_client();
            return;
        }

        // No better signal: servers usually start with a read, clients with a
        // write.
        if fdinfo.is_role_none() {
            if incoming {
                fdinfo.set_role_server();
            } else {
                fdinfo.set_role_client();
            }
        }
    }

    fn classify(conn: &Connection, pid: i64, fd: i64) -> Found {
        if conn.flags.contains(AnalysisFlags::CLOSED) {
            Found::Closed
        } else if conn.matches_endpoint(pid, fd) {
            Found::Matching
        } else if conn.is_server_only() {
            Found::ServerOnly
        } else if conn.is_client_only() {
            Found::ClientOnly
        } else {
            Found::Full
        }
    }

    fn flag_zero_dest(conn: Option<&mut Connection>, tuple: UnixTuple) {
        if tuple.dest != 0 {
            return;
        }
        debug!(source = tuple.source, "Unix connection with a null destination address");
        if let Some(conn) = conn {
            conn.flags.insert(AnalysisFlags::ZERO_DEST);
        }
    }
}
