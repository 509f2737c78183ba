//! Per-thread descriptor bookkeeping decorated by the listener.

use std::collections::HashMap;

use crate::conn::{Ipv4Tuple, PipeKey, Role, UnixTuple};
use crate::transaction::PartialTransaction;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FdFlags: u16 {
        const TRANSACTION = 1 << 0;
        const ROLE_CLIENT = 1 << 1;
        const ROLE_SERVER = 1 << 2;
        const CLOSE_IN_PROGRESS = 1 << 3;
        const CLOSE_CANCELED = 1 << 4;
        const SOCKET_PIPE = 1 << 5;
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FdType {
    File,
    Ipv4Socket(Ipv4Tuple),
    UnixSocket(UnixTuple),
    Pipe(PipeKey),
    Other,
}

#[derive(Debug, Default)]
pub struct FdInfo {
    pub fd_type: FdType,
    pub flags: FdFlags,
    /// Absolute path for file descriptors, empty otherwise.
    pub name: String,
    pub transaction: Option<PartialTransaction>,
}

impl Default for FdType {
    fn default() -> Self {
        FdType::Other
    }
}

impl Default for FdFlags {
    fn default() -> Self {
        FdFlags::empty()
    }
}

impl FdInfo {
    pub fn file(name: impl Into<String>) -> Self {
        FdInfo {
            fd_type: FdType::File,
            name: name.into(),
            ..FdInfo::default()
        }
    }

    pub fn is_file(&self) -> bool {
        self.fd_type == FdType::File
    }

    pub fn is_ipv4_socket(&self) -> bool {
        matches!(self.fd_type, FdType::Ipv4Socket(_))
    }

    pub fn is_unix_socket(&self) -> bool {
        matches!(self.fd_type, FdType::UnixSocket(_))
    }

    pub fn is_pipe(&self) -> bool {
        matches!(self.fd_type, FdType::Pipe(_))
    }

    pub fn role(&self) -> Option<Role> {
        if self.flags.contains(FdFlags::ROLE_SERVER) {
            Some(Role::Server)
        } else if self.flags.contains(FdFlags::ROLE_CLIENT) {
            Some(Role::Client)
        } else {
            None
        }
    }

    pub fn has_role_server(&self) -> bool {
        self.flags.contains(FdFlags::ROLE_SERVER)
    }

    pub fn has_role_client(&self) -> bool {
        self.flags.contains(FdFlags::ROLE_CLIENT)
    }

    pub fn is_role_none(&self) -> bool {
        self.role().is_none()
    }

    /// The client and server bits are exclusive; flipping an already-assigned
    /// role is a bug upstream, so it trips an assertion in debug builds and is
    /// normalized by dropping the stale bit otherwise.
    pub fn set_role_server(&mut self) {
        debug_assert!(
            !self.flags.contains(FdFlags::ROLE_CLIENT),
            "descriptor switching from client to server role"
        );
        self.flags.remove(FdFlags::ROLE_CLIENT);
        self.flags.insert(FdFlags::ROLE_SERVER);
    }

    pub fn set_role_client(&mut self) {
        debug_assert!(
            !self.flags.contains(FdFlags::ROLE_SERVER),
            "descriptor switching from server to client role"
        );
        self.flags.remove(FdFlags::ROLE_SERVER);
        self.flags.insert(FdFlags::ROLE_CLIENT);
    }

    pub fn is_transaction(&self) -> bool {
        self.flags.contains(FdFlags::TRANSACTION)
    }

    /// Returns the transaction for this descriptor, creating it on first use.
    pub fn transaction_mut(&mut self) -> &mut PartialTransaction {
        self.flags.insert(FdFlags::TRANSACTION);
        self.transaction.get_or_insert_with(PartialTransaction::new)
    }

    /// Port the server side of the flow listens on (for IPv4 tuples the
    /// destination port, however the flow was observed).
    pub fn server_port(&self) -> u16 {
        match self.fd_type {
            FdType::Ipv4Socket(tuple) => tuple.dport,
            _ => 0,
        }
    }
}

#[derive(Default)]
pub struct FdTable {
    fds: HashMap<(i64, i64), FdInfo>,
}

impl FdTable {
    pub fn get(&self, tid: i64, fd: i64) -> Option<&FdInfo> {
        self.fds.get(&(tid, fd))
    }

    pub fn find(&mut self, tid: i64, fd: i64) -> Option<&mut FdInfo> {
        self.fds.get_mut(&(tid, fd))
    }

    pub fn get_or_create(&mut self, tid: i64, fd: i64) -> &mut FdInfo {
        self.fds.entry((tid, fd)).or_default()
    }

    pub fn insert(&mut self, tid: i64, fd: i64, fdinfo: FdInfo) {
        self.fds.insert((tid, fd), fdinfo);
    }

    pub fn erase(&mut self, tid: i64, fd: i64) -> Option<FdInfo> {
        self.fds.remove(&(tid, fd))
    }

    pub fn len(&self) -> usize {
        self.fds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_are_exclusive() {
        let mut fdinfo = FdInfo::default();

        fdinfo.set_role_server();

        assert!(fdinfo.has_role_server());
        assert!(!fdinfo.has_role_client());
        assert_eq!(fdinfo.role(), Some(Role::Server));
    }

    #[test]
    fn transaction_is_attached_on_first_use() {
        let mut fdinfo = FdInfo::default();
        assert!(!fdinfo.is_transaction());

        fdinfo.transaction_mut();

        assert!(fdinfo.is_transaction());
        assert!(fdinfo.transaction.is_some());
    }

    #[test]
    fn erase_drops_the_descriptor_and_its_transaction() {
        let mut table = FdTable::default();
        table.get_or_create(100, 7).transaction_mut();

        let erased = table.erase(100, 7).expect("descriptor was present");

        assert!(erased.transaction.is_some());
        assert!(table.find(100, 7).is_none());
    }
}
