//! Per-descriptor transaction state.
//!
//! A transaction is created on the first data-bearing event of a socket
//! descriptor and lives exactly as long as the descriptor. It refines its
//! protocol during the first two direction switches, then freezes it.

use crate::conn::{Connection, Role};
use crate::proto::{Direction, ProtoType, ProtocolParser, ReassemblyBuffer};

#[derive(Debug, Default)]
pub struct PartialTransaction {
    pub proto: ProtoType,
    pub active: bool,
    pub direction_switches: u32,
    pub last_direction: Option<Direction>,
    pub(crate) reassembly: ReassemblyBuffer,
    pub parser: Option<ProtocolParser>,
}

impl PartialTransaction {
    pub fn new() -> Self {
        PartialTransaction::default()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// (Re)arms the transaction with a freshly discovered protocol. The
    /// discovery scratch space is released once the protocol is settled.
    pub fn mark_active_and_reset(&mut self, proto: ProtoType) {
        self.proto = proto;
        self.active = true;
        if proto > ProtoType::Ip {
            self.reassembly.clear();
        }
    }

    pub fn mark_inactive(&mut self) {
        self.active = false;
    }

    /// Folds one I/O event into the transaction and, through `conn`, into the
    /// connection-side counters. A missing connection (table saturated) still
    /// advances the direction bookkeeping so discovery stays coherent.
    pub fn update(
        &mut self,
        now: u64,
        dir: Direction,
        bytes: u64,
        role: Option<Role>,
        conn: Option<&mut Connection>,
        payload: &[u8],
    ) {
        if let Some(conn) = conn {
            if dir != Direction::Close {
                Self::credit(conn, role, dir, bytes);
            }
            conn.last_activity_ts = now;
        }

        if let Some(parser) = self.parser.as_mut() {
            parser.parse(dir, payload);
        }

        if self.last_direction.is_some_and(|last| last != dir) {
            self.direction_switches += 1;
        }
        self.last_direction = Some(dir);
    }

    fn credit(conn: &mut Connection, role: Option<Role>, dir: Direction, bytes: u64) {
        let Some(role) = role else {
            debug_assert!(false, "crediting I/O on a descriptor with no resolved role");
            return;
        };

        let side = match role {
            Role::Server => &mut conn.metrics.server,
            Role::Client => &mut conn.metrics.client,
        };

        match dir {
            Direction::In => side.add_in(1, bytes),
            Direction::Out => side.add_out(1, bytes),
            Direction::Close => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use smol_str::SmolStr;

    use super::*;

    fn connection() -> Connection {
        Connection::new(SmolStr::new("postgres"), 1)
    }

    #[test]
    fn activate_then_deactivate_keeps_the_protocol() {
        let mut tx = PartialTransaction::new();

        tx.mark_active_and_reset(ProtoType::Http);
        tx.mark_inactive();

        assert_eq!(tx.proto, ProtoType::Http);
        assert!(!tx.is_active());
    }

    #[test]
    fn direction_switches_are_counted_on_change_only() {
        let mut tx = PartialTransaction::new();
        tx.mark_active_and_reset(ProtoType::Ip);
        let mut conn = connection();

        tx.update(10, Direction::In, 8, Some(Role::Server), Some(&mut conn), &[]);
        tx.update(11, Direction::In, 8, Some(Role::Server), Some(&mut conn), &[]);
        tx.update(12, Direction::Out, 8, Some(Role::Server), Some(&mut conn), &[]);
        tx.update(13, Direction::In, 8, Some(Role::Server), Some(&mut conn), &[]);

        assert_eq!(tx.direction_switches, 2);
        assert_eq!(tx.last_direction, Some(Direction::In));
    }

    #[test]
    fn server_reads_credit_the_server_in_side() {
        let mut tx = PartialTransaction::new();
        tx.mark_active_and_reset(ProtoType::Ip);
        let mut conn = connection();

        tx.update(10, Direction::In, 128, Some(Role::Server), Some(&mut conn), &[]);
        tx.update(11, Direction::In, 256, Some(Role::Server), Some(&mut conn), &[]);

        assert_eq!(conn.metrics.server.in_ops, 2);
        assert_eq!(conn.metrics.server.in_bytes, 384);
        assert_eq!(conn.metrics.client, Default::default());
        assert_eq!(conn.last_activity_ts, 11);
    }

    #[test]
    fn close_updates_do_not_credit() {
        let mut tx = PartialTransaction::new();
        tx.mark_active_and_reset(ProtoType::Ip);
        let mut conn = connection();

        tx.update(10, Direction::Close, 0, Some(Role::Server), Some(&mut conn), &[]);

        assert_eq!(conn.metrics.server.in_ops, 0);
        assert_eq!(tx.last_direction, Some(Direction::Close));
    }

    #[test]
    fn saturated_table_still_advances_direction_state() {
        let mut tx = PartialTransaction::new();
        tx.mark_active_and_reset(ProtoType::Ip);

        tx.update(10, Direction::In, 64, Some(Role::Server), None, &[]);
        tx.update(11, Direction::Out, 64, Some(Role::Server), None, &[]);

        assert_eq!(tx.direction_switches, 1);
        assert_eq!(tx.last_direction, Some(Direction::Out));
    }
}
