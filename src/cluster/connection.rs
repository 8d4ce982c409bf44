//! Connection state machine.
//!
//! One slot in the pool arena: the live client handle, its I/O forwarding
//! task, and the scheduling state. Only the cluster actor mutates these.

use std::collections::HashSet;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_postgres::Client;

/// Stable arena handle for one connection slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct ConnId(pub(crate) u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnStatus {
    Lost,
    Idle,
    IdleInTransaction,
    Busy,
    BusyInTransaction,
}

pub(crate) struct Connection {
    pub(crate) id: ConnId,
    /// Absent while the link is lost.
    pub(crate) client: Option<Arc<Client>>,
    io_task: Option<JoinHandle<()>>,
    pub(crate) status: ConnStatus,
    /// Invariant: `Some` iff status is a busy variant.
    pub(crate) current: Option<u64>,
    /// Channels this link has issued LISTEN for; replayed on reestablish.
    pub(crate) listens: HashSet<String>,
}

impl Connection {
    pub(crate) fn new(id: ConnId, client: Arc<Client>, io_task: JoinHandle<()>) -> Self {
        Self {
            id,
            client: Some(client),
            io_task: Some(io_task),
            status: ConnStatus::Idle,
            current: None,
            listens: HashSet::new(),
        }
    }

    pub(crate) fn busy(&self) -> bool {
        self.current.is_some()
            || matches!(self.status, ConnStatus::Busy | ConnStatus::BusyInTransaction)
    }

    pub(crate) fn in_transaction(&self) -> bool {
        matches!(
            self.status,
            ConnStatus::IdleInTransaction | ConnStatus::BusyInTransaction
        )
    }

    pub(crate) fn lost(&self) -> bool {
        self.status == ConnStatus::Lost
    }

    /// idle[*] → busy[*], binding the request.
    pub(crate) fn make_busy(&mut self, request: u64) {
        debug_assert!(!self.busy(), "make_busy on a busy connection");
        self.status = if self.in_transaction() {
            ConnStatus::BusyInTransaction
        } else {
            ConnStatus::Busy
        };
        self.current = Some(request);
    }

    /// busy[*] → idle[*], returning the bound request.
    pub(crate) fn make_idle(&mut self, in_transaction: bool) -> Option<u64> {
        self.status = if in_transaction {
            ConnStatus::IdleInTransaction
        } else {
            ConnStatus::Idle
        };
        self.current.take()
    }

    /// any → lost; drops the client handle and returns the bound request.
    pub(crate) fn make_lost(&mut self) -> Option<u64> {
        self.status = ConnStatus::Lost;
        self.client = None;
        if let Some(task) = self.io_task.take() {
            task.abort();
        }
        self.current.take()
    }

    /// lost → idle with a fresh link.
    pub(crate) fn restore(&mut self, client: Arc<Client>, io_task: JoinHandle<()>) {
        debug_assert!(self.lost(), "restore on a live connection");
        self.client = Some(client);
        self.io_task = Some(io_task);
        self.status = ConnStatus::Idle;
        self.current = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Client instances only come from a live handshake, so the state
    // machine is exercised on a lost slot brought up manually.
    fn slot() -> Connection {
        Connection {
            id: ConnId(1),
            client: None,
            io_task: None,
            status: ConnStatus::Idle,
            current: None,
            listens: HashSet::new(),
        }
    }

    #[test]
    fn test_busy_idle_cycle() {
        let mut conn = slot();
        assert!(!conn.busy());

        conn.make_busy(42);
        assert!(conn.busy());
        assert_eq!(conn.status, ConnStatus::Busy);

        assert_eq!(conn.make_idle(false), Some(42));
        assert!(!conn.busy());
        assert_eq!(conn.status, ConnStatus::Idle);
    }

    #[test]
    fn test_transaction_shadow_states() {
        let mut conn = slot();
        conn.make_busy(1);
        conn.make_idle(true);
        assert_eq!(conn.status, ConnStatus::IdleInTransaction);
        assert!(conn.in_transaction());
        assert!(!conn.busy());

        conn.make_busy(2);
        assert_eq!(conn.status, ConnStatus::BusyInTransaction);

        conn.make_idle(false);
        assert_eq!(conn.status, ConnStatus::Idle);
        assert!(!conn.in_transaction());
    }

    #[test]
    fn test_make_lost_clears_current() {
        let mut conn = slot();
        conn.make_busy(7);
        assert_eq!(conn.make_lost(), Some(7));
        assert!(conn.lost());
        assert!(conn.current.is_none());
        // a second loss report has nothing left to surrender
        assert_eq!(conn.make_lost(), None);
    }
}
