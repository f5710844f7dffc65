//! Per-request context and the per-connection cleanup table.
//!
//! A `CallContext` only exists while the dispatch loop is serving one request;
//! handlers borrow it and cannot keep it. Anything that must outlive the request
//! takes a `CleanupScope`, which is bound to the connection and holds the table
//! weakly.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use voodoo_core::Id;

/// Teardown action run when its connection is lost.
pub type CleanupAction = Box<dyn FnOnce() + Send>;

/// Server-local handle of one accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn new(raw: u64) -> Self {
        ConnectionId(raw)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Cleanup entries per connection, kept in insertion order.
#[derive(Default)]
pub(crate) struct CleanupTable {
    entries: Mutex<HashMap<ConnectionId, Vec<(Id, CleanupAction)>>>,
}

impl CleanupTable {
    pub(crate) fn push(&self, conn: ConnectionId, id: Id, action: CleanupAction) {
        lock(&self.entries).entry(conn).or_default().push((id, action));
    }

    pub(crate) fn remove(&self, conn: ConnectionId, id: Id) -> bool {
        let removed = {
            let mut entries = lock(&self.entries);
            let Some(list) = entries.get_mut(&conn) else {
                return false;
            };
            let Some(pos) = list.iter().position(|(entry, _)| *entry == id) else {
                return false;
            };
            let removed = list.remove(pos);
            if list.is_empty() {
                entries.remove(&conn);
            }
            removed
        };
        drop(removed);
        true
    }

    /// Take every entry of `conn`, newest first.
    pub(crate) fn drain(&self, conn: ConnectionId) -> Vec<(Id, CleanupAction)> {
        let mut list = lock(&self.entries).remove(&conn).unwrap_or_default();
        list.reverse();
        list
    }

    #[cfg(test)]
    pub(crate) fn len(&self, conn: ConnectionId) -> usize {
        lock(&self.entries).get(&conn).map_or(0, Vec::len)
    }
}

/// The connection a request arrived on.
pub struct CallContext {
    connection: ConnectionId,
    peer: SocketAddr,
    cleanups: Arc<CleanupTable>,
}

impl CallContext {
    pub(crate) fn new(
        connection: ConnectionId,
        peer: SocketAddr,
        cleanups: Arc<CleanupTable>,
    ) -> Self {
        Self {
            connection,
            peer,
            cleanups,
        }
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Run `action` when this connection is lost, unless removed first.
    pub fn push_cleanup<F>(&self, id: Id, action: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.cleanups.push(self.connection, id, Box::new(action));
    }

    /// Drop the entry `id` of this connection without running it.
    pub fn remove_cleanup(&self, id: Id) -> bool {
        self.cleanups.remove(self.connection, id)
    }

    /// Non-owning handle to this connection's cleanup list.
    pub fn cleanup_scope(&self) -> CleanupScope {
        CleanupScope {
            connection: self.connection,
            cleanups: Arc::downgrade(&self.cleanups),
        }
    }
}

/// Lets an object remove its own cleanup entry later, from any request.
#[derive(Clone)]
pub struct CleanupScope {
    connection: ConnectionId,
    cleanups: Weak<CleanupTable>,
}

impl CleanupScope {
    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    pub fn remove(&self, id: Id) -> bool {
        match self.cleanups.upgrade() {
            Some(table) => table.remove(self.connection, id),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ctx(table: &Arc<CleanupTable>, conn: u64) -> CallContext {
        CallContext::new(
            ConnectionId::new(conn),
            "127.0.0.1:1".parse().unwrap(),
            table.clone(),
        )
    }

    #[test]
    fn drain_runs_newest_first_and_only_for_that_connection() {
        let table = Arc::new(CleanupTable::default());
        let order = Arc::new(Mutex::new(Vec::new()));
        let a = ctx(&table, 1);
        let b = ctx(&table, 2);
        for n in 1..=3u64 {
            let order = order.clone();
            a.push_cleanup(Id::new(n), move || order.lock().unwrap().push(n));
        }
        b.push_cleanup(Id::new(9), || {});

        for (_, action) in table.drain(a.connection()) {
            action();
        }
        assert_eq!(*order.lock().unwrap(), vec![3, 2, 1]);
        assert_eq!(table.len(a.connection()), 0);
        assert_eq!(table.len(b.connection()), 1);
    }

    #[test]
    fn removed_entry_never_runs() {
        let table = Arc::new(CleanupTable::default());
        let runs = Arc::new(AtomicUsize::new(0));
        let a = ctx(&table, 1);
        let counter = runs.clone();
        a.push_cleanup(Id::new(5), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let scope = a.cleanup_scope();
        assert!(scope.remove(Id::new(5)));
        assert!(!a.remove_cleanup(Id::new(5)));
        for (_, action) in table.drain(a.connection()) {
            action();
        }
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn scope_outliving_table_is_inert() {
        let table = Arc::new(CleanupTable::default());
        let scope = ctx(&table, 1).cleanup_scope();
        drop(table);
        assert!(!scope.remove(Id::new(1)));
    }
}
