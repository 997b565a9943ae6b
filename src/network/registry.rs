//! Connection registry
//!
//! Live connections are indexed twice: by id and by UDP endpoint. Both maps
//! sit behind one lock so a reader never sees a connection in one index but
//! not the other.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::ConnectionId;

/// Anything the registry can index
pub trait Registered {
    fn id(&self) -> ConnectionId;
    fn endpoint(&self) -> SocketAddr;
}

/// Outcome of an admission attempt
#[derive(Debug)]
pub enum Admission<C> {
    /// The connection is registered. `evicted` held the same endpoint before.
    Admitted { evicted: Option<Arc<C>> },
    /// The registry is full; the connection was not registered
    Refused { evicted: Option<Arc<C>> },
    /// The registry was drained for shutdown and takes no one new
    Closed,
}

impl<C> Admission<C> {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted { .. })
    }

    /// Take the connection that was pushed out of its endpoint slot
    pub fn into_evicted(self) -> Option<Arc<C>> {
        match self {
            Admission::Admitted { evicted } | Admission::Refused { evicted } => evicted,
            Admission::Closed => None,
        }
    }
}

struct Indexes<C> {
    by_id: HashMap<ConnectionId, Arc<C>>,
    by_endpoint: HashMap<SocketAddr, Arc<C>>,
    closed: bool,
}

impl<C: Registered> Indexes<C> {
    fn remove_endpoint(&mut self, endpoint: &SocketAddr) -> Option<Arc<C>> {
        let existing = self.by_endpoint.remove(endpoint)?;
        self.by_id.remove(&existing.id());
        Some(existing)
    }

    fn insert(&mut self, conn: Arc<C>) {
        if let Some(stale) = self.by_id.insert(conn.id(), conn.clone()) {
            self.by_endpoint.remove(&stale.endpoint());
        }
        self.by_endpoint.insert(conn.endpoint(), conn);
    }
}

/// Owns every live connection of a host
pub struct ConnectionRegistry<C> {
    indexes: RwLock<Indexes<C>>,
}

impl<C: Registered> Default for ConnectionRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Registered> ConnectionRegistry<C> {
    pub fn new() -> Self {
        Self {
            indexes: RwLock::new(Indexes {
                by_id: HashMap::new(),
                by_endpoint: HashMap::new(),
                closed: false,
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Indexes<C>> {
        self.indexes.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Indexes<C>> {
        self.indexes.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert into both indexes, evicting whatever held the same endpoint
    pub fn register(&self, conn: Arc<C>) -> Option<Arc<C>> {
        let mut indexes = self.write();
        let evicted = indexes.remove_endpoint(&conn.endpoint());
        indexes.insert(conn);
        evicted
    }

    /// Evict by endpoint, check capacity, then register, all under one lock
    ///
    /// `max_clients == 0` means unlimited.
    pub fn admit(&self, conn: Arc<C>, max_clients: usize) -> Admission<C> {
        self.admit_with(conn, max_clients, |_, _| {})
    }

    /// Like [`admit`](Self::admit), but runs `on_admitted` before the lock is
    /// released. Nobody can look the new connection up until it returns.
    ///
    /// `on_admitted` gets the new connection and whatever it evicted. It must
    /// not call back into the registry.
    pub fn admit_with<F>(&self, conn: Arc<C>, max_clients: usize, on_admitted: F) -> Admission<C>
    where
        F: FnOnce(&Arc<C>, Option<&Arc<C>>),
    {
        let mut indexes = self.write();
        if indexes.closed {
            return Admission::Closed;
        }

        let evicted = indexes.remove_endpoint(&conn.endpoint());

        if max_clients != 0 && indexes.by_id.len() >= max_clients {
            return Admission::Refused { evicted };
        }

        indexes.insert(conn.clone());
        on_admitted(&conn, evicted.as_ref());
        Admission::Admitted { evicted }
    }

    /// Remove from both indexes. Idempotent; only removes this exact instance.
    pub fn unregister(&self, conn: &Arc<C>) -> bool {
        let mut indexes = self.write();

        let by_id = matches!(indexes.by_id.get(&conn.id()), Some(c) if Arc::ptr_eq(c, conn));
        let by_endpoint = matches!(
            indexes.by_endpoint.get(&conn.endpoint()),
            Some(c) if Arc::ptr_eq(c, conn)
        );

        if by_id {
            indexes.by_id.remove(&conn.id());
        }
        if by_endpoint {
            indexes.by_endpoint.remove(&conn.endpoint());
        }

        by_id || by_endpoint
    }

    pub fn find_by_id(&self, id: ConnectionId) -> Option<Arc<C>> {
        self.read().by_id.get(&id).cloned()
    }

    pub fn find_by_endpoint(&self, endpoint: &SocketAddr) -> Option<Arc<C>> {
        self.read().by_endpoint.get(endpoint).cloned()
    }

    pub fn count(&self) -> usize {
        self.read().by_id.len()
    }

    /// Whether another connection fits (`max_clients == 0` means unlimited)
    pub fn has_capacity(&self, max_clients: usize) -> bool {
        max_clients == 0 || self.count() < max_clients
    }

    /// Every live connection
    pub fn snapshot(&self) -> Vec<Arc<C>> {
        self.read().by_id.values().cloned().collect()
    }

    /// Remove and return every connection. Later admissions get
    /// [`Admission::Closed`].
    pub fn drain(&self) -> Vec<Arc<C>> {
        let mut indexes = self.write();
        indexes.closed = true;
        indexes.by_endpoint.clear();
        indexes.by_id.drain().map(|(_, conn)| conn).collect()
    }
}
