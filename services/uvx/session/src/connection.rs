//! Server-side connections and the recency-ordered connection table.
//!
//! A [`Connection`] is shared as `Arc<Connection>`: the table holds one
//! strong reference and the connection's I/O task holds another until the
//! socket has closed. Cloning the `Arc` keeps a connection alive past a
//! callback; dropping the clone releases it.
//!
//! [`ConnectionTable`] iterates in order of last read. Every read moves the
//! entry to the tail, so the idle sweep can stop at the first entry that is
//! still within its timeout.

use crate::error::{Result, SessionError};
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;

/// Server-assigned connection identity
pub type ConnId = u64;

/// One accepted TCP connection
#[derive(Debug)]
pub struct Connection {
    id: ConnId,
    peer_addr: SocketAddr,
    last_activity: Mutex<Instant>,
    extra: Mutex<Vec<u8>>,
    outbound: mpsc::UnboundedSender<Bytes>,
    close_requests: mpsc::UnboundedSender<ConnId>,
    closing: AtomicBool,
    pub(crate) stop: Notify,
}

impl Connection {
    pub(crate) fn new(
        id: ConnId,
        peer_addr: SocketAddr,
        extra_size: usize,
        outbound: mpsc::UnboundedSender<Bytes>,
        close_requests: mpsc::UnboundedSender<ConnId>,
    ) -> Self {
        Self {
            id,
            peer_addr,
            last_activity: Mutex::new(Instant::now()),
            extra: Mutex::new(vec![0u8; extra_size]),
            outbound,
            close_requests,
            closing: AtomicBool::new(false),
            stop: Notify::new(),
        }
    }

    /// Identity, unique for the lifetime of the server
    pub fn id(&self) -> ConnId {
        self.id
    }

    /// Remote address
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Time of the last successful read (or of the accept)
    pub fn last_activity(&self) -> Instant {
        *lock(&self.last_activity)
    }

    /// Number of live references to this connection, the caller's included
    pub fn ref_count(self: &Arc<Self>) -> usize {
        Arc::strong_count(self)
    }

    /// Whether a close has started
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Queue a copy of `data` for writing
    pub fn send(&self, data: &[u8]) -> Result<()> {
        if self.is_closing() {
            return Err(SessionError::Closed("connection"));
        }
        self.outbound
            .send(Bytes::copy_from_slice(data))
            .map_err(|_| SessionError::Closed("connection"))
    }

    /// Ask the owning server to disconnect this connection.
    ///
    /// The server runs the closing callback, closes the socket and then
    /// runs the closed callback, exactly as for a read error.
    pub fn close(&self) -> Result<()> {
        self.close_requests
            .send(self.id)
            .map_err(|_| SessionError::Closed("server"))
    }

    /// Access the zero-initialised extension block.
    ///
    /// The block is sized by the server's `conn_extra_size`.
    pub fn with_extra<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut extra = lock(&self.extra);
        f(extra.as_mut_slice())
    }

    pub(crate) fn set_last_activity(&self, at: Instant) {
        *lock(&self.last_activity) = at;
    }

    /// Mark the connection as closing; returns `false` if it already was
    pub(crate) fn begin_close(&self) -> bool {
        !self.closing.swap(true, Ordering::AcqRel)
    }
}

// A poisoned lock only means a handler panicked mid-update; the data is plain bytes.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug)]
struct Entry {
    conn: Arc<Connection>,
    seq: u64,
}

/// Live connections in order of last read
#[derive(Debug, Default)]
pub struct ConnectionTable {
    entries: HashMap<ConnId, Entry>,
    order: BTreeMap<u64, ConnId>,
    next_seq: u64,
}

impl ConnectionTable {
    /// Create a table sized for `capacity` connections
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity),
            order: BTreeMap::new(),
            next_seq: 0,
        }
    }

    /// Add a connection at the tail, stamping its activity time
    pub fn insert(&mut self, conn: Arc<Connection>, now: Instant) {
        conn.set_last_activity(now);
        let id = conn.id();
        let seq = self.bump();
        if let Some(old) = self.entries.insert(id, Entry { conn, seq }) {
            self.order.remove(&old.seq);
        }
        self.order.insert(seq, id);
    }

    /// Remove a connection, returning the table's reference
    pub fn remove(&mut self, id: ConnId) -> Option<Arc<Connection>> {
        let entry = self.entries.remove(&id)?;
        self.order.remove(&entry.seq);
        Some(entry.conn)
    }

    /// Record activity and move the connection to the tail
    pub fn touch(&mut self, id: ConnId, now: Instant) -> Option<&Arc<Connection>> {
        let seq = self.bump();
        let entry = self.entries.get_mut(&id)?;
        self.order.remove(&entry.seq);
        entry.seq = seq;
        entry.conn.set_last_activity(now);
        self.order.insert(seq, id);
        Some(&entry.conn)
    }

    /// Look up a connection
    pub fn get(&self, id: ConnId) -> Option<&Arc<Connection>> {
        self.entries.get(&id).map(|entry| &entry.conn)
    }

    /// Number of connections
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Connections from least to most recently active
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Connection>> + '_ {
        self.order
            .values()
            .filter_map(move |id| self.entries.get(id).map(|entry| &entry.conn))
    }

    /// Connections idle for longer than `timeout`.
    ///
    /// Scans from the head and stops at the first connection still inside
    /// the window. Entries behind it were read more recently.
    pub fn expired(&self, now: Instant, timeout: Duration) -> Vec<Arc<Connection>> {
        self.iter()
            .take_while(|conn| now.saturating_duration_since(conn.last_activity()) > timeout)
            .cloned()
            .collect()
    }

    fn bump(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn conn(id: ConnId) -> Arc<Connection> {
        let (tx, _) = mpsc::unbounded_channel();
        let (close_tx, _) = mpsc::unbounded_channel();
        let peer = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 40000 + id as u16);
        Arc::new(Connection::new(id, peer, 4, tx, close_tx))
    }

    fn ids(table: &ConnectionTable) -> Vec<ConnId> {
        table.iter().map(|c| c.id()).collect()
    }

    #[test]
    fn test_read_moves_entry_to_tail() {
        let now = Instant::now();
        let mut table = ConnectionTable::with_capacity(8);
        for id in 1..=3 {
            table.insert(conn(id), now);
        }
        assert_eq!(ids(&table), vec![1, 2, 3]);

        table.touch(1, now + Duration::from_secs(1));
        assert_eq!(ids(&table), vec![2, 3, 1]);
        assert_eq!(
            table.get(1).unwrap().last_activity(),
            now + Duration::from_secs(1)
        );
    }

    #[test]
    fn test_sweep_stops_at_first_fresh_entry() {
        let start = Instant::now();
        let now = start + Duration::from_secs(9);
        let mut table = ConnectionTable::with_capacity(8);

        // idle 5s, 1s, 9s in table order
        table.insert(conn(1), start + Duration::from_secs(4));
        table.insert(conn(2), start + Duration::from_secs(8));
        table.insert(conn(3), start);

        let expired = table.expired(now, Duration::from_secs(4));
        assert_eq!(expired.iter().map(|c| c.id()).collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn test_sweep_evicts_only_the_stale_head() {
        let start = Instant::now();
        let now = start + Duration::from_secs(9);
        let mut table = ConnectionTable::with_capacity(8);

        // idle 5s, 3s, 1s in table order
        table.insert(conn(1), now - Duration::from_secs(5));
        table.insert(conn(2), now - Duration::from_secs(3));
        table.insert(conn(3), now - Duration::from_secs(1));

        let expired = table.expired(now, Duration::from_secs(4));
        assert_eq!(expired.iter().map(|c| c.id()).collect::<Vec<_>>(), vec![1]);
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn test_sweep_in_recency_order() {
        let start = Instant::now();
        let mut table = ConnectionTable::with_capacity(8);
        table.insert(conn(1), start);
        table.insert(conn(2), start + Duration::from_secs(2));
        table.insert(conn(3), start + Duration::from_secs(4));

        let expired = table.expired(start + Duration::from_secs(5), Duration::from_secs(2));
        assert_eq!(expired.iter().map(|c| c.id()).collect::<Vec<_>>(), vec![1, 2]);

        // exactly at the timeout is not expired
        let expired = table.expired(start + Duration::from_secs(2), Duration::from_secs(2));
        assert!(expired.is_empty());
    }

    #[test]
    fn test_remove_releases_table_reference() {
        let mut table = ConnectionTable::with_capacity(8);
        let c = conn(7);
        table.insert(c.clone(), Instant::now());
        assert_eq!(c.ref_count(), 2);

        let removed = table.remove(7).unwrap();
        drop(removed);
        assert_eq!(c.ref_count(), 1);
        assert!(table.is_empty());
        assert!(table.remove(7).is_none());
        assert!(table.touch(7, Instant::now()).is_none());
    }

    #[test]
    fn test_extra_block_zeroed() {
        let c = conn(1);
        c.with_extra(|extra| {
            assert_eq!(extra, &[0, 0, 0, 0]);
            extra[0] = 9;
        });
        assert_eq!(c.with_extra(|extra| extra[0]), 9);
    }

    #[test]
    fn test_close_marks_once() {
        let c = conn(1);
        assert!(c.begin_close());
        assert!(!c.begin_close());
        assert!(c.is_closing());
        assert!(c.send(b"x").is_err());
    }
}
