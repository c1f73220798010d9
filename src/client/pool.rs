//! Bounded pool of operation connections for one endpoint

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use super::connection::Connection;
use crate::protocol::Handshake;
use crate::utils::{ClientError, ConnectionError};

/// Connection checked out of a pool
pub struct PooledConnection {
    conn: Box<dyn Connection>,
    generation: u64,
    /// Authentication epoch this connection logged in under
    pub(crate) auth_epoch: Option<u64>,
}

impl PooledConnection {
    fn new(conn: Box<dyn Connection>, generation: u64) -> Self {
        Self {
            conn,
            generation,
            auth_epoch: None,
        }
    }

    pub fn connection(&mut self) -> &mut dyn Connection {
        self.conn.as_mut()
    }

    pub fn handshake(&self) -> &Handshake {
        self.conn.handshake()
    }

    fn close(mut self) {
        self.conn.close();
    }
}

struct PoolState {
    idle: Vec<PooledConnection>,
    /// Connections handed out or idle, including ones being opened
    total: usize,
    /// Bumped by `clear`; older connections are closed on return
    generation: u64,
}

/// Pool growing on demand up to `max` connections. `max == 0` disables
/// pooling: every checkout opens a fresh connection that is closed on return.
pub struct ConnectionPool {
    name: String,
    max: usize,
    state: Mutex<PoolState>,
    available: Condvar,
}

impl ConnectionPool {
    pub fn new(name: &str, max: usize) -> Self {
        Self {
            name: name.to_string(),
            max,
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                total: 0,
                generation: 0,
            }),
            available: Condvar::new(),
        }
    }

    pub fn is_pooled(&self) -> bool {
        self.max > 0
    }

    /// Take an idle connection or open a new one with `open`. When the pool
    /// is exhausted wait up to `wait` for a connection to come back, then
    /// fail with `NoConnectionAvailable`.
    pub fn checkout<F>(&self, wait: Duration, open: F) -> Result<PooledConnection, ClientError>
    where
        F: FnOnce() -> Result<Box<dyn Connection>, ConnectionError>,
    {
        if !self.is_pooled() {
            let generation = self.state.lock().generation;
            return Ok(PooledConnection::new(open()?, generation));
        }

        let deadline = Instant::now() + wait;
        let mut state = self.state.lock();
        loop {
            if let Some(conn) = state.idle.pop() {
                return Ok(conn);
            }
            if state.total < self.max {
                state.total += 1;
                let generation = state.generation;
                drop(state);
                return match open() {
                    Ok(conn) => Ok(PooledConnection::new(conn, generation)),
                    Err(e) => {
                        self.release_slot();
                        Err(e.into())
                    }
                };
            }
            if self.available.wait_until(&mut state, deadline).timed_out() {
                trace!("Pool for {} exhausted ({} connections)", self.name, self.max);
                return Err(ClientError::NoConnectionAvailable(self.name.clone()));
            }
        }
    }

    /// Add a freshly opened connection directly to the idle set
    pub fn seed(&self, conn: Box<dyn Connection>) {
        let mut state = self.state.lock();
        if !self.is_pooled() || state.total >= self.max {
            drop(state);
            conn_close(conn);
            return;
        }
        state.total += 1;
        let pooled = PooledConnection::new(conn, state.generation);
        state.idle.push(pooled);
        drop(state);
        self.available.notify_one();
    }

    /// Return a healthy connection
    pub fn checkin(&self, conn: PooledConnection) {
        if !self.is_pooled() {
            conn.close();
            return;
        }
        let mut state = self.state.lock();
        if conn.generation != state.generation {
            state.total = state.total.saturating_sub(1);
            drop(state);
            conn.close();
        } else {
            state.idle.push(conn);
            drop(state);
        }
        self.available.notify_one();
    }

    /// Close a broken connection and free its slot
    pub fn discard(&self, conn: PooledConnection) {
        conn.close();
        if self.is_pooled() {
            self.release_slot();
        }
    }

    /// Close every idle connection; connections currently checked out are
    /// closed when they come back.
    pub fn clear(&self) {
        let drained: Vec<PooledConnection> = {
            let mut state = self.state.lock();
            state.generation += 1;
            let drained: Vec<PooledConnection> = state.idle.drain(..).collect();
            state.total = state.total.saturating_sub(drained.len());
            drained
        };
        for conn in drained {
            conn.close();
        }
        self.available.notify_all();
    }

    pub fn idle_count(&self) -> usize {
        self.state.lock().idle.len()
    }

    pub fn total(&self) -> usize {
        self.state.lock().total
    }

    fn release_slot(&self) {
        let mut state = self.state.lock();
        state.total = state.total.saturating_sub(1);
        drop(state);
        self.available.notify_one();
    }
}

fn conn_close(mut conn: Box<dyn Connection>) {
    conn.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct NullConnection {
        handshake: Handshake,
        closed: Arc<AtomicUsize>,
    }

    impl Connection for NullConnection {
        fn send(&mut self, frame: &[u8], _timeout: Duration) -> Result<Vec<u8>, ConnectionError> {
            Ok(frame.to_vec())
        }

        fn receive(&mut self, _timeout: Duration) -> Result<Option<Vec<u8>>, ConnectionError> {
            Ok(None)
        }

        fn handshake(&self) -> &Handshake {
            &self.handshake
        }

        fn close(&mut self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn opener(closed: &Arc<AtomicUsize>) -> impl FnOnce() -> Result<Box<dyn Connection>, ConnectionError> {
        let closed = Arc::clone(closed);
        move || {
            Ok(Box::new(NullConnection {
                handshake: Handshake::default(),
                closed,
            }) as Box<dyn Connection>)
        }
    }

    #[test]
    fn test_reuses_returned_connection() {
        let closed = Arc::new(AtomicUsize::new(0));
        let pool = ConnectionPool::new("a:1", 2);
        let conn = pool.checkout(Duration::from_millis(10), opener(&closed)).unwrap();
        pool.checkin(conn);
        assert_eq!(pool.idle_count(), 1);
        let _again = pool
            .checkout(Duration::from_millis(10), || -> Result<Box<dyn Connection>, ConnectionError> {
                panic!("should reuse the idle connection")
            })
            .unwrap();
        assert_eq!(pool.total(), 1);
    }

    #[test]
    fn test_exhausted_pool_times_out() {
        let closed = Arc::new(AtomicUsize::new(0));
        let pool = ConnectionPool::new("a:1", 1);
        let _held = pool.checkout(Duration::from_millis(10), opener(&closed)).unwrap();
        let err = pool
            .checkout(Duration::from_millis(20), opener(&closed))
            .err()
            .unwrap();
        assert!(matches!(err, ClientError::NoConnectionAvailable(_)));
    }

    #[test]
    fn test_failed_open_releases_slot() {
        let closed = Arc::new(AtomicUsize::new(0));
        let pool = ConnectionPool::new("a:1", 1);
        let err = pool
            .checkout(Duration::from_millis(10), || Err(ConnectionError::Closed))
            .err()
            .unwrap();
        assert!(matches!(err, ClientError::Io(_)));
        assert_eq!(pool.total(), 0);
        assert!(pool.checkout(Duration::from_millis(10), opener(&closed)).is_ok());
    }

    #[test]
    fn test_clear_closes_stale_connections_on_return() {
        let closed = Arc::new(AtomicUsize::new(0));
        let pool = ConnectionPool::new("a:1", 2);
        let idle = pool.checkout(Duration::from_millis(10), opener(&closed)).unwrap();
        let busy = pool.checkout(Duration::from_millis(10), opener(&closed)).unwrap();
        pool.checkin(idle);

        pool.clear();
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.total(), 1);

        pool.checkin(busy);
        assert_eq!(closed.load(Ordering::SeqCst), 2);
        assert_eq!(pool.total(), 0);
        assert_eq!(pool.idle_count(), 0);
    }

    #[test]
    fn test_unpooled_closes_on_checkin() {
        let closed = Arc::new(AtomicUsize::new(0));
        let pool = ConnectionPool::new("a:1", 0);
        let conn = pool.checkout(Duration::from_millis(10), opener(&closed)).unwrap();
        pool.checkin(conn);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.idle_count(), 0);
    }
}
