//! SQLite connection pooling
//!
//! One pool instance per consumer (the writer and the loader each own one).
//! Connections are keyed by file path, reference-counted to current
//! borrowers, and closed after sitting idle. On shutdown every connection
//! gets a truncating WAL checkpoint so no `-wal`/`-shm` sidecars remain.

use crate::error::Result;
use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

struct PooledConnection {
    conn: Arc<Mutex<Connection>>,
    last_used: Instant,
}

/// Pool of SQLite connections with idle timeout
pub struct ConnectionPool {
    connections: Mutex<HashMap<PathBuf, PooledConnection>>,
    max_size: usize,
    idle_timeout: Duration,
}

impl ConnectionPool {
    pub fn new(max_size: usize, idle_timeout: Duration) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            max_size,
            idle_timeout,
        }
    }

    /// Get or open a connection for `path`. Borrowers share the handle; the
    /// pool refreshes last-used on each borrow.
    pub fn get(&self, path: &Path, read_only: bool) -> Result<Arc<Mutex<Connection>>> {
        let mut connections = self.connections.lock();

        if let Some(pooled) = connections.get_mut(path) {
            pooled.last_used = Instant::now();
            return Ok(Arc::clone(&pooled.conn));
        }

        // Evict idle entries eagerly when the pool is full. Borrowed
        // connections stay alive through their Arc until released.
        if connections.len() >= self.max_size {
            let mut entries: Vec<(PathBuf, Instant)> = connections
                .iter()
                .map(|(p, c)| (p.clone(), c.last_used))
                .collect();
            entries.sort_by_key(|(_, last_used)| *last_used);
            for (evict_path, _) in entries {
                if connections.len() < self.max_size {
                    break;
                }
                if let Some(pooled) = connections.remove(&evict_path) {
                    debug!(path = %evict_path.display(), "Evicting pooled connection");
                    checkpoint_and_drop(pooled.conn);
                }
            }
        }

        let conn = if read_only {
            Connection::open_with_flags(
                path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_URI,
            )?
        } else {
            Connection::open(path)?
        };
        configure_connection(&conn, read_only)?;

        let conn = Arc::new(Mutex::new(conn));
        connections.insert(
            path.to_path_buf(),
            PooledConnection {
                conn: Arc::clone(&conn),
                last_used: Instant::now(),
            },
        );
        Ok(conn)
    }

    /// Close connections idle longer than the timeout.
    pub fn cleanup_idle(&self) {
        let mut connections = self.connections.lock();
        let idle_timeout = self.idle_timeout;
        let stale: Vec<PathBuf> = connections
            .iter()
            .filter(|(_, c)| c.last_used.elapsed() > idle_timeout)
            .map(|(p, _)| p.clone())
            .collect();
        for path in stale {
            if let Some(pooled) = connections.remove(&path) {
                debug!(path = %path.display(), "Closing idle connection");
                checkpoint_and_drop(pooled.conn);
            }
        }
    }

    /// Run the idle sweep on a cadence until the handle is aborted.
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let pool = self;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            loop {
                tick.tick().await;
                pool.cleanup_idle();
            }
        })
    }

    /// Checkpoint and close every connection.
    pub fn close_all(&self) {
        let mut connections = self.connections.lock();
        for (path, pooled) in connections.drain() {
            debug!(path = %path.display(), "Closing pooled connection");
            checkpoint_and_drop(pooled.conn);
        }
    }

    pub fn size(&self) -> usize {
        self.connections.lock().len()
    }
}

/// Truncating WAL checkpoint, then release our reference. The connection
/// actually closes when the last borrower drops it.
fn checkpoint_and_drop(conn: Arc<Mutex<Connection>>) {
    {
        let guard = conn.lock();
        if let Err(e) = guard.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(())) {
            warn!("WAL checkpoint failed on close: {e}");
        }
    }
    drop(conn);
}

fn configure_connection(conn: &Connection, read_only: bool) -> rusqlite::Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous=NORMAL;
         PRAGMA cache_size=-20000;
         PRAGMA temp_store=MEMORY;",
    )?;
    // Memory-mapped I/O helps large files; not supported everywhere.
    let _ = conn.execute_batch("PRAGMA mmap_size=268435456;");

    if read_only {
        conn.execute_batch(
            "PRAGMA query_only=1;
             PRAGMA read_uncommitted=1;
             PRAGMA busy_timeout=10000;",
        )?;
    } else {
        // Only affects databases created by this connection.
        let _ = conn.execute_batch("PRAGMA page_size=8192;");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_get_reuses_connection() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.db");
        let pool = ConnectionPool::new(5, Duration::from_secs(10));

        let first = pool.get(&path, false).unwrap();
        let second = pool.get(&path, false).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(pool.size(), 1);
    }

    #[test]
    fn test_overflow_evicts_idle() {
        let dir = tempdir().unwrap();
        let pool = ConnectionPool::new(2, Duration::from_secs(10));

        for name in ["a.db", "b.db", "c.db"] {
            pool.get(&dir.path().join(name), false).unwrap();
        }
        assert_eq!(pool.size(), 2);
    }

    #[test]
    fn test_cleanup_idle_closes_stale() {
        let dir = tempdir().unwrap();
        let pool = ConnectionPool::new(5, Duration::from_millis(10));

        pool.get(&dir.path().join("a.db"), false).unwrap();
        std::thread::sleep(Duration::from_millis(30));
        pool.cleanup_idle();
        assert_eq!(pool.size(), 0);
    }

    #[test]
    fn test_close_all_removes_wal_sidecar() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.db");
        let pool = ConnectionPool::new(5, Duration::from_secs(10));

        {
            let conn = pool.get(&path, false).unwrap();
            let guard = conn.lock();
            guard
                .execute_batch("CREATE TABLE t(x); INSERT INTO t VALUES (1);")
                .unwrap();
        }
        pool.close_all();
        assert_eq!(pool.size(), 0);

        let wal = path.with_extension("db-wal");
        let wal_len = std::fs::metadata(&wal).map(|m| m.len()).unwrap_or(0);
        assert_eq!(wal_len, 0, "WAL should be truncated after close");
    }
}
