// Copyright 2026 Pricewatch Contributors
// SPDX-License-Identifier: Apache-2.0

//! Bounded pool of SQLite connections.
//!
//! Connections are opened lazily, leased to one blocking task at a time and
//! returned when the lease drops. The semaphore permit travels with the lease,
//! so an operation that outlives its timeout still counts against the bound
//! until it actually finishes.

use crate::error::{FailureKind, PipelineError};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

struct PoolInner {
    path: PathBuf,
    idle: Mutex<Vec<Connection>>,
    permits: Arc<Semaphore>,
}

/// Connection pool for one database file.
#[derive(Clone)]
pub struct SqlitePool {
    inner: Arc<PoolInner>,
    size: usize,
    op_timeout: Duration,
}

impl SqlitePool {
    pub fn new(path: impl AsRef<Path>, size: usize, op_timeout: Duration) -> Self {
        let size = size.max(1);
        Self {
            inner: Arc::new(PoolInner {
                path: path.as_ref().to_path_buf(),
                idle: Mutex::new(Vec::with_capacity(size)),
                permits: Arc::new(Semaphore::new(size)),
            }),
            size,
            op_timeout,
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Connections opened and currently not leased.
    pub fn idle_connections(&self) -> usize {
        self.inner.idle.lock().map(|idle| idle.len()).unwrap_or(0)
    }

    /// Run `f` on a pooled connection on the blocking thread pool.
    ///
    /// Waiting for a connection and running `f` are each bounded by the
    /// operation timeout; both failures are fatal store errors.
    pub async fn run<T, F>(&self, f: F) -> Result<T, PipelineError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, PipelineError> + Send + 'static,
    {
        let permit = tokio::time::timeout(
            self.op_timeout,
            Arc::clone(&self.inner.permits).acquire_owned(),
        )
        .await
        .map_err(|_| {
            PipelineError::fatal(
                FailureKind::StoreUnavailable,
                format!("no database connection free within {:?}", self.op_timeout),
            )
        })?
        .map_err(|_| PipelineError::fatal(FailureKind::StoreUnavailable, "connection pool closed"))?;

        let inner = Arc::clone(&self.inner);
        let task = tokio::task::spawn_blocking(move || {
            let mut lease = ConnectionLease::checkout(inner, permit)?;
            lease.with(f)
        });

        match tokio::time::timeout(self.op_timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(PipelineError::store(format!("database task failed: {e}"))),
            Err(_) => Err(PipelineError::store(format!(
                "database operation exceeded {:?}",
                self.op_timeout
            ))),
        }
    }
}

/// A connection checked out of the pool. Returned on drop.
struct ConnectionLease {
    conn: Option<Connection>,
    inner: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl ConnectionLease {
    fn checkout(inner: Arc<PoolInner>, permit: OwnedSemaphorePermit) -> Result<Self, PipelineError> {
        let pooled = inner.idle.lock().ok().and_then(|mut idle| idle.pop());
        let conn = match pooled {
            Some(conn) => conn,
            None => open_connection(&inner.path)?,
        };
        Ok(Self {
            conn: Some(conn),
            inner,
            _permit: permit,
        })
    }

    fn with<T>(
        &mut self,
        f: impl FnOnce(&mut Connection) -> Result<T, PipelineError>,
    ) -> Result<T, PipelineError> {
        match self.conn.as_mut() {
            Some(conn) => f(conn),
            None => Err(PipelineError::store("connection lease is empty")),
        }
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if let Ok(mut idle) = self.inner.idle.lock() {
                idle.push(conn);
            }
        }
    }
}

fn open_connection(path: &Path) -> Result<Connection, PipelineError> {
    let conn = Connection::open(path)
        .map_err(|e| PipelineError::store(format!("failed to open {}: {e}", path.display())))?;
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
        .map_err(PipelineError::store)?;
    conn.pragma_update(None, "synchronous", "NORMAL")
        .map_err(PipelineError::store)?;
    conn.busy_timeout(Duration::from_secs(5))
        .map_err(PipelineError::store)?;
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connections_open_lazily_and_return() {
        let dir = tempfile::tempdir().unwrap();
        let pool = SqlitePool::new(dir.path().join("p.db"), 2, Duration::from_secs(5));
        assert_eq!(pool.idle_connections(), 0);

        let n: i64 = pool
            .run(|conn| {
                conn.query_row("SELECT 41 + 1", [], |row| row.get(0))
                    .map_err(PipelineError::store)
            })
            .await
            .unwrap();
        assert_eq!(n, 42);
        assert_eq!(pool.idle_connections(), 1);
    }

    #[tokio::test]
    async fn test_pool_bound_serialises_work() {
        let dir = tempfile::tempdir().unwrap();
        let pool = SqlitePool::new(dir.path().join("p.db"), 1, Duration::from_secs(5));
        let a = pool.run(|_| {
            std::thread::sleep(Duration::from_millis(30));
            Ok(1)
        });
        let b = pool.run(|_| Ok(2));
        let (a, b) = tokio::join!(a, b);
        assert_eq!(a.unwrap() + b.unwrap(), 3);
        assert_eq!(pool.idle_connections(), 1);
    }

    #[tokio::test]
    async fn test_open_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let pool = SqlitePool::new(dir.path().join("missing/dir/p.db"), 1, Duration::from_secs(5));
        let err = pool.run(|_| Ok(())).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::StoreUnavailable);
    }
}
