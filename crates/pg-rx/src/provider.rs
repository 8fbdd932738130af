use crate::{Error, Query, QueryResult, Row};
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use std::sync::atomic::{AtomicU64, Ordering};

/// Connection is the boundary to a database driver.
/// It's implemented for live sqlx connections, and may be implemented
/// for any other driver which can submit statements and open cursors.
pub trait Connection: Send {
    /// Submit a query, resolving with its single complete result.
    /// Dropping the returned future cancels the submission.
    fn submit<'c>(&'c mut self, query: &'c Query) -> BoxFuture<'c, Result<QueryResult, Error>>;

    /// Open a streaming cursor over the rows of a query.
    /// Rows are yielded in server order. The cursor ends after its last row,
    /// or after yielding its first error. Dropping it closes the cursor.
    fn open_cursor<'c>(&'c mut self, query: &'c Query) -> BoxStream<'c, Result<Row, Error>>;

    /// Discard a connection whose session state is unknown, so that it's
    /// never handed out again. By default it's simply dropped.
    fn discard(self: Box<Self>) {}
}

/// ConnectionProvider acquires exclusive-use ConnectionHandles,
/// from a pool or from a single dedicated connection.
pub trait ConnectionProvider: Send + Sync + 'static {
    /// Acquire a connection. The returned future resolves with at most one
    /// handle, or with an Error::Connection.
    fn acquire(&self) -> BoxFuture<'static, Result<ConnectionHandle, Error>>;

    /// Permanently close connections of this provider.
    fn close(&self) -> BoxFuture<'static, ()>;
}

/// ConnectionHandle owns a live connection until it's released.
///
/// Release gives the connection back to its provider and fires the
/// handle's release hook. It happens exactly once: the first call to
/// release() performs it and later calls are no-ops. A handle which is
/// dropped without being released is released by Drop, so every exit
/// path of its owner (completion, error or cancellation) releases it.
///
/// A handle which is released while a transaction is open on its connection
/// (for example, because a transaction's sequence was cancelled mid-step)
/// rolls that transaction back before the connection is returned to its
/// provider, and only then fires its release hook. If there's no tokio
/// runtime to run the ROLLBACK on, or it fails, the connection is discarded.
pub struct ConnectionHandle {
    id: u64,
    conn: Option<Box<dyn Connection>>,
    on_release: Option<Box<dyn FnOnce() + Send>>,
    in_transaction: bool,
}

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

impl ConnectionHandle {
    pub fn new(conn: impl Connection + 'static) -> Self {
        let id = NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(handle = id, "acquired connection");

        Self {
            id,
            conn: Some(Box::new(conn)),
            on_release: None,
            in_transaction: false,
        }
    }

    /// Attach a hook which is invoked once, when the handle is released.
    pub fn with_release_hook(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_release = Some(Box::new(hook));
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_released(&self) -> bool {
        self.conn.is_none()
    }

    /// Is a transaction open on this handle's connection?
    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    pub(crate) fn set_in_transaction(&mut self, open: bool) {
        self.in_transaction = open;
    }

    pub fn connection(&mut self) -> Result<&mut (dyn Connection + 'static), Error> {
        self.conn.as_deref_mut().ok_or(Error::Released)
    }

    /// Release the connection, returning true if this call released it
    /// and false if it was already released.
    pub fn release(&mut self) -> bool {
        let Some(conn) = self.conn.take() else {
            return false;
        };
        let releasing = Releasing {
            id: self.id,
            conn: Some(conn),
            on_release: self.on_release.take(),
        };

        if !std::mem::take(&mut self.in_transaction) {
            releasing.finish();
            return true;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(releasing.roll_back());
            }
            Err(_) => {
                tracing::warn!(handle = self.id, "no runtime to roll back an open transaction");
                // Dropped while still holding its connection, which discards it.
                std::mem::drop(releasing);
            }
        }
        true
    }
}

// Releasing is a connection on its way back to its provider.
// If it's dropped while still holding its connection, the connection
// is discarded rather than returned.
struct Releasing {
    id: u64,
    conn: Option<Box<dyn Connection>>,
    on_release: Option<Box<dyn FnOnce() + Send>>,
}

impl Releasing {
    async fn roll_back(mut self) {
        let rollback = Query::fixed("ROLLBACK");
        let Some(conn) = self.conn.as_mut() else {
            return;
        };
        match conn.submit(&rollback).await {
            Ok(_) => {
                tracing::debug!(handle = self.id, "rolled back abandoned transaction");
                self.finish();
            }
            Err(err) => {
                tracing::warn!(handle = self.id, %err, "failed to roll back abandoned transaction");
            }
        }
    }

    // Return the connection to its provider.
    fn finish(mut self) {
        std::mem::drop(self.conn.take());
    }
}

impl Drop for Releasing {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            tracing::warn!(handle = self.id, "discarding connection");
            conn.discard();
        }
        if let Some(hook) = self.on_release.take() {
            hook();
        }
        tracing::debug!(handle = self.id, "released connection");
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("released", &self.is_released())
            .field("in_transaction", &self.in_transaction)
            .finish()
    }
}
