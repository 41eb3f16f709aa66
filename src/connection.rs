use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::blocking;
use crate::driver::{DriverConnection, Vendor};
use crate::registry::{PoolLease, SharedConnection};
use crate::types::ConnectionState;

/// The one connection a `Builder` holds for its lifetime.
pub enum ConnectionHandle<C> {
    /// Created for this builder alone; dropped with it.
    Exclusive(SharedConnection<C>),
    /// Borrowed from the [`ConnectionRegistry`](crate::registry::ConnectionRegistry); never
    /// destroyed while another pooled builder holds the same lease.
    Pooled {
        shared: SharedConnection<C>,
        lease: Arc<PoolLease>,
    },
}

impl<C> ConnectionHandle<C> {
    pub(crate) fn exclusive(connection: C) -> Self {
        ConnectionHandle::Exclusive(Arc::new(Mutex::new(connection)))
    }

    /// Pooled handle; counts as one more holder of `lease`.
    pub(crate) fn pooled(shared: SharedConnection<C>, lease: Arc<PoolLease>) -> Self {
        lease.join();
        ConnectionHandle::Pooled { shared, lease }
    }

    #[must_use]
    pub fn shared(&self) -> &SharedConnection<C> {
        match self {
            ConnectionHandle::Exclusive(shared) | ConnectionHandle::Pooled { shared, .. } => shared,
        }
    }

    #[must_use]
    pub fn is_pooled(&self) -> bool {
        matches!(self, ConnectionHandle::Pooled { .. })
    }

    pub(crate) fn access(&self) -> ConnectionAccess<C> {
        match self {
            ConnectionHandle::Exclusive(shared) => ConnectionAccess {
                shared: Arc::clone(shared),
                lease: None,
            },
            ConnectionHandle::Pooled { shared, lease } => ConnectionAccess {
                shared: Arc::clone(shared),
                lease: Some(Arc::clone(lease)),
            },
        }
    }
}

impl<C> std::fmt::Debug for ConnectionHandle<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionHandle::Exclusive(_) => f.write_str("Exclusive"),
            ConnectionHandle::Pooled { lease, .. } => {
                f.debug_tuple("Pooled").field(&lease.holders()).finish()
            }
        }
    }
}

/// A builder's connection detached from the builder, so it can be locked while the
/// builder itself is borrowed mutably.
pub(crate) struct ConnectionAccess<C> {
    shared: SharedConnection<C>,
    lease: Option<Arc<PoolLease>>,
}

impl<C: DriverConnection> ConnectionAccess<C> {
    pub(crate) fn shared(&self) -> &SharedConnection<C> {
        &self.shared
    }

    /// Lock the connection. A transaction left open by a disposed pooled builder is rolled
    /// back before the guard is handed out.
    pub(crate) async fn lock<V: Vendor<Connection = C>>(&self) -> MutexGuard<'_, C> {
        let mut conn = self.shared.lock().await;
        if self.lease.as_ref().is_some_and(|lease| lease.take_rollback()) {
            discard_abandoned::<V>(&mut conn).await;
        }
        conn
    }
}

/// Roll back what a disposed builder left on a connection other builders still use.
/// Runs at once when the connection is idle and no runtime is driving the caller;
/// otherwise the next [`ConnectionAccess::lock`] does it before anything else runs.
pub(crate) fn discard_on_release<V: Vendor>(
    shared: &SharedConnection<V::Connection>,
    lease: &PoolLease,
) {
    lease.request_rollback();
    let Ok(mut conn) = shared.try_lock() else {
        debug!(vendor = %V::KIND, "connection busy; rollback deferred to its next use");
        return;
    };
    let attempt = blocking::run(async {
        if lease.take_rollback() {
            discard_abandoned::<V>(&mut conn).await;
        }
    });
    if attempt.is_err() {
        debug!(vendor = %V::KIND, "inside a runtime; rollback deferred to the next use");
    }
}

async fn discard_abandoned<V: Vendor>(conn: &mut V::Connection) {
    // a close since the request already discarded the transaction
    if conn.state() != ConnectionState::Open {
        return;
    }
    match conn.rollback().await {
        Ok(()) => debug!(vendor = %V::KIND, "rolled back transaction of a disposed builder"),
        Err(e) => {
            warn!(
                vendor = %V::KIND,
                error = %e,
                "rollback of abandoned transaction failed; closing connection"
            );
            close_after_fault::<V>(conn);
        }
    }
}

/// Close after a driver fault; the connection may be in any state by now.
pub(crate) fn close_after_fault<V: Vendor>(conn: &mut V::Connection) {
    if conn.state() == ConnectionState::Closed {
        return;
    }
    if let Err(e) = conn.close() {
        warn!(vendor = %V::KIND, error = %e, "closing connection after fault failed");
    }
}

/// Close during disposal: skipped for closed/broken connections and for connections busy
/// in another task. Never fails.
pub(crate) fn close_for_dispose<V: Vendor>(shared: &SharedConnection<V::Connection>) {
    let Ok(mut conn) = shared.try_lock() else {
        warn!(vendor = %V::KIND, "connection busy during dispose; leaving it open");
        return;
    };
    if matches!(conn.state(), ConnectionState::Closed | ConnectionState::Broken) {
        return;
    }
    if let Err(e) = conn.close() {
        warn!(vendor = %V::KIND, error = %e, "closing connection during dispose failed");
    }
}
