//! Process-wide registry of shared ("pooled") connections, one per vendor type.
//!
//! The first `get_or_create*` call for a vendor builds its connection under the write
//! lock; every later call returns the same `Arc`. The connection string in use at that
//! moment is fixed for the lifetime of the entry. `reset`/`clear` drop entries so tests
//! can start from scratch.
//!
//! Each entry also carries a [`PoolLease`]: how many pooled builders hold the connection,
//! and whether one of them left a transaction behind that must be rolled back.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::Mutex;
use tracing::debug;

use crate::config::connection_string_from_env;
use crate::driver::{FaultOf, Vendor};
use crate::error::SqlFluentError;

/// A connection that may be held by more than one `Builder`.
pub type SharedConnection<C> = Arc<Mutex<C>>;

struct Entry {
    connection: Arc<dyn Any + Send + Sync>,
    lease: Arc<PoolLease>,
    connection_string: String,
}

/// Bookkeeping shared by the pooled builders of one registry entry.
#[derive(Debug, Default)]
pub struct PoolLease {
    holders: AtomicUsize,
    rollback_pending: AtomicBool,
}

impl PoolLease {
    /// Pooled builders currently holding the connection.
    #[must_use]
    pub fn holders(&self) -> usize {
        self.holders.load(Ordering::Acquire)
    }

    pub(crate) fn join(&self) {
        self.holders.fetch_add(1, Ordering::AcqRel);
    }

    /// Give up one hold and return how many remain.
    pub(crate) fn release(&self) -> usize {
        let previous = self
            .holders
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        previous.saturating_sub(1)
    }

    pub(crate) fn request_rollback(&self) {
        self.rollback_pending.store(true, Ordering::Release);
    }

    pub(crate) fn take_rollback(&self) -> bool {
        self.rollback_pending.swap(false, Ordering::AcqRel)
    }
}

/// Why a registry lookup could not hand out a connection.
pub(crate) enum AcquireError<E> {
    /// No connection string could be resolved.
    Config(SqlFluentError),
    /// The driver refused to build the connection.
    Fault(E),
}

pub struct ConnectionRegistry {
    entries: RwLock<HashMap<TypeId, Entry>>,
}

static GLOBAL: LazyLock<ConnectionRegistry> = LazyLock::new(ConnectionRegistry::new);

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// The registry used by pooled builders.
    #[must_use]
    pub fn global() -> &'static ConnectionRegistry {
        &GLOBAL
    }

    /// Shared connection for `V`, if one has been created.
    #[must_use]
    pub fn get<V: Vendor>(&self) -> Option<SharedConnection<V::Connection>> {
        let entries = self.read();
        entries
            .get(&TypeId::of::<V>())
            .and_then(|entry| downcast::<V>(&entry.connection))
    }

    /// Connection string captured when the entry for `V` was created.
    #[must_use]
    pub fn connection_string<V: Vendor>(&self) -> Option<String> {
        self.read()
            .get(&TypeId::of::<V>())
            .map(|entry| entry.connection_string.clone())
    }

    /// Shared connection for `V`, created from the environment on first use.
    ///
    /// # Errors
    /// Returns `SqlFluentError::ConfigError` if no connection string is set, or
    /// `SqlFluentError::ConnectionError` if the driver rejects it.
    pub fn get_or_create<V: Vendor>(
        &self,
    ) -> Result<SharedConnection<V::Connection>, SqlFluentError> {
        self.acquire::<V, _>(connection_string_from_env::<V>)
            .map(|(shared, _)| shared)
            .map_err(into_public::<V>)
    }

    /// Shared connection for `V`; `connection_string` is only used if this call creates it.
    ///
    /// # Errors
    /// Returns `SqlFluentError::ConnectionError` if the driver rejects the string.
    pub fn get_or_create_with<V: Vendor>(
        &self,
        connection_string: &str,
    ) -> Result<SharedConnection<V::Connection>, SqlFluentError> {
        self.acquire::<V, _>(|| Ok(connection_string.to_string()))
            .map(|(shared, _)| shared)
            .map_err(into_public::<V>)
    }

    /// Drop the entry for `V`. Builders still holding it keep their `Arc`.
    pub fn reset<V: Vendor>(&self) -> bool {
        self.write().remove(&TypeId::of::<V>()).is_some()
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.write().clear();
    }

    /// Shared connection for `V` plus its lease, created on first use.
    pub(crate) fn acquire<V, F>(
        &self,
        resolve: F,
    ) -> Result<(SharedConnection<V::Connection>, Arc<PoolLease>), AcquireError<FaultOf<V>>>
    where
        V: Vendor,
        F: FnOnce() -> Result<String, SqlFluentError>,
    {
        if let Some(existing) = self.read().get(&TypeId::of::<V>()).and_then(leased::<V>) {
            return Ok(existing);
        }

        let mut entries = self.write();
        // Another thread may have won the race while we waited for the write lock
        if let Some(existing) = entries.get(&TypeId::of::<V>()).and_then(leased::<V>) {
            return Ok(existing);
        }

        let connection_string = resolve().map_err(AcquireError::Config)?;
        let connection = V::build_connection(&connection_string).map_err(AcquireError::Fault)?;
        let shared: SharedConnection<V::Connection> = Arc::new(Mutex::new(connection));
        debug!(vendor = %V::KIND, "created shared connection");

        let lease = Arc::new(PoolLease::default());
        entries.insert(
            TypeId::of::<V>(),
            Entry {
                connection: Arc::clone(&shared) as Arc<dyn Any + Send + Sync>,
                lease: Arc::clone(&lease),
                connection_string,
            },
        );
        Ok((shared, lease))
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<TypeId, Entry>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<TypeId, Entry>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn downcast<V: Vendor>(
    slot: &Arc<dyn Any + Send + Sync>,
) -> Option<SharedConnection<V::Connection>> {
    Arc::clone(slot).downcast::<Mutex<V::Connection>>().ok()
}

fn leased<V: Vendor>(entry: &Entry) -> Option<(SharedConnection<V::Connection>, Arc<PoolLease>)> {
    downcast::<V>(&entry.connection).map(|shared| (shared, Arc::clone(&entry.lease)))
}

fn into_public<V: Vendor>(err: AcquireError<FaultOf<V>>) -> SqlFluentError {
    match err {
        AcquireError::Config(err) => err,
        AcquireError::Fault(fault) => SqlFluentError::connection(
            format!("failed to create shared {} connection", V::KIND),
            fault,
        ),
    }
}
