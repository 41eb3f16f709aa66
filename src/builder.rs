//! Fluent configuration of one unit of database work.
//!
//! A `Builder` owns exactly one connection handle from construction until disposal. The
//! `with_*` methods consume and return it so calls chain with `?`:
//!
//! ```no_run
//! # use sql_fluent::prelude::*;
//! # async fn demo() -> Result<(), SqlFluentError> {
//! let mut execution = SqliteBuilder::new(":memory:", false)?
//!     .with_timeout(5)?
//!     .with_prepared_statement()
//!     .with_transaction()?
//!     .build()
//!     .await?;
//! execution.execute("CREATE TABLE t (id INTEGER)").await?;
//! execution.commit().await?;
//! # Ok(())
//! # }
//! ```

use std::marker::PhantomData;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::blocking;
use crate::config::{DEFAULT_COMMAND_TIMEOUT_SECS, connection_string_from_env};
use crate::connection::{
    ConnectionAccess, ConnectionHandle, close_after_fault, close_for_dispose, discard_on_release,
};
use crate::driver::{DriverConnection, Vendor, VendorFault};
use crate::error::SqlFluentError;
use crate::execution::Execution;
use crate::registry::{AcquireError, ConnectionRegistry, SharedConnection};
use crate::transaction::{TransactionHandle, TransactionState};
use crate::types::{CommandKind, CommandSpec, IntoParameters, ParameterSet, PreparedStatementPolicy};

pub struct Builder<V: Vendor> {
    pub(crate) connection_string: String,
    pub(crate) command: Option<CommandSpec>,
    pub(crate) command_kind: CommandKind,
    pub(crate) parameters: Option<ParameterSet>,
    pub(crate) prepared_statement: PreparedStatementPolicy,
    pub(crate) timeout: u32,
    pub(crate) connection: Option<ConnectionHandle<V::Connection>>,
    pub(crate) transaction_requested: bool,
    pub(crate) transaction: Option<TransactionHandle>,
    disposed: bool,
    _vendor: PhantomData<fn() -> V>,
}

impl<V: Vendor> Builder<V> {
    /// Builder over a connection for `connection_string`.
    ///
    /// With `pooling` the connection comes from [`ConnectionRegistry::global`] and is shared
    /// with every other pooled builder of `V`; the registry keeps whichever string created
    /// it first. A transient fault while constructing is retried once with a fresh
    /// exclusive connection.
    ///
    /// # Errors
    /// `InvalidArgument` for an empty string, `ConnectionError` if the driver rejects it.
    pub fn new(connection_string: impl Into<String>, pooling: bool) -> Result<Self, SqlFluentError> {
        let connection_string = connection_string.into();
        if connection_string.trim().is_empty() {
            return Err(SqlFluentError::InvalidArgument(
                "connection string must not be empty".to_string(),
            ));
        }
        let connection = acquire::<V>(&connection_string, pooling)?;
        Ok(Self {
            connection_string,
            command: None,
            command_kind: CommandKind::Text,
            parameters: None,
            prepared_statement: PreparedStatementPolicy::default(),
            timeout: DEFAULT_COMMAND_TIMEOUT_SECS,
            connection: Some(connection),
            transaction_requested: false,
            transaction: None,
            disposed: false,
            _vendor: PhantomData,
        })
    }

    /// Builder whose connection string comes from the environment
    /// (`V::CONNECTION_STRING_ENV`, then `DB_CONNECTION`).
    ///
    /// # Errors
    /// `ConfigError` if neither key is set, otherwise as [`Builder::new`].
    pub fn from_env(pooling: bool) -> Result<Self, SqlFluentError> {
        Self::new(connection_string_from_env::<V>()?, pooling)
    }

    /// Set the command text and kind.
    ///
    /// # Errors
    /// `InvalidArgument` for empty text, `UnsupportedOperation` for `TableDirect`.
    pub fn with_command(
        mut self,
        text: impl Into<String>,
        kind: CommandKind,
    ) -> Result<Self, SqlFluentError> {
        let text = text.into();
        ensure_command_text(&text)?;
        let kind = kind.ensure_supported()?;
        self.command = Some(CommandSpec { text, kind });
        self.command_kind = kind;
        Ok(self)
    }

    /// Shorthand for `with_command(name, CommandKind::StoredProcedure)`.
    ///
    /// # Errors
    /// As [`Builder::with_command`].
    pub fn with_procedure(self, name: impl Into<String>) -> Result<Self, SqlFluentError> {
        self.with_command(name, CommandKind::StoredProcedure)
    }

    /// # Errors
    /// `UnsupportedOperation` for `TableDirect`.
    pub fn with_command_type(mut self, kind: CommandKind) -> Result<Self, SqlFluentError> {
        self.command_kind = kind.ensure_supported()?;
        Ok(self)
    }

    /// Parameters attached to every command the execution runs, in order.
    ///
    /// # Errors
    /// `InvalidArgument` when given `None`. An empty set is fine.
    pub fn with_parameters<P: IntoParameters>(mut self, parameters: P) -> Result<Self, SqlFluentError> {
        self.parameters = Some(required_parameters(parameters)?);
        Ok(self)
    }

    /// Prepare commands, but only those that carry parameters.
    #[must_use]
    pub fn with_prepared_statement(self) -> Self {
        self.with_prepared_statement_requiring(true)
    }

    /// Prepare commands; with `require_parameters` false even parameterless ones.
    #[must_use]
    pub fn with_prepared_statement_requiring(mut self, require_parameters: bool) -> Self {
        self.prepared_statement = PreparedStatementPolicy::new(true, require_parameters);
        self
    }

    /// Per-command timeout in seconds; 0 disables it.
    ///
    /// # Errors
    /// `OutOfRange` for negative values or values above `u32::MAX`.
    pub fn with_timeout(mut self, seconds: i64) -> Result<Self, SqlFluentError> {
        self.timeout = u32::try_from(seconds).map_err(|_| {
            SqlFluentError::OutOfRange(format!(
                "timeout must be between 0 and {} seconds, got {seconds}",
                u32::MAX
            ))
        })?;
        Ok(self)
    }

    /// Begin a transaction when the builder is built.
    ///
    /// # Errors
    /// `InvalidState` once the builder has been disposed.
    pub fn with_transaction(mut self) -> Result<Self, SqlFluentError> {
        if self.connection.is_none() {
            return Err(SqlFluentError::InvalidState(
                "cannot start a transaction without a connection".to_string(),
            ));
        }
        self.transaction_requested = true;
        Ok(self)
    }

    /// Open the connection if needed, begin the requested transaction, and hand over to
    /// an [`Execution`].
    ///
    /// # Errors
    /// `ConnectionError` if opening fails. `DatabaseError` if the transaction cannot
    /// begin; the connection is closed in that case. `InvalidState` after `dispose`.
    pub async fn build(mut self) -> Result<Execution<V>, SqlFluentError> {
        let access = self.shared_connection()?;
        {
            let mut conn = access.lock::<V>().await;
            if conn.state().needs_open() {
                conn.open().await.map_err(|e| {
                    SqlFluentError::connection(format!("failed to open {} connection", V::KIND), e)
                })?;
                debug!(vendor = %V::KIND, "opened connection");
            }
            if self.transaction_requested {
                if let Err(fault) = conn.begin_transaction().await {
                    close_after_fault::<V>(&mut conn);
                    warn!(vendor = %V::KIND, code = ?fault.code(), "begin transaction failed");
                    return Err(V::translate_error(fault));
                }
                self.transaction = Some(TransactionHandle::begin());
            }
        }
        debug!(
            vendor = %V::KIND,
            pooled = self.is_pooled(),
            transaction = self.transaction.is_some(),
            "built execution"
        );
        Ok(Execution::new(self))
    }

    /// Blocking twin of [`Builder::build`].
    ///
    /// # Errors
    /// As [`Builder::build`], plus `InvalidState` when called from inside a runtime.
    pub fn build_blocking(self) -> Result<Execution<V>, SqlFluentError> {
        blocking::run(self.build())?
    }

    /// Release parameters, the transaction and the connection. Safe to call repeatedly;
    /// failures are logged, never returned.
    ///
    /// A pooled connection that other builders still hold stays open; an uncommitted
    /// transaction on it is rolled back before any of them uses it again.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        self.parameters = None;

        let mut abandoned = false;
        if let Some(mut transaction) = self.transaction.take() {
            if transaction.is_active() {
                transaction.finish(TransactionState::Abandoned);
                abandoned = true;
                debug!(vendor = %V::KIND, "abandoning uncommitted transaction");
            }
        }

        match self.connection.take() {
            Some(ConnectionHandle::Exclusive(shared)) => close_for_dispose::<V>(&shared),
            Some(ConnectionHandle::Pooled { shared, lease }) => {
                let remaining = lease.release();
                if remaining == 0 {
                    close_for_dispose::<V>(&shared);
                    return;
                }
                if abandoned {
                    discard_on_release::<V>(&shared, &lease);
                }
                debug!(
                    vendor = %V::KIND,
                    holders = remaining,
                    "shared connection still in use; leaving it open"
                );
            }
            None => {}
        }
    }

    #[must_use]
    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }

    #[must_use]
    pub fn command(&self) -> Option<&CommandSpec> {
        self.command.as_ref()
    }

    #[must_use]
    pub fn command_kind(&self) -> CommandKind {
        self.command_kind
    }

    #[must_use]
    pub fn parameters(&self) -> Option<&ParameterSet> {
        self.parameters.as_ref()
    }

    #[must_use]
    pub fn prepared_statement(&self) -> PreparedStatementPolicy {
        self.prepared_statement
    }

    #[must_use]
    pub fn timeout(&self) -> u32 {
        self.timeout
    }

    #[must_use]
    pub fn is_pooled(&self) -> bool {
        self.connection.as_ref().is_some_and(ConnectionHandle::is_pooled)
    }

    #[must_use]
    pub fn transaction_requested(&self) -> bool {
        self.transaction_requested
    }

    #[must_use]
    pub fn transaction_state(&self) -> Option<TransactionState> {
        self.transaction.as_ref().map(TransactionHandle::state)
    }

    /// The connection this builder holds, until it is disposed.
    #[must_use]
    pub fn connection(&self) -> Option<SharedConnection<V::Connection>> {
        self.connection.as_ref().map(|handle| Arc::clone(handle.shared()))
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    pub(crate) fn shared_connection(&self) -> Result<ConnectionAccess<V::Connection>, SqlFluentError> {
        self.connection
            .as_ref()
            .map(ConnectionHandle::access)
            .ok_or_else(|| SqlFluentError::InvalidState("builder has been disposed".to_string()))
    }
}

impl<V: Vendor> Drop for Builder<V> {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl<V: Vendor> std::fmt::Debug for Builder<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Builder")
            .field("vendor", &V::KIND)
            .field("command", &self.command)
            .field("command_kind", &self.command_kind)
            .field("parameters", &self.parameters.as_ref().map(ParameterSet::len))
            .field("prepared_statement", &self.prepared_statement)
            .field("timeout", &self.timeout)
            .field("connection", &self.connection)
            .field("transaction", &self.transaction)
            .field("disposed", &self.disposed)
            .finish_non_exhaustive()
    }
}

fn acquire<V: Vendor>(
    connection_string: &str,
    pooling: bool,
) -> Result<ConnectionHandle<V::Connection>, SqlFluentError> {
    let attempt = if pooling {
        ConnectionRegistry::global()
            .acquire::<V, _>(|| Ok(connection_string.to_string()))
            .map(|(shared, lease)| ConnectionHandle::pooled(shared, lease))
    } else {
        V::build_connection(connection_string)
            .map(ConnectionHandle::exclusive)
            .map_err(AcquireError::Fault)
    };

    match attempt {
        Ok(handle) => Ok(handle),
        Err(AcquireError::Config(err)) => Err(err),
        Err(AcquireError::Fault(fault)) if fault.is_transient() => {
            warn!(
                vendor = %V::KIND,
                pooled = pooling,
                error = %fault,
                "transient fault while connecting; retrying with an exclusive connection"
            );
            V::build_connection(connection_string)
                .map(ConnectionHandle::exclusive)
                .map_err(|e| {
                    SqlFluentError::connection(
                        format!("failed to create {} connection after retry", V::KIND),
                        e,
                    )
                })
        }
        Err(AcquireError::Fault(fault)) => Err(SqlFluentError::connection(
            format!("failed to create {} connection", V::KIND),
            fault,
        )),
    }
}

pub(crate) fn ensure_command_text(text: &str) -> Result<(), SqlFluentError> {
    if text.trim().is_empty() {
        return Err(SqlFluentError::InvalidArgument(
            "command text must not be empty".to_string(),
        ));
    }
    Ok(())
}

pub(crate) fn required_parameters<P: IntoParameters>(
    parameters: P,
) -> Result<ParameterSet, SqlFluentError> {
    parameters.into_parameters().ok_or_else(|| {
        SqlFluentError::InvalidArgument("parameters must not be absent".to_string())
    })
}
