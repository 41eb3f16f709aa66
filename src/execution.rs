//! Running commands on a built connection.
//!
//! Every driver fault that escapes an `Execution` method has already closed the
//! connection and been translated by `V::translate_error`; call [`Execution::open`] to
//! reconnect. Mapper errors are the caller's own type and pass through untouched.

use std::future::Future;

use tracing::{debug, warn};

use crate::blocking;
use crate::builder::{Builder, ensure_command_text, required_parameters};
use crate::config::NON_QUERY_SUCCESS_THRESHOLD;
use crate::connection::{ConnectionAccess, close_after_fault};
use crate::driver::{CommandOf, DriverCommand, DriverConnection, FaultOf, Vendor, VendorFault};
use crate::error::SqlFluentError;
use crate::registry::SharedConnection;
use crate::results::{CustomDbRow, ResultSet};
use crate::transaction::TransactionState;
use crate::types::{CommandKind, ConnectionState, IntoParameters, ParameterSet};

pub struct Execution<V: Vendor> {
    builder: Builder<V>,
    disposed: bool,
}

impl<V: Vendor> Execution<V> {
    pub(crate) fn new(builder: Builder<V>) -> Self {
        Self {
            builder,
            disposed: false,
        }
    }

    /// The configuration this execution was built from.
    #[must_use]
    pub fn builder(&self) -> &Builder<V> {
        &self.builder
    }

    #[must_use]
    pub fn connection(&self) -> Option<SharedConnection<V::Connection>> {
        self.builder.connection()
    }

    #[must_use]
    pub fn transaction_state(&self) -> Option<TransactionState> {
        self.builder.transaction_state()
    }

    /// Whether the connection is open. A connection busy with another task's command
    /// counts as open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        let Some(access) = self.live().ok() else {
            return false;
        };
        access
            .shared()
            .try_lock()
            .map_or(true, |conn| conn.state() == ConnectionState::Open)
    }

    /// Reopen a closed or broken connection; no-op when already open.
    ///
    /// # Errors
    /// `ConnectionError` if the driver cannot open, `InvalidState` after `dispose`.
    pub async fn open(&mut self) -> Result<(), SqlFluentError> {
        let access = self.live()?;
        let mut conn = access.lock::<V>().await;
        if conn.state().needs_open() {
            conn.open().await.map_err(|e| {
                SqlFluentError::connection(format!("failed to open {} connection", V::KIND), e)
            })?;
            debug!(vendor = %V::KIND, "reopened connection");
        }
        Ok(())
    }

    /// # Errors
    /// As [`Execution::open`], plus `InvalidState` inside a runtime.
    pub fn open_blocking(&mut self) -> Result<(), SqlFluentError> {
        blocking::run(self.open())?
    }

    /// Close the connection. An active transaction is abandoned.
    ///
    /// # Errors
    /// `DatabaseError` if the driver fails to close, `InvalidState` after `dispose`.
    pub async fn close(&mut self) -> Result<(), SqlFluentError> {
        let access = self.live()?;
        let mut conn = access.lock::<V>().await;
        if conn.state() == ConnectionState::Closed {
            return Ok(());
        }
        self.abandon_transaction();
        conn.close().map_err(V::translate_error)
    }

    /// # Errors
    /// As [`Execution::close`], plus `InvalidState` inside a runtime.
    pub fn close_blocking(&mut self) -> Result<(), SqlFluentError> {
        blocking::run(self.close())?
    }

    /// Commit the builder's transaction. No-op without an active transaction or an open
    /// connection.
    ///
    /// # Errors
    /// `DatabaseError` if the driver refuses; the connection is closed.
    pub async fn commit(&mut self) -> Result<(), SqlFluentError> {
        self.finish_transaction(TransactionState::Committed).await
    }

    /// # Errors
    /// As [`Execution::commit`], plus `InvalidState` inside a runtime.
    pub fn commit_blocking(&mut self) -> Result<(), SqlFluentError> {
        blocking::run(self.commit())?
    }

    /// Roll back the builder's transaction. No-op without an active transaction or an
    /// open connection.
    ///
    /// # Errors
    /// `DatabaseError` if the driver refuses; the connection is closed.
    pub async fn rollback(&mut self) -> Result<(), SqlFluentError> {
        self.finish_transaction(TransactionState::RolledBack).await
    }

    /// # Errors
    /// As [`Execution::rollback`], plus `InvalidState` inside a runtime.
    pub fn rollback_blocking(&mut self) -> Result<(), SqlFluentError> {
        blocking::run(self.rollback())?
    }

    /// Replace the parameters attached to subsequent commands.
    ///
    /// # Errors
    /// `InvalidArgument` for `None`, `InvalidState` after `dispose`.
    pub fn with_parameters<P: IntoParameters>(&mut self, parameters: P) -> Result<&mut Self, SqlFluentError> {
        self.ensure_live()?;
        self.builder.parameters = Some(required_parameters(parameters)?);
        Ok(self)
    }

    pub fn clear_parameters(&mut self) -> &mut Self {
        self.builder.parameters = None;
        self
    }

    /// # Errors
    /// `UnsupportedOperation` for `TableDirect`, `InvalidState` after `dispose`.
    pub fn with_command_type(&mut self, kind: CommandKind) -> Result<&mut Self, SqlFluentError> {
        self.ensure_live()?;
        self.builder.command_kind = kind.ensure_supported()?;
        Ok(self)
    }

    /// Run a non-query with the current parameters. True iff at least one row was
    /// affected.
    ///
    /// # Errors
    /// `InvalidArgument` for empty text, `UnsupportedOperation` for stored procedures on
    /// vendors without them, `PreparationError`, or a translated `DatabaseError`.
    pub async fn execute(&mut self, text: &str) -> Result<bool, SqlFluentError> {
        let parameters = self.builder.parameters.clone();
        let affected = self.run_non_query(text, parameters).await?;
        Ok(affected >= NON_QUERY_SUCCESS_THRESHOLD)
    }

    /// # Errors
    /// As [`Execution::execute`], plus `InvalidState` inside a runtime.
    pub fn execute_blocking(&mut self, text: &str) -> Result<bool, SqlFluentError> {
        blocking::run(self.execute(text))?
    }

    /// Run the command configured with `with_command`.
    ///
    /// # Errors
    /// `InvalidState` if no command is configured, otherwise as [`Execution::execute`].
    pub async fn execute_command(&mut self) -> Result<bool, SqlFluentError> {
        let text = self.configured_text()?;
        self.execute(&text).await
    }

    /// Query with the current parameters and map each row. `None` when nothing matched.
    ///
    /// # Errors
    /// Any `SqlFluentError` converted into `E`, or the first error `mapper` returns.
    pub async fn read<T, E, F>(&mut self, text: &str, mapper: F) -> Result<Option<Vec<T>>, E>
    where
        F: FnMut(&CustomDbRow) -> Result<T, E>,
        E: From<SqlFluentError>,
    {
        let parameters = self.builder.parameters.clone();
        let rows = self.run_reader(text, parameters).await?;
        map_rows(rows, mapper)
    }

    /// Like [`Execution::read`] with `parameters` in place of the current ones; `None`
    /// runs the query without parameters.
    ///
    /// # Errors
    /// As [`Execution::read`].
    pub async fn read_with<T, E, F, P>(
        &mut self,
        text: &str,
        parameters: P,
        mapper: F,
    ) -> Result<Option<Vec<T>>, E>
    where
        F: FnMut(&CustomDbRow) -> Result<T, E>,
        E: From<SqlFluentError>,
        P: IntoParameters,
    {
        let rows = self.run_reader(text, parameters.into_parameters()).await?;
        map_rows(rows, mapper)
    }

    /// Like [`Execution::read`] with an async mapper, awaited row by row.
    ///
    /// # Errors
    /// As [`Execution::read`].
    pub async fn read_async_map<T, E, F, Fut>(
        &mut self,
        text: &str,
        mapper: F,
    ) -> Result<Option<Vec<T>>, E>
    where
        F: FnMut(CustomDbRow) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<SqlFluentError>,
    {
        let parameters = self.builder.parameters.clone();
        let rows = self.run_reader(text, parameters).await?;
        map_rows_async(rows, mapper).await
    }

    /// # Errors
    /// As [`Execution::read`], plus `InvalidState` inside a runtime.
    pub fn read_blocking<T, E, F>(&mut self, text: &str, mapper: F) -> Result<Option<Vec<T>>, E>
    where
        F: FnMut(&CustomDbRow) -> Result<T, E>,
        E: From<SqlFluentError>,
    {
        blocking::run(self.read(text, mapper))?
    }

    /// Run the configured command as a query.
    ///
    /// # Errors
    /// `InvalidState` if no command is configured, otherwise as [`Execution::read`].
    pub async fn read_command<T, E, F>(&mut self, mapper: F) -> Result<Option<Vec<T>>, E>
    where
        F: FnMut(&CustomDbRow) -> Result<T, E>,
        E: From<SqlFluentError>,
    {
        let text = self.configured_text()?;
        self.read(&text, mapper).await
    }

    /// First mapped row, or `T::default()` when nothing matched.
    ///
    /// # Errors
    /// As [`Execution::read`].
    pub async fn read_first<T, E, F>(&mut self, text: &str, mapper: F) -> Result<T, E>
    where
        T: Default,
        F: FnMut(&CustomDbRow) -> Result<T, E>,
        E: From<SqlFluentError>,
    {
        Ok(first_or_default(self.read(text, mapper).await?))
    }

    /// # Errors
    /// As [`Execution::read_with`].
    pub async fn read_first_with<T, E, F, P>(
        &mut self,
        text: &str,
        parameters: P,
        mapper: F,
    ) -> Result<T, E>
    where
        T: Default,
        F: FnMut(&CustomDbRow) -> Result<T, E>,
        E: From<SqlFluentError>,
        P: IntoParameters,
    {
        Ok(first_or_default(self.read_with(text, parameters, mapper).await?))
    }

    /// # Errors
    /// As [`Execution::read_async_map`].
    pub async fn read_first_async_map<T, E, F, Fut>(&mut self, text: &str, mapper: F) -> Result<T, E>
    where
        T: Default,
        F: FnMut(CustomDbRow) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<SqlFluentError>,
    {
        Ok(first_or_default(self.read_async_map(text, mapper).await?))
    }

    /// # Errors
    /// As [`Execution::read_first`], plus `InvalidState` inside a runtime.
    pub fn read_first_blocking<T, E, F>(&mut self, text: &str, mapper: F) -> Result<T, E>
    where
        T: Default,
        F: FnMut(&CustomDbRow) -> Result<T, E>,
        E: From<SqlFluentError>,
    {
        blocking::run(self.read_first(text, mapper))?
    }

    /// # Errors
    /// `InvalidState` if no command is configured, otherwise as [`Execution::read_first`].
    pub async fn read_first_command<T, E, F>(&mut self, mapper: F) -> Result<T, E>
    where
        T: Default,
        F: FnMut(&CustomDbRow) -> Result<T, E>,
        E: From<SqlFluentError>,
    {
        let text = self.configured_text()?;
        self.read_first(&text, mapper).await
    }

    /// Dispose the underlying builder. Every later operation fails with `InvalidState`.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        self.builder.dispose();
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    fn ensure_live(&self) -> Result<(), SqlFluentError> {
        if self.disposed {
            return Err(SqlFluentError::InvalidState(
                "execution has been disposed".to_string(),
            ));
        }
        Ok(())
    }

    fn live(&self) -> Result<ConnectionAccess<V::Connection>, SqlFluentError> {
        self.ensure_live()?;
        self.builder.shared_connection()
    }

    fn configured_text(&self) -> Result<String, SqlFluentError> {
        self.ensure_live()?;
        self.builder
            .command
            .as_ref()
            .map(|command| command.text.clone())
            .ok_or_else(|| SqlFluentError::InvalidState("no command configured".to_string()))
    }

    fn abandon_transaction(&mut self) {
        if let Some(transaction) = self.builder.transaction.as_mut() {
            transaction.finish(TransactionState::Abandoned);
        }
    }

    /// Close after a driver fault and translate it.
    fn fault(&mut self, conn: &mut V::Connection, fault: FaultOf<V>) -> SqlFluentError {
        warn!(
            vendor = %V::KIND,
            code = ?fault.code(),
            error = %fault,
            "driver fault; closing connection"
        );
        close_after_fault::<V>(conn);
        self.abandon_transaction();
        V::translate_error(fault)
    }

    async fn finish_transaction(&mut self, outcome: TransactionState) -> Result<(), SqlFluentError> {
        let access = self.live()?;
        let active = self
            .builder
            .transaction
            .as_ref()
            .is_some_and(|transaction| transaction.is_active());
        if !active {
            return Ok(());
        }
        let mut conn = access.lock::<V>().await;
        if conn.state() != ConnectionState::Open {
            return Ok(());
        }
        let result = match outcome {
            TransactionState::Committed => conn.commit().await,
            _ => conn.rollback().await,
        };
        match result {
            Ok(()) => {
                if let Some(transaction) = self.builder.transaction.as_mut() {
                    transaction.finish(outcome);
                }
                debug!(vendor = %V::KIND, outcome = ?outcome, "transaction finished");
                Ok(())
            }
            Err(fault) => Err(self.fault(&mut conn, fault)),
        }
    }

    /// Validate, create, parameterise and (maybe) prepare a command on `conn`.
    async fn command_for(
        &mut self,
        conn: &mut V::Connection,
        text: &str,
        parameters: Option<ParameterSet>,
    ) -> Result<CommandOf<V>, SqlFluentError> {
        let kind = self.builder.command_kind;
        let mut command = conn.create_command(text, kind);
        command.set_timeout(self.builder.timeout);
        for parameter in parameters.into_iter().flatten() {
            command.add_parameter(parameter);
        }

        if self
            .builder
            .prepared_statement
            .should_prepare(command.parameter_count(), kind)
        {
            if let Err(fault) = conn.prepare(&mut command).await {
                return Err(self.fault(conn, fault));
            }
            if !command.is_prepared() {
                return Err(SqlFluentError::PreparationError(format!(
                    "{} driver did not prepare `{text}`",
                    V::KIND
                )));
            }
        }
        Ok(command)
    }

    fn check_command(&self, text: &str) -> Result<(), SqlFluentError> {
        self.ensure_live()?;
        ensure_command_text(text)?;
        if self.builder.command_kind == CommandKind::StoredProcedure && !V::SUPPORTS_STORED_PROCEDURES {
            return Err(SqlFluentError::UnsupportedOperation(format!(
                "{} does not support stored procedures",
                V::KIND
            )));
        }
        Ok(())
    }

    async fn run_non_query(
        &mut self,
        text: &str,
        parameters: Option<ParameterSet>,
    ) -> Result<u64, SqlFluentError> {
        self.check_command(text)?;
        let access = self.live()?;
        let mut conn = access.lock::<V>().await;
        let command = self.command_for(&mut conn, text, parameters).await?;
        debug!(
            vendor = %V::KIND,
            command = text,
            parameters = command.parameter_count(),
            prepared = command.is_prepared(),
            "executing non-query"
        );
        match conn.execute_non_query(&command).await {
            Ok(affected) => Ok(affected),
            Err(fault) => Err(self.fault(&mut conn, fault)),
        }
    }

    async fn run_reader(
        &mut self,
        text: &str,
        parameters: Option<ParameterSet>,
    ) -> Result<ResultSet, SqlFluentError> {
        self.check_command(text)?;
        let access = self.live()?;
        let mut conn = access.lock::<V>().await;
        let command = self.command_for(&mut conn, text, parameters).await?;
        debug!(
            vendor = %V::KIND,
            command = text,
            parameters = command.parameter_count(),
            prepared = command.is_prepared(),
            "executing reader"
        );
        match conn.execute_reader(&command).await {
            Ok(rows) => Ok(rows),
            Err(fault) => Err(self.fault(&mut conn, fault)),
        }
    }
}

impl<V: Vendor> std::fmt::Debug for Execution<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Execution")
            .field("builder", &self.builder)
            .field("disposed", &self.disposed)
            .finish()
    }
}

fn map_rows<T, E, F>(rows: ResultSet, mut mapper: F) -> Result<Option<Vec<T>>, E>
where
    F: FnMut(&CustomDbRow) -> Result<T, E>,
{
    if rows.is_empty() {
        return Ok(None);
    }
    let mut mapped = Vec::with_capacity(rows.len());
    for row in &rows.results {
        mapped.push(mapper(row)?);
    }
    Ok(Some(mapped))
}

async fn map_rows_async<T, E, F, Fut>(rows: ResultSet, mut mapper: F) -> Result<Option<Vec<T>>, E>
where
    F: FnMut(CustomDbRow) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    if rows.is_empty() {
        return Ok(None);
    }
    let mut mapped = Vec::with_capacity(rows.len());
    for row in rows {
        mapped.push(mapper(row).await?);
    }
    Ok(Some(mapped))
}

fn first_or_default<T: Default>(rows: Option<Vec<T>>) -> T {
    rows.and_then(|rows| rows.into_iter().next()).unwrap_or_default()
}
