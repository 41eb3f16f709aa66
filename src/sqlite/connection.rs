use std::time::Duration;

use async_trait::async_trait;
use rusqlite::ErrorCode;
use thiserror::Error;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::task::block_in_place;
use tracing::debug;

use super::params::bind_parameters;
use super::query::build_result_set;
use crate::driver::{DriverCommand, DriverConnection, Vendor, VendorFault};
use crate::results::ResultSet;
use crate::types::{CommandKind, ConnectionState, DbParameter, DriverKind};

/// Vendor-specific environment key for `SQLite`.
pub const SQLITE_CONNECTION_ENV: &str = "SQLITE_CONNECTION_STRING";

/// Longest busy wait `SQLite` accepts, used when the timeout is 0 (no limit).
const MAX_BUSY_TIMEOUT: Duration = Duration::from_millis(i32::MAX as u64);

/// Run a synchronous rusqlite call without stalling the async executor. On a multi-thread
/// runtime the worker hands its other tasks off first; a current-thread runtime (or no
/// runtime at all) has no one to hand them to, so the call runs inline.
fn run_blocking<R>(call: impl FnOnce() -> R) -> R {
    match Handle::try_current() {
        Ok(handle) if matches!(handle.runtime_flavor(), RuntimeFlavor::MultiThread) => {
            block_in_place(call)
        }
        _ => call(),
    }
}

#[derive(Debug, Error)]
pub enum SqliteFault {
    #[error(transparent)]
    Driver(#[from] rusqlite::Error),
    #[error("connection is not open")]
    NotOpen,
    #[error("sqlite connection string must name a file or :memory:")]
    EmptyPath,
}

impl VendorFault for SqliteFault {
    fn code(&self) -> Option<String> {
        match self {
            SqliteFault::Driver(rusqlite::Error::SqliteFailure(e, _)) => {
                Some(e.extended_code.to_string())
            }
            _ => None,
        }
    }

    fn is_transient(&self) -> bool {
        matches!(
            self,
            SqliteFault::Driver(rusqlite::Error::SqliteFailure(e, _))
                if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
        )
    }
}

/// A command bound to a [`SqliteConnection`].
#[derive(Debug, Clone)]
pub struct SqliteCommand {
    text: String,
    kind: CommandKind,
    timeout: u32,
    parameters: Vec<DbParameter>,
    prepared: bool,
}

impl DriverCommand for SqliteCommand {
    fn command_text(&self) -> &str {
        &self.text
    }

    fn kind(&self) -> CommandKind {
        self.kind
    }

    fn timeout(&self) -> u32 {
        self.timeout
    }

    fn set_timeout(&mut self, seconds: u32) {
        self.timeout = seconds;
    }

    fn add_parameter(&mut self, parameter: DbParameter) {
        self.parameters.push(parameter);
    }

    fn parameters(&self) -> &[DbParameter] {
        &self.parameters
    }

    fn is_prepared(&self) -> bool {
        self.prepared
    }
}

/// A `rusqlite` connection to one database file.
///
/// `:memory:` databases live exactly as long as one open connection: closing (including
/// the close after a fault) discards their contents.
#[derive(Debug)]
pub struct SqliteConnection {
    path: String,
    conn: Option<rusqlite::Connection>,
}

impl SqliteConnection {
    /// Accepts a plain path, `:memory:`, or either behind a `sqlite://` prefix. Nothing
    /// is opened yet.
    ///
    /// # Errors
    /// `SqliteFault::EmptyPath` when no path remains.
    pub fn new(connection_string: &str) -> Result<Self, SqliteFault> {
        let path = connection_string
            .trim()
            .trim_start_matches("sqlite://")
            .to_string();
        if path.is_empty() {
            return Err(SqliteFault::EmptyPath);
        }
        Ok(Self { path, conn: None })
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    fn connection(&self, timeout: u32) -> Result<&rusqlite::Connection, SqliteFault> {
        let conn = self.conn.as_ref().ok_or(SqliteFault::NotOpen)?;
        let busy = if timeout == 0 {
            MAX_BUSY_TIMEOUT
        } else {
            Duration::from_secs(u64::from(timeout)).min(MAX_BUSY_TIMEOUT)
        };
        conn.busy_timeout(busy)?;
        Ok(conn)
    }
}

#[async_trait]
impl DriverConnection for SqliteConnection {
    type Command = SqliteCommand;
    type Error = SqliteFault;

    fn state(&self) -> ConnectionState {
        if self.conn.is_some() {
            ConnectionState::Open
        } else {
            ConnectionState::Closed
        }
    }

    async fn open(&mut self) -> Result<(), SqliteFault> {
        if self.conn.is_none() {
            self.conn = Some(run_blocking(|| rusqlite::Connection::open(&self.path))?);
            debug!(path = %self.path, "sqlite connection opened");
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), SqliteFault> {
        if let Some(conn) = self.conn.take() {
            conn.close().map_err(|(_, e)| SqliteFault::Driver(e))?;
        }
        Ok(())
    }

    fn create_command(&self, text: &str, kind: CommandKind) -> SqliteCommand {
        SqliteCommand {
            text: text.to_string(),
            kind,
            timeout: 0,
            parameters: Vec::new(),
            prepared: false,
        }
    }

    async fn prepare(&mut self, command: &mut SqliteCommand) -> Result<(), SqliteFault> {
        // compiled once here, reused from the statement cache on execution
        let conn = self.connection(command.timeout)?;
        run_blocking(|| conn.prepare_cached(&command.text).map(drop))?;
        command.prepared = true;
        Ok(())
    }

    async fn execute_non_query(&mut self, command: &SqliteCommand) -> Result<u64, SqliteFault> {
        let conn = self.connection(command.timeout)?;
        let affected = run_blocking(|| -> Result<usize, SqliteFault> {
            if command.prepared {
                let mut stmt = conn.prepare_cached(&command.text)?;
                bind_parameters(&mut stmt, &command.parameters)?;
                Ok(stmt.raw_execute()?)
            } else {
                let mut stmt = conn.prepare(&command.text)?;
                bind_parameters(&mut stmt, &command.parameters)?;
                Ok(stmt.raw_execute()?)
            }
        })?;
        Ok(u64::try_from(affected).unwrap_or(u64::MAX))
    }

    async fn execute_reader(&mut self, command: &SqliteCommand) -> Result<ResultSet, SqliteFault> {
        let conn = self.connection(command.timeout)?;
        run_blocking(|| -> Result<ResultSet, SqliteFault> {
            if command.prepared {
                let mut stmt = conn.prepare_cached(&command.text)?;
                bind_parameters(&mut stmt, &command.parameters)?;
                Ok(build_result_set(&mut stmt)?)
            } else {
                let mut stmt = conn.prepare(&command.text)?;
                bind_parameters(&mut stmt, &command.parameters)?;
                Ok(build_result_set(&mut stmt)?)
            }
        })
    }

    async fn begin_transaction(&mut self) -> Result<(), SqliteFault> {
        let conn = self.connection(0)?;
        run_blocking(|| conn.execute_batch("BEGIN"))?;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), SqliteFault> {
        let conn = self.connection(0)?;
        run_blocking(|| conn.execute_batch("COMMIT"))?;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), SqliteFault> {
        let conn = self.connection(0)?;
        run_blocking(|| conn.execute_batch("ROLLBACK"))?;
        Ok(())
    }
}

/// `SQLite` through `rusqlite`. Stored procedures do not exist in `SQLite`.
#[derive(Debug, Clone, Copy)]
pub struct Sqlite;

impl Vendor for Sqlite {
    type Connection = SqliteConnection;

    const KIND: DriverKind = DriverKind::Sqlite;
    const CONNECTION_STRING_ENV: &'static str = SQLITE_CONNECTION_ENV;
    const SUPPORTS_STORED_PROCEDURES: bool = false;

    fn build_connection(connection_string: &str) -> Result<SqliteConnection, SqliteFault> {
        SqliteConnection::new(connection_string)
    }
}
