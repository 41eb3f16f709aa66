//! Contract every database adapter implements.
//!
//! `Builder` and `Execution` only ever talk to these traits. An adapter supplies a
//! connection type (open/close/state plus command execution), a command type (text,
//! kind, timeout, parameters, prepared flag) and a fault type that exposes a vendor
//! code and a transient flag.

use async_trait::async_trait;

use crate::error::SqlFluentError;
use crate::results::ResultSet;
use crate::types::{CommandKind, ConnectionState, DbParameter, DriverKind};

/// Error type raised by a driver.
pub trait VendorFault: std::error::Error + Send + Sync + 'static {
    /// Vendor error code or state, when the driver reports one.
    fn code(&self) -> Option<String>;

    /// Whether retrying with a fresh connection may succeed.
    fn is_transient(&self) -> bool;
}

/// A command bound to one connection.
pub trait DriverCommand: Send + Sync {
    fn command_text(&self) -> &str;

    fn kind(&self) -> CommandKind;

    /// Command timeout in seconds; 0 disables it.
    fn timeout(&self) -> u32;

    fn set_timeout(&mut self, seconds: u32);

    fn add_parameter(&mut self, parameter: DbParameter);

    fn parameters(&self) -> &[DbParameter];

    fn parameter_count(&self) -> usize {
        self.parameters().len()
    }

    fn is_prepared(&self) -> bool;
}

/// A live (or openable) connection to one database.
#[async_trait]
pub trait DriverConnection: Send + 'static {
    type Command: DriverCommand;
    type Error: VendorFault;

    fn state(&self) -> ConnectionState;

    async fn open(&mut self) -> Result<(), Self::Error>;

    /// Close the connection. Closing a closed connection is a no-op.
    fn close(&mut self) -> Result<(), Self::Error>;

    fn create_command(&self, text: &str, kind: CommandKind) -> Self::Command;

    /// Ask the driver to prepare the command. Drivers that cannot prepare leave
    /// `is_prepared` false rather than failing.
    async fn prepare(&mut self, command: &mut Self::Command) -> Result<(), Self::Error>;

    /// Run a non-query command and return the affected row count.
    async fn execute_non_query(&mut self, command: &Self::Command) -> Result<u64, Self::Error>;

    /// Run a query and drain every row. The cursor is released before returning.
    async fn execute_reader(&mut self, command: &Self::Command)
    -> Result<ResultSet, Self::Error>;

    async fn begin_transaction(&mut self) -> Result<(), Self::Error>;

    async fn commit(&mut self) -> Result<(), Self::Error>;

    async fn rollback(&mut self) -> Result<(), Self::Error>;
}

/// Fault type of a vendor's connection.
pub type FaultOf<V> = <<V as Vendor>::Connection as DriverConnection>::Error;

/// Command type of a vendor's connection.
pub type CommandOf<V> = <<V as Vendor>::Connection as DriverConnection>::Command;

/// Capability set of one database engine: build a connection and translate its faults.
pub trait Vendor: Send + Sync + 'static {
    type Connection: DriverConnection;

    const KIND: DriverKind;

    /// Vendor-specific environment key holding the connection string.
    const CONNECTION_STRING_ENV: &'static str;

    const SUPPORTS_STORED_PROCEDURES: bool = true;

    /// Construct an unopened connection for `connection_string`.
    ///
    /// # Errors
    /// Returns the driver fault if the connection string is rejected.
    fn build_connection(connection_string: &str) -> Result<Self::Connection, FaultOf<Self>>;

    /// Map a driver fault onto the unified taxonomy.
    fn translate_error(fault: FaultOf<Self>) -> SqlFluentError {
        SqlFluentError::database(Self::KIND, fault)
    }
}

/// Await `operation` for at most `seconds` (0 waits forever). `None` means the limit elapsed.
#[cfg(any(feature = "postgres", feature = "mssql"))]
pub(crate) async fn within_timeout<F: std::future::Future>(
    seconds: u32,
    operation: F,
) -> Option<F::Output> {
    if seconds == 0 {
        return Some(operation.await);
    }
    tokio::time::timeout(
        std::time::Duration::from_secs(u64::from(seconds)),
        operation,
    )
    .await
    .ok()
}
