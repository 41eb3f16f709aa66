//! Convenient imports for common functionality.
//!
//! This module re-exports the builder, the execution, the value types and each enabled
//! vendor with its builder alias.

pub use crate::builder::Builder;
pub use crate::config::{CONNECTION_STRING_ENV, DEFAULT_COMMAND_TIMEOUT_SECS};
pub use crate::error::{ErrorKind, SqlFluentError};
pub use crate::execution::Execution;
pub use crate::registry::ConnectionRegistry;
pub use crate::results::{CustomDbRow, ResultSet};
pub use crate::transaction::TransactionState;
pub use crate::types::{
    CommandKind, DbParameter, DbType, DriverKind, ParameterDirection, ParameterSet, RowValues,
};

#[cfg(feature = "postgres")]
pub use crate::postgres::{Postgres, PostgresBuilder, PostgresExecution};

#[cfg(feature = "sqlite")]
pub use crate::sqlite::{Sqlite, SqliteBuilder, SqliteExecution};

#[cfg(feature = "mssql")]
pub use crate::mssql::{Mssql, MssqlBuilder, MssqlExecution};
