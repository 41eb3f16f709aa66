//! Fluent, vendor-agnostic database access.
//!
//! A [`Builder`] collects connection, command, parameter, timeout, prepared-statement and
//! transaction settings; [`Builder::build`] opens the connection and returns an
//! [`Execution`] that runs commands and maps rows. Each database is a [`Vendor`]:
//! `PostgreSQL` (`postgres` feature), `SQLite` (`sqlite`) and SQL Server (`mssql`).
//!
//! ```rust,no_run
//! use sql_fluent::prelude::*;
//!
//! # async fn demo() -> Result<(), SqlFluentError> {
//! let mut execution = PostgresBuilder::from_env(true)?
//!     .with_transaction()?
//!     .build()
//!     .await?;
//!
//! let names: Option<Vec<String>> = execution
//!     .read("SELECT db_name FROM users", |row| {
//!         Ok::<_, SqlFluentError>(row.get("db_name").and_then(RowValues::as_text).unwrap_or_default().to_string())
//!     })
//!     .await?;
//!
//! execution
//!     .with_parameters([DbParameter::input("keep", RowValues::Int(1))])?
//!     .execute("DELETE FROM users WHERE id <> $1")
//!     .await?;
//! execution.commit().await?;
//! # let _ = names;
//! # Ok(())
//! # }
//! ```
//!
//! Pooled builders share one connection per vendor through the
//! [`ConnectionRegistry`]. Every async operation has a `*_blocking` twin for callers
//! outside a runtime.

mod blocking;
pub mod builder;
pub mod config;
pub mod connection;
pub mod driver;
pub mod error;
pub mod execution;
pub mod prelude;
pub mod registry;
pub mod results;
pub mod transaction;
pub mod types;

#[cfg(feature = "mssql")]
pub mod mssql;
#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use builder::Builder;
pub use driver::{DriverCommand, DriverConnection, Vendor, VendorFault};
pub use error::{ErrorKind, SqlFluentError};
pub use execution::Execution;
pub use registry::{ConnectionRegistry, SharedConnection};
pub use results::{CustomDbRow, ResultSet};
pub use types::{
    CommandKind, ConnectionState, DbParameter, DbType, DriverKind, IntoParameters,
    ParameterDirection, ParameterSet, PreparedStatementPolicy, RowValues,
};
