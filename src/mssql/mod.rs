// SQL Server adapter
//
// - connection: the `Mssql` vendor, its connection, command and fault types
// - params: binding to `@P1..@Pn`, stored procedure `EXEC` syntax
// - query: row decoding into `ResultSet`

pub mod connection;
pub mod params;
pub mod query;

pub use connection::{
    MSSQL_CONNECTION_ENV, Mssql, MssqlClient, MssqlCommand, MssqlConnection, MssqlFault,
};

/// Builder over a SQL Server connection.
pub type MssqlBuilder = crate::Builder<Mssql>;

/// Execution over a SQL Server connection.
pub type MssqlExecution = crate::Execution<Mssql>;
