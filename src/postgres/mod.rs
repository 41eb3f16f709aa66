// PostgreSQL adapter
//
// - connection: the `Postgres` vendor, its connection, command and fault types
// - params: `RowValues` -> `ToSql`, declared types, stored procedure call syntax
// - query: row decoding into `ResultSet`

pub mod connection;
pub mod params;
pub mod query;

pub use connection::{
    POSTGRES_CONNECTION_ENV, Postgres, PostgresCommand, PostgresConnection, PostgresFault,
};

/// Builder over a `PostgreSQL` connection.
pub type PostgresBuilder = crate::Builder<Postgres>;

/// Execution over a `PostgreSQL` connection.
pub type PostgresExecution = crate::Execution<Postgres>;
