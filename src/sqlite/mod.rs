// SQLite adapter
//
// - connection: the `Sqlite` vendor, its connection, command and fault types
// - params: `RowValues` -> rusqlite values, named/positional binding
// - query: stepping statements into `ResultSet`

pub mod connection;
pub mod params;
pub mod query;

pub use connection::{
    SQLITE_CONNECTION_ENV, Sqlite, SqliteCommand, SqliteConnection, SqliteFault,
};

/// Builder over a `SQLite` connection.
pub type SqliteBuilder = crate::Builder<Sqlite>;

/// Execution over a `SQLite` connection.
pub type SqliteExecution = crate::Execution<Sqlite>;
