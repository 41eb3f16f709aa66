use std::collections::HashMap;
use std::str::FromStr;

use async_trait::async_trait;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, Config, NoTls, Statement};
use tracing::{debug, warn};

use super::params::{as_refs, declared_types, procedure_call};
use super::query::{build_result_set, build_result_set_from_rows};
use crate::driver::{DriverCommand, DriverConnection, Vendor, VendorFault, within_timeout};
use crate::results::ResultSet;
use crate::types::{CommandKind, ConnectionState, DbParameter, DriverKind};

/// Vendor-specific environment key for Postgres.
pub const POSTGRES_CONNECTION_ENV: &str = "POSTGRES_CONNECTION_STRING";

/// SQLSTATEs worth retrying on a fresh connection, beyond class 08.
const TRANSIENT_STATES: [&str; 5] = ["40001", "40P01", "53300", "57P01", "57P03"];

#[derive(Debug, Error)]
pub enum PostgresFault {
    #[error(transparent)]
    Driver(#[from] tokio_postgres::Error),
    #[error("command timed out after {0} seconds")]
    Timeout(u32),
    #[error("connection is not open")]
    NotOpen,
}

impl VendorFault for PostgresFault {
    fn code(&self) -> Option<String> {
        match self {
            PostgresFault::Driver(e) => e.code().map(|state| state.code().to_string()),
            PostgresFault::Timeout(_) => Some("timeout".to_string()),
            PostgresFault::NotOpen => Some(SqlState::CONNECTION_DOES_NOT_EXIST.code().to_string()),
        }
    }

    fn is_transient(&self) -> bool {
        match self {
            PostgresFault::Driver(e) => {
                if e.is_closed() {
                    return true;
                }
                if std::error::Error::source(e).is_some_and(|s| s.is::<std::io::Error>()) {
                    return true;
                }
                e.code().is_some_and(|state| {
                    let code = state.code();
                    code.starts_with("08") || TRANSIENT_STATES.contains(&code)
                })
            }
            PostgresFault::Timeout(_) => false,
            PostgresFault::NotOpen => true,
        }
    }
}

/// A command bound to a [`PostgresConnection`].
#[derive(Debug, Clone)]
pub struct PostgresCommand {
    text: String,
    kind: CommandKind,
    timeout: u32,
    parameters: Vec<DbParameter>,
    statement: Option<Statement>,
}

impl PostgresCommand {
    /// The SQL actually sent: the text itself, or the function call for a procedure.
    #[must_use]
    pub fn sql(&self) -> String {
        match self.kind {
            CommandKind::StoredProcedure => procedure_call(&self.text, &self.parameters),
            _ => self.text.clone(),
        }
    }
}

impl DriverCommand for PostgresCommand {
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
        // new parameters may change the declared types
        self.statement = None;
    }

    fn parameters(&self) -> &[DbParameter] {
        &self.parameters
    }

    fn is_prepared(&self) -> bool {
        self.statement.is_some()
    }
}

/// One `tokio-postgres` client plus the task driving its socket.
pub struct PostgresConnection {
    config: Config,
    client: Option<Client>,
    driver: Option<JoinHandle<()>>,
    statements: HashMap<String, Statement>,
}

impl std::fmt::Debug for PostgresConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresConnection")
            .field("dbname", &self.config.get_dbname())
            .field("state", &self.state())
            .field("statements", &self.statements.len())
            .finish_non_exhaustive()
    }
}

impl PostgresConnection {
    /// Parse `connection_string` (key/value or URL form) without connecting.
    ///
    /// # Errors
    /// Returns the driver error for a malformed string.
    pub fn new(connection_string: &str) -> Result<Self, PostgresFault> {
        Ok(Self {
            config: Config::from_str(connection_string)?,
            client: None,
            driver: None,
            statements: HashMap::new(),
        })
    }

    fn client(&self) -> Result<&Client, PostgresFault> {
        match &self.client {
            Some(client) if !client.is_closed() => Ok(client),
            _ => Err(PostgresFault::NotOpen),
        }
    }
}

#[async_trait]
impl DriverConnection for PostgresConnection {
    type Command = PostgresCommand;
    type Error = PostgresFault;

    fn state(&self) -> ConnectionState {
        match &self.client {
            None => ConnectionState::Closed,
            Some(client) if client.is_closed() => ConnectionState::Broken,
            Some(_) => ConnectionState::Open,
        }
    }

    async fn open(&mut self) -> Result<(), PostgresFault> {
        if self.state() == ConnectionState::Open {
            return Ok(());
        }
        self.close()?;
        let (client, connection) = self.config.connect(NoTls).await?;
        self.driver = Some(tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(error = %e, "postgres connection task ended with an error");
            }
        }));
        self.client = Some(client);
        debug!(dbname = ?self.config.get_dbname(), "postgres connection opened");
        Ok(())
    }

    fn close(&mut self) -> Result<(), PostgresFault> {
        self.statements.clear();
        // dropping the client ends the connection task on its own
        self.client = None;
        self.driver = None;
        Ok(())
    }

    fn create_command(&self, text: &str, kind: CommandKind) -> PostgresCommand {
        PostgresCommand {
            text: text.to_string(),
            kind,
            timeout: 0,
            parameters: Vec::new(),
            statement: None,
        }
    }

    async fn prepare(&mut self, command: &mut PostgresCommand) -> Result<(), PostgresFault> {
        let sql = command.sql();
        if let Some(statement) = self.statements.get(&sql) {
            command.statement = Some(statement.clone());
            return Ok(());
        }
        let types = declared_types(&command.parameters);
        let client = self.client()?;
        let statement = within_timeout(command.timeout, client.prepare_typed(&sql, &types))
            .await
            .ok_or(PostgresFault::Timeout(command.timeout))??;
        self.statements.insert(sql, statement.clone());
        command.statement = Some(statement);
        Ok(())
    }

    async fn execute_non_query(&mut self, command: &PostgresCommand) -> Result<u64, PostgresFault> {
        let client = self.client()?;
        let params = as_refs(&command.parameters);
        let affected = match &command.statement {
            Some(statement) => {
                within_timeout(command.timeout, client.execute(statement, &params)).await
            }
            None => {
                let sql = command.sql();
                within_timeout(command.timeout, client.execute(sql.as_str(), &params)).await
            }
        };
        Ok(affected.ok_or(PostgresFault::Timeout(command.timeout))??)
    }

    async fn execute_reader(&mut self, command: &PostgresCommand) -> Result<ResultSet, PostgresFault> {
        let client = self.client()?;
        let params = as_refs(&command.parameters);
        let result_set = match &command.statement {
            Some(statement) => {
                let rows = within_timeout(command.timeout, client.query(statement, &params))
                    .await
                    .ok_or(PostgresFault::Timeout(command.timeout))??;
                build_result_set(statement.columns(), &rows)?
            }
            None => {
                let sql = command.sql();
                let rows = within_timeout(command.timeout, client.query(sql.as_str(), &params))
                    .await
                    .ok_or(PostgresFault::Timeout(command.timeout))??;
                build_result_set_from_rows(&rows)?
            }
        };
        Ok(result_set)
    }

    async fn begin_transaction(&mut self) -> Result<(), PostgresFault> {
        self.client()?.batch_execute("BEGIN").await?;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), PostgresFault> {
        self.client()?.batch_execute("COMMIT").await?;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), PostgresFault> {
        self.client()?.batch_execute("ROLLBACK").await?;
        Ok(())
    }
}

/// `PostgreSQL` through `tokio-postgres`.
#[derive(Debug, Clone, Copy)]
pub struct Postgres;

impl Vendor for Postgres {
    type Connection = PostgresConnection;

    const KIND: DriverKind = DriverKind::Postgres;
    const CONNECTION_STRING_ENV: &'static str = POSTGRES_CONNECTION_ENV;

    fn build_connection(connection_string: &str) -> Result<PostgresConnection, PostgresFault> {
        PostgresConnection::new(connection_string)
    }
}
