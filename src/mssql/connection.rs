use async_trait::async_trait;
use thiserror::Error;
use tiberius::error::Error as TiberiusError;
use tiberius::{Client, Config, SqlBrowser};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::debug;

use super::params::{bind_query_params, procedure_call};
use super::query::build_result_set;
use crate::driver::{DriverCommand, DriverConnection, Vendor, VendorFault, within_timeout};
use crate::results::ResultSet;
use crate::types::{CommandKind, ConnectionState, DbParameter, DriverKind};

/// Vendor-specific environment key for SQL Server.
pub const MSSQL_CONNECTION_ENV: &str = "MSSQL_CONNECTION_STRING";

/// Server error numbers worth retrying on a fresh connection: deadlock victim, database
/// unavailable, and the Azure SQL throttling/failover family.
const TRANSIENT_ERRORS: [u32; 7] = [1205, 4060, 40197, 40501, 40613, 49918, 49919];

/// SQL Server client over a tokio TCP stream.
pub type MssqlClient = Client<Compat<TcpStream>>;

#[derive(Debug, Error)]
pub enum MssqlFault {
    #[error(transparent)]
    Driver(#[from] TiberiusError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("command timed out after {0} seconds")]
    Timeout(u32),
    #[error("connection is not open")]
    NotOpen,
}

impl VendorFault for MssqlFault {
    fn code(&self) -> Option<String> {
        match self {
            MssqlFault::Driver(TiberiusError::Server(e)) => Some(e.code().to_string()),
            MssqlFault::Timeout(_) => Some("timeout".to_string()),
            _ => None,
        }
    }

    fn is_transient(&self) -> bool {
        match self {
            MssqlFault::Driver(TiberiusError::Server(e)) => TRANSIENT_ERRORS.contains(&e.code()),
            MssqlFault::Driver(TiberiusError::Io { .. } | TiberiusError::Routing { .. })
            | MssqlFault::Io(_)
            | MssqlFault::NotOpen => true,
            _ => false,
        }
    }
}

/// A command bound to a [`MssqlConnection`].
#[derive(Debug, Clone)]
pub struct MssqlCommand {
    text: String,
    kind: CommandKind,
    timeout: u32,
    parameters: Vec<DbParameter>,
    prepared: bool,
}

impl MssqlCommand {
    /// The SQL actually sent: the text itself, or an `EXEC` for a procedure.
    #[must_use]
    pub fn sql(&self) -> String {
        match self.kind {
            CommandKind::StoredProcedure => procedure_call(&self.text, &self.parameters),
            _ => self.text.clone(),
        }
    }
}

impl DriverCommand for MssqlCommand {
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

    /// Marker only: tiberius keeps no server-side statement handle for the command.
    fn is_prepared(&self) -> bool {
        self.prepared
    }
}

/// One tiberius client, connected on `open`.
pub struct MssqlConnection {
    config: Config,
    client: Option<MssqlClient>,
}

impl std::fmt::Debug for MssqlConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MssqlConnection")
            .field("addr", &self.config.get_addr())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl MssqlConnection {
    /// Parse an ADO.NET style connection string without connecting.
    ///
    /// # Errors
    /// Returns the driver error for a malformed string.
    pub fn new(connection_string: &str) -> Result<Self, MssqlFault> {
        Ok(Self {
            config: Config::from_ado_string(connection_string)?,
            client: None,
        })
    }

    fn client(&mut self) -> Result<&mut MssqlClient, MssqlFault> {
        self.client.as_mut().ok_or(MssqlFault::NotOpen)
    }

    async fn simple(&mut self, sql: &str) -> Result<(), MssqlFault> {
        self.client()?.simple_query(sql).await?.into_results().await?;
        Ok(())
    }
}

#[async_trait]
impl DriverConnection for MssqlConnection {
    type Command = MssqlCommand;
    type Error = MssqlFault;

    fn state(&self) -> ConnectionState {
        if self.client.is_some() {
            ConnectionState::Open
        } else {
            ConnectionState::Closed
        }
    }

    async fn open(&mut self) -> Result<(), MssqlFault> {
        if self.client.is_some() {
            return Ok(());
        }
        let tcp = TcpStream::connect_named(&self.config).await?;
        tcp.set_nodelay(true)?;
        let client = Client::connect(self.config.clone(), tcp.compat_write()).await?;
        self.client = Some(client);
        debug!(addr = %self.config.get_addr(), "sql server connection opened");
        Ok(())
    }

    fn close(&mut self) -> Result<(), MssqlFault> {
        // dropping the client closes the socket
        self.client = None;
        Ok(())
    }

    fn create_command(&self, text: &str, kind: CommandKind) -> MssqlCommand {
        MssqlCommand {
            text: text.to_string(),
            kind,
            timeout: 0,
            parameters: Vec::new(),
            prepared: false,
        }
    }

    async fn prepare(&mut self, command: &mut MssqlCommand) -> Result<(), MssqlFault> {
        // parameterised queries already go through sp_executesql, whose plans the server caches
        self.client()?;
        command.prepared = true;
        Ok(())
    }

    async fn execute_non_query(&mut self, command: &MssqlCommand) -> Result<u64, MssqlFault> {
        let sql = command.sql();
        let query = bind_query_params(&sql, &command.parameters);
        let client = self.client()?;
        let result = within_timeout(command.timeout, query.execute(client))
            .await
            .ok_or(MssqlFault::Timeout(command.timeout))??;
        Ok(result.total())
    }

    async fn execute_reader(&mut self, command: &MssqlCommand) -> Result<ResultSet, MssqlFault> {
        let sql = command.sql();
        let query = bind_query_params(&sql, &command.parameters);
        let client = self.client()?;
        let fetch = async move {
            let stream = query.query(client).await?;
            build_result_set(stream).await
        };
        let result_set = within_timeout(command.timeout, fetch)
            .await
            .ok_or(MssqlFault::Timeout(command.timeout))??;
        Ok(result_set)
    }

    async fn begin_transaction(&mut self) -> Result<(), MssqlFault> {
        self.simple("BEGIN TRANSACTION").await
    }

    async fn commit(&mut self) -> Result<(), MssqlFault> {
        self.simple("COMMIT TRANSACTION").await
    }

    async fn rollback(&mut self) -> Result<(), MssqlFault> {
        self.simple("ROLLBACK TRANSACTION").await
    }
}

/// Microsoft SQL Server through `tiberius`.
#[derive(Debug, Clone, Copy)]
pub struct Mssql;

impl Vendor for Mssql {
    type Connection = MssqlConnection;

    const KIND: DriverKind = DriverKind::Mssql;
    const CONNECTION_STRING_ENV: &'static str = MSSQL_CONNECTION_ENV;

    fn build_connection(connection_string: &str) -> Result<MssqlConnection, MssqlFault> {
        MssqlConnection::new(connection_string)
    }
}
