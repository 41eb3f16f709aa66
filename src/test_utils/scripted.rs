//! In-process driver whose behaviour is scripted through its connection string.
//!
//! `scripted://<label>?key=value&key=value` recognises:
//!
//! | key                     | effect                                                    |
//! |-------------------------|-----------------------------------------------------------|
//! | `rows=N`                | readers return `N` rows (`id`, `db_name`, `age`); default 1 |
//! | `affected=N`            | non-queries report `N` affected rows; default 1           |
//! | `zero_on=TEXT`          | non-query `TEXT` reports 0 affected rows                  |
//! | `empty_on=TEXT`         | reader `TEXT` returns no rows                             |
//! | `fail_on=TEXT`          | any command `TEXT` raises a fault                         |
//! | `fail_code=CODE`        | code carried by `fail_on` faults; default `XX000`         |
//! | `fail_open=true`        | `open` fails                                              |
//! | `prepare=never`         | `prepare` succeeds but leaves the command unprepared      |
//! | `prepare_fault=true`    | `prepare` raises a fault                                  |
//! | `transient_construct=N` | the first `N` constructions fail with a transient fault   |
//! | `fatal_construct=true`  | construction fails with a non-transient fault             |
//!
//! Every connection writes to a [`ScriptedJournal`] that tests can keep after the
//! connection itself is gone.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex, PoisonError};

use async_trait::async_trait;
use thiserror::Error;

use crate::driver::{DriverCommand, DriverConnection, Vendor, VendorFault};
use crate::results::ResultSet;
use crate::types::{CommandKind, ConnectionState, DbParameter, DriverKind, RowValues};

/// Vendor-specific environment key for the scripted driver.
pub const SCRIPTED_CONNECTION_ENV: &str = "SCRIPTED_CONNECTION_STRING";

static CONSTRUCTIONS: LazyLock<Mutex<HashMap<String, usize>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// How many times `build_connection` has been called with `connection_string`.
#[must_use]
pub fn construction_count(connection_string: &str) -> usize {
    CONSTRUCTIONS
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .get(connection_string)
        .copied()
        .unwrap_or(0)
}

fn record_construction(connection_string: &str) -> usize {
    let mut counts = CONSTRUCTIONS.lock().unwrap_or_else(PoisonError::into_inner);
    let count = counts.entry(connection_string.to_string()).or_insert(0);
    *count += 1;
    *count
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandRecord {
    pub text: String,
    pub kind: CommandKind,
    pub timeout: u32,
    pub parameters: Vec<DbParameter>,
    pub prepared: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScriptedEvent {
    Opened,
    Closed,
    Prepared { text: String },
    NonQuery(CommandRecord),
    Reader(CommandRecord),
    Began,
    Committed,
    RolledBack,
}

/// Shared, append-only log of what a scripted connection did.
#[derive(Debug, Clone, Default)]
pub struct ScriptedJournal(Arc<Mutex<Vec<ScriptedEvent>>>);

impl ScriptedJournal {
    fn push(&self, event: ScriptedEvent) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }

    #[must_use]
    pub fn events(&self) -> Vec<ScriptedEvent> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    #[must_use]
    pub fn count(&self, wanted: &ScriptedEvent) -> usize {
        self.events().iter().filter(|e| *e == wanted).count()
    }

    /// Records of every command that reached the driver, in order.
    #[must_use]
    pub fn commands(&self) -> Vec<CommandRecord> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ScriptedEvent::NonQuery(r) | ScriptedEvent::Reader(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    #[must_use]
    pub fn last_command(&self) -> Option<CommandRecord> {
        self.commands().pop()
    }
}

#[derive(Debug, Error)]
#[error("scripted fault {code}: {message}")]
pub struct ScriptedFault {
    pub code: String,
    pub message: String,
    pub transient: bool,
}

impl ScriptedFault {
    fn new(code: &str, message: impl Into<String>, transient: bool) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            transient,
        }
    }
}

impl VendorFault for ScriptedFault {
    fn code(&self) -> Option<String> {
        Some(self.code.clone())
    }

    fn is_transient(&self) -> bool {
        self.transient
    }
}

#[derive(Debug, Clone)]
struct Script {
    rows: usize,
    affected: u64,
    zero_on: Option<String>,
    empty_on: Option<String>,
    fail_on: Option<String>,
    fail_code: String,
    fail_open: bool,
    prepare_never: bool,
    prepare_fault: bool,
    transient_construct: usize,
    fatal_construct: bool,
}

impl Script {
    fn parse(connection_string: &str) -> Self {
        let mut script = Script {
            rows: 1,
            affected: 1,
            zero_on: None,
            empty_on: None,
            fail_on: None,
            fail_code: "XX000".to_string(),
            fail_open: false,
            prepare_never: false,
            prepare_fault: false,
            transient_construct: 0,
            fatal_construct: false,
        };
        let Some((_, query)) = connection_string.split_once('?') else {
            return script;
        };
        for pair in query.split('&') {
            let Some((key, value)) = pair.split_once('=') else {
                continue;
            };
            match key {
                "rows" => script.rows = value.parse().unwrap_or(script.rows),
                "affected" => script.affected = value.parse().unwrap_or(script.affected),
                "zero_on" => script.zero_on = Some(value.to_string()),
                "empty_on" => script.empty_on = Some(value.to_string()),
                "fail_on" => script.fail_on = Some(value.to_string()),
                "fail_code" => script.fail_code = value.to_string(),
                "fail_open" => script.fail_open = value == "true",
                "prepare" => script.prepare_never = value == "never",
                "prepare_fault" => script.prepare_fault = value == "true",
                "transient_construct" => {
                    script.transient_construct = value.parse().unwrap_or(0);
                }
                "fatal_construct" => script.fatal_construct = value == "true",
                _ => {}
            }
        }
        script
    }
}

#[derive(Debug, Clone)]
pub struct ScriptedCommand {
    text: String,
    kind: CommandKind,
    timeout: u32,
    parameters: Vec<DbParameter>,
    prepared: bool,
}

impl ScriptedCommand {
    fn record(&self) -> CommandRecord {
        CommandRecord {
            text: self.text.clone(),
            kind: self.kind,
            timeout: self.timeout,
            parameters: self.parameters.clone(),
            prepared: self.prepared,
        }
    }
}

impl DriverCommand for ScriptedCommand {
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

#[derive(Debug)]
pub struct ScriptedConnection {
    script: Script,
    state: ConnectionState,
    in_transaction: bool,
    journal: ScriptedJournal,
}

impl ScriptedConnection {
    #[must_use]
    pub fn journal(&self) -> ScriptedJournal {
        self.journal.clone()
    }

    #[must_use]
    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    fn ensure_open(&self) -> Result<(), ScriptedFault> {
        if self.state == ConnectionState::Open {
            Ok(())
        } else {
            Err(ScriptedFault::new("08003", "connection is not open", false))
        }
    }

    fn check_failure(&self, text: &str) -> Result<(), ScriptedFault> {
        if self.script.fail_on.as_deref() == Some(text) {
            return Err(ScriptedFault::new(
                &self.script.fail_code,
                format!("command `{text}` failed"),
                false,
            ));
        }
        Ok(())
    }

    fn rows(&self, text: &str) -> ResultSet {
        let count = if self.script.empty_on.as_deref() == Some(text) {
            0
        } else {
            self.script.rows
        };
        let mut rs = ResultSet::with_capacity(count);
        rs.set_column_names(Arc::new(vec![
            "id".to_string(),
            "db_name".to_string(),
            "age".to_string(),
        ]));
        for i in 0..count {
            let id = i64::try_from(i).unwrap_or(i64::MAX);
            rs.add_row_values(vec![
                RowValues::Int(id),
                RowValues::Text(format!("user{i}")),
                RowValues::Int(20 + id),
            ]);
        }
        rs
    }
}

#[async_trait]
impl DriverConnection for ScriptedConnection {
    type Command = ScriptedCommand;
    type Error = ScriptedFault;

    fn state(&self) -> ConnectionState {
        self.state
    }

    async fn open(&mut self) -> Result<(), ScriptedFault> {
        if self.script.fail_open {
            self.state = ConnectionState::Broken;
            return Err(ScriptedFault::new("08001", "server refused connection", false));
        }
        self.state = ConnectionState::Open;
        self.journal.push(ScriptedEvent::Opened);
        Ok(())
    }

    fn close(&mut self) -> Result<(), ScriptedFault> {
        if self.state != ConnectionState::Closed {
            self.state = ConnectionState::Closed;
            self.in_transaction = false;
            self.journal.push(ScriptedEvent::Closed);
        }
        Ok(())
    }

    fn create_command(&self, text: &str, kind: CommandKind) -> ScriptedCommand {
        ScriptedCommand {
            text: text.to_string(),
            kind,
            timeout: 0,
            parameters: Vec::new(),
            prepared: false,
        }
    }

    async fn prepare(&mut self, command: &mut ScriptedCommand) -> Result<(), ScriptedFault> {
        self.ensure_open()?;
        if self.script.prepare_fault {
            return Err(ScriptedFault::new("26000", "cannot prepare statement", false));
        }
        if !self.script.prepare_never {
            command.prepared = true;
            self.journal.push(ScriptedEvent::Prepared {
                text: command.text.clone(),
            });
        }
        Ok(())
    }

    async fn execute_non_query(&mut self, command: &ScriptedCommand) -> Result<u64, ScriptedFault> {
        self.ensure_open()?;
        self.check_failure(&command.text)?;
        self.journal.push(ScriptedEvent::NonQuery(command.record()));
        if self.script.zero_on.as_deref() == Some(command.text.as_str()) {
            return Ok(0);
        }
        Ok(self.script.affected)
    }

    async fn execute_reader(&mut self, command: &ScriptedCommand) -> Result<ResultSet, ScriptedFault> {
        self.ensure_open()?;
        self.check_failure(&command.text)?;
        self.journal.push(ScriptedEvent::Reader(command.record()));
        Ok(self.rows(&command.text))
    }

    async fn begin_transaction(&mut self) -> Result<(), ScriptedFault> {
        self.ensure_open()?;
        if self.in_transaction {
            return Err(ScriptedFault::new("25001", "transaction already active", false));
        }
        self.in_transaction = true;
        self.journal.push(ScriptedEvent::Began);
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), ScriptedFault> {
        self.ensure_open()?;
        if !self.in_transaction {
            return Err(ScriptedFault::new("25P01", "no transaction in progress", false));
        }
        self.in_transaction = false;
        self.journal.push(ScriptedEvent::Committed);
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), ScriptedFault> {
        self.ensure_open()?;
        if !self.in_transaction {
            return Err(ScriptedFault::new("25P01", "no transaction in progress", false));
        }
        self.in_transaction = false;
        self.journal.push(ScriptedEvent::RolledBack);
        Ok(())
    }
}

/// Vendor handle for the scripted driver.
#[derive(Debug, Clone, Copy)]
pub struct ScriptedVendor;

impl Vendor for ScriptedVendor {
    type Connection = ScriptedConnection;

    const KIND: DriverKind = DriverKind::Scripted;
    const CONNECTION_STRING_ENV: &'static str = SCRIPTED_CONNECTION_ENV;

    fn build_connection(connection_string: &str) -> Result<ScriptedConnection, ScriptedFault> {
        let attempt = record_construction(connection_string);
        let script = Script::parse(connection_string);
        if script.fatal_construct {
            return Err(ScriptedFault::new("08004", "server rejected connection", false));
        }
        if attempt <= script.transient_construct {
            return Err(ScriptedFault::new("08006", "connection reset by peer", true));
        }
        Ok(ScriptedConnection {
            script,
            state: ConnectionState::Closed,
            in_transaction: false,
            journal: ScriptedJournal::default(),
        })
    }
}
