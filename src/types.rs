use chrono::NaiveDateTime;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::SqlFluentError;

/// Values that can be stored in a database row or bound as parameter values.
///
/// The same enum is used by every backend so row mappers never branch on driver types:
/// ```rust
/// use sql_fluent::prelude::*;
///
/// let values = vec![
///     RowValues::Int(1),
///     RowValues::Text("alice".into()),
///     RowValues::Bool(true),
/// ];
/// # let _ = values;
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum RowValues {
    /// Integer value (64-bit)
    Int(i64),
    /// Floating point value (64-bit)
    Float(f64),
    /// Text/string value
    Text(String),
    /// Boolean value
    Bool(bool),
    /// Timestamp value
    Timestamp(NaiveDateTime),
    /// NULL value
    Null,
    /// JSON value
    JSON(JsonValue),
    /// Binary data
    Blob(Vec<u8>),
}

impl RowValues {
    /// Check if this value is NULL
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub fn as_int(&self) -> Option<&i64> {
        if let RowValues::Int(value) = self {
            Some(value)
        } else {
            None
        }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        if let RowValues::Text(value) = self {
            Some(value)
        } else {
            None
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<&bool> {
        if let RowValues::Bool(value) = self {
            return Some(value);
        } else if let Some(i) = self.as_int() {
            if *i == 1 {
                return Some(&true);
            } else if *i == 0 {
                return Some(&false);
            }
        }
        None
    }

    #[must_use]
    pub fn as_timestamp(&self) -> Option<NaiveDateTime> {
        if let RowValues::Timestamp(value) = self {
            return Some(*value);
        } else if let Some(s) = self.as_text() {
            // Try "YYYY-MM-DD HH:MM:SS"
            if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
                return Some(dt);
            }
            // Try "YYYY-MM-DD HH:MM:SS.SSS"
            if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S.%3f") {
                return Some(dt);
            }
        }
        None
    }

    #[must_use]
    pub fn as_float(&self) -> Option<f64> {
        if let RowValues::Float(value) = self {
            Some(*value)
        } else {
            None
        }
    }

    #[must_use]
    pub fn as_blob(&self) -> Option<&[u8]> {
        if let RowValues::Blob(bytes) = self {
            Some(bytes)
        } else {
            None
        }
    }

    /// Best-effort `DbType` for a value, used when a parameter is built without one.
    #[must_use]
    pub fn inferred_db_type(&self) -> DbType {
        match self {
            RowValues::Int(_) => DbType::Integer,
            RowValues::Float(_) => DbType::Float,
            RowValues::Text(_) => DbType::Text,
            RowValues::Bool(_) => DbType::Boolean,
            RowValues::Timestamp(_) => DbType::Timestamp,
            RowValues::Null => DbType::Unspecified,
            RowValues::JSON(_) => DbType::Json,
            RowValues::Blob(_) => DbType::Binary,
        }
    }
}

/// The database engines a `Vendor` can stand for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize)]
pub enum DriverKind {
    /// `PostgreSQL` via `tokio-postgres`
    Postgres,
    /// `SQLite` via `rusqlite`
    Sqlite,
    /// SQL Server via `tiberius`
    Mssql,
    /// In-process scripted driver used by tests
    #[cfg(any(test, feature = "test-utils"))]
    Scripted,
}

impl std::fmt::Display for DriverKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DriverKind::Postgres => "postgres",
            DriverKind::Sqlite => "sqlite",
            DriverKind::Mssql => "mssql",
            #[cfg(any(test, feature = "test-utils"))]
            DriverKind::Scripted => "scripted",
        };
        f.write_str(name)
    }
}

/// How the command text is interpreted by the driver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandKind {
    /// Plain SQL text
    #[default]
    Text,
    /// Name of a stored procedure/function
    StoredProcedure,
    /// Table name; recognised only so it can be rejected
    TableDirect,
}

impl CommandKind {
    /// Reject `TableDirect`, the one kind no adapter implements.
    ///
    /// # Errors
    /// Returns `SqlFluentError::UnsupportedOperation` for `CommandKind::TableDirect`.
    pub fn ensure_supported(self) -> Result<Self, SqlFluentError> {
        if self == CommandKind::TableDirect {
            return Err(SqlFluentError::UnsupportedOperation(
                "only text and stored procedure commands are supported".to_string(),
            ));
        }
        Ok(self)
    }
}

/// Command text plus the kind it should be run as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub text: String,
    pub kind: CommandKind,
}

/// Logical parameter type; each adapter maps it onto its own type system.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DbType {
    Integer,
    SmallInt,
    Float,
    Text,
    Boolean,
    Timestamp,
    Json,
    Binary,
    /// Let the driver infer the type
    #[default]
    Unspecified,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParameterDirection {
    #[default]
    Input,
    Output,
    InputOutput,
    ReturnValue,
}

impl ParameterDirection {
    /// Whether the parameter carries a value towards the server.
    #[must_use]
    pub fn is_bound(self) -> bool {
        matches!(self, ParameterDirection::Input | ParameterDirection::InputOutput)
    }
}

/// One parameter descriptor: name, type, value, and direction.
#[derive(Debug, Clone, PartialEq)]
pub struct DbParameter {
    pub name: String,
    pub db_type: DbType,
    pub value: RowValues,
    pub direction: ParameterDirection,
}

impl DbParameter {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        db_type: DbType,
        value: RowValues,
        direction: ParameterDirection,
    ) -> Self {
        Self {
            name: name.into(),
            db_type,
            value,
            direction,
        }
    }

    /// Input parameter whose type is inferred from the value.
    #[must_use]
    pub fn input(name: impl Into<String>, value: RowValues) -> Self {
        let db_type = value.inferred_db_type();
        Self::new(name, db_type, value, ParameterDirection::Input)
    }

    /// Unnamed input parameter, bound by position.
    #[must_use]
    pub fn positional(value: RowValues) -> Self {
        Self::input(String::new(), value)
    }

    #[must_use]
    pub fn is_named(&self) -> bool {
        !self.name.is_empty()
    }
}

/// Ordered parameter list. Duplicate names are kept as-is.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterSet(Vec<DbParameter>);

impl ParameterSet {
    #[must_use]
    pub fn new() -> Self {
        Self(Vec::new())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn push(&mut self, parameter: DbParameter) {
        self.0.push(parameter);
    }

    pub fn iter(&self) -> std::slice::Iter<'_, DbParameter> {
        self.0.iter()
    }

    #[must_use]
    pub fn as_slice(&self) -> &[DbParameter] {
        &self.0
    }
}

impl From<Vec<DbParameter>> for ParameterSet {
    fn from(parameters: Vec<DbParameter>) -> Self {
        Self(parameters)
    }
}

impl FromIterator<DbParameter> for ParameterSet {
    fn from_iter<I: IntoIterator<Item = DbParameter>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for ParameterSet {
    type Item = DbParameter;
    type IntoIter = std::vec::IntoIter<DbParameter>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a ParameterSet {
    type Item = &'a DbParameter;
    type IntoIter = std::slice::Iter<'a, DbParameter>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Anything that can be handed to `with_parameters`.
///
/// `None` is how a caller expresses an absent parameter set, which is rejected; an empty
/// set is accepted.
pub trait IntoParameters {
    fn into_parameters(self) -> Option<ParameterSet>;
}

impl IntoParameters for ParameterSet {
    fn into_parameters(self) -> Option<ParameterSet> {
        Some(self)
    }
}

impl IntoParameters for Vec<DbParameter> {
    fn into_parameters(self) -> Option<ParameterSet> {
        Some(ParameterSet(self))
    }
}

impl<const N: usize> IntoParameters for [DbParameter; N] {
    fn into_parameters(self) -> Option<ParameterSet> {
        Some(self.into_iter().collect())
    }
}

impl IntoParameters for Option<ParameterSet> {
    fn into_parameters(self) -> Option<ParameterSet> {
        self
    }
}

impl IntoParameters for Option<Vec<DbParameter>> {
    fn into_parameters(self) -> Option<ParameterSet> {
        self.map(ParameterSet)
    }
}

/// Whether commands are prepared before their first execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreparedStatementPolicy {
    pub enabled: bool,
    pub require_parameters: bool,
}

impl PreparedStatementPolicy {
    #[must_use]
    pub fn new(enabled: bool, require_parameters: bool) -> Self {
        Self {
            enabled,
            require_parameters,
        }
    }

    /// Stored procedures are never prepared here; the server owns their plans.
    #[must_use]
    pub fn should_prepare(&self, parameter_count: usize, kind: CommandKind) -> bool {
        self.enabled
            && (!self.require_parameters || parameter_count > 0)
            && kind == CommandKind::Text
    }
}

/// Connection state as reported by a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Open,
    Broken,
}

impl ConnectionState {
    /// `Closed` and `Broken` both need an `open` before commands can run.
    #[must_use]
    pub fn needs_open(self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Broken)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepare_policy_truth_table() {
        let off = PreparedStatementPolicy::default();
        assert!(!off.should_prepare(3, CommandKind::Text));

        let require = PreparedStatementPolicy::new(true, true);
        assert!(!require.should_prepare(0, CommandKind::Text));
        assert!(require.should_prepare(1, CommandKind::Text));

        let always = PreparedStatementPolicy::new(true, false);
        assert!(always.should_prepare(0, CommandKind::Text));
        assert!(always.should_prepare(2, CommandKind::Text));

        assert!(!always.should_prepare(2, CommandKind::StoredProcedure));
    }

    #[test]
    fn table_direct_is_rejected() {
        assert!(CommandKind::Text.ensure_supported().is_ok());
        assert!(CommandKind::StoredProcedure.ensure_supported().is_ok());
        let err = CommandKind::TableDirect.ensure_supported().unwrap_err();
        assert!(matches!(err, SqlFluentError::UnsupportedOperation(_)));
    }

    #[test]
    fn absent_and_empty_parameters_differ() {
        assert_eq!(None::<ParameterSet>.into_parameters(), None);
        assert_eq!(
            Vec::<DbParameter>::new().into_parameters(),
            Some(ParameterSet::new())
        );
    }

    #[test]
    fn parameter_type_inferred_from_value() {
        let p = DbParameter::input("age", RowValues::Int(27));
        assert_eq!(p.db_type, DbType::Integer);
        assert_eq!(p.direction, ParameterDirection::Input);
        assert!(p.is_named());
        assert!(!DbParameter::positional(RowValues::Null).is_named());
    }
}
