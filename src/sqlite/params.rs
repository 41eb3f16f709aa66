use rusqlite::Statement;
use rusqlite::types::Value;

use crate::types::{DbParameter, RowValues};

/// Convert a single `RowValues` to a rusqlite `Value`.
#[must_use]
pub fn row_value_to_sqlite_value(value: &RowValues) -> Value {
    match value {
        RowValues::Int(i) => Value::Integer(*i),
        RowValues::Float(f) => Value::Real(*f),
        RowValues::Text(s) => Value::Text(s.clone()),
        RowValues::Bool(b) => Value::Integer(i64::from(*b)),
        RowValues::Timestamp(dt) => Value::Text(dt.format("%F %T%.f").to_string()),
        RowValues::Null => Value::Null,
        RowValues::JSON(jval) => Value::Text(jval.to_string()),
        RowValues::Blob(bytes) => Value::Blob(bytes.clone()),
    }
}

/// Bind parameters onto `stmt`: named ones by name (with or without a `:`/`@`/`$`
/// prefix), unnamed ones by their position among the bound parameters.
///
/// # Errors
/// `InvalidParameterName` when the statement has no placeholder with that name, or any
/// bind error from `SQLite`.
pub fn bind_parameters(stmt: &mut Statement<'_>, parameters: &[DbParameter]) -> rusqlite::Result<()> {
    stmt.clear_bindings();
    for (position, parameter) in parameters
        .iter()
        .filter(|p| p.direction.is_bound())
        .enumerate()
    {
        let index = if parameter.is_named() {
            named_index(stmt, &parameter.name)?
        } else {
            position + 1
        };
        stmt.raw_bind_parameter(index, row_value_to_sqlite_value(&parameter.value))?;
    }
    Ok(())
}

fn named_index(stmt: &Statement<'_>, name: &str) -> rusqlite::Result<usize> {
    if name.starts_with([':', '@', '$']) {
        if let Some(index) = stmt.parameter_index(name)? {
            return Ok(index);
        }
    } else {
        for prefix in [':', '@', '$'] {
            if let Some(index) = stmt.parameter_index(&format!("{prefix}{name}"))? {
                return Ok(index);
            }
        }
    }
    Err(rusqlite::Error::InvalidParameterName(name.to_string()))
}
