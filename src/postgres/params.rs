use std::error::Error;

use chrono::{TimeZone, Utc};
use tokio_postgres::types::{IsNull, ToSql, Type, to_sql_checked};
use tokio_util::bytes;

use crate::types::{DbParameter, DbType, RowValues};

/// Parameters that travel to the server, in binding order.
pub(crate) fn bound(parameters: &[DbParameter]) -> impl Iterator<Item = &DbParameter> {
    parameters.iter().filter(|p| p.direction.is_bound())
}

/// Borrow bound parameter values the way `tokio-postgres` wants them.
#[must_use]
pub fn as_refs(parameters: &[DbParameter]) -> Vec<&(dyn ToSql + Sync)> {
    bound(parameters)
        .map(|p| &p.value as &(dyn ToSql + Sync))
        .collect()
}

/// Server type for a logical parameter type; `None` leaves inference to the server.
#[must_use]
pub fn pg_type(db_type: DbType) -> Option<Type> {
    match db_type {
        DbType::Integer => Some(Type::INT8),
        DbType::SmallInt => Some(Type::INT2),
        DbType::Float => Some(Type::FLOAT8),
        DbType::Text => Some(Type::TEXT),
        DbType::Boolean => Some(Type::BOOL),
        DbType::Timestamp => Some(Type::TIMESTAMP),
        DbType::Json => Some(Type::JSONB),
        DbType::Binary => Some(Type::BYTEA),
        DbType::Unspecified => None,
    }
}

/// Declared types for `prepare_typed`. Types can only be given as a prefix, so the list
/// stops at the first parameter whose type is unspecified.
#[must_use]
pub fn declared_types(parameters: &[DbParameter]) -> Vec<Type> {
    bound(parameters).map_while(|p| pg_type(p.db_type)).collect()
}

/// `SELECT * FROM name(arg => $1, ...)`; unnamed parameters are passed positionally.
#[must_use]
pub fn procedure_call(name: &str, parameters: &[DbParameter]) -> String {
    let args: Vec<String> = bound(parameters)
        .enumerate()
        .map(|(i, p)| {
            let name = p.name.trim_start_matches(['@', ':', '$']);
            if name.is_empty() {
                format!("${}", i + 1)
            } else {
                format!("{name} => ${}", i + 1)
            }
        })
        .collect();
    format!("SELECT * FROM {name}({})", args.join(", "))
}

impl ToSql for RowValues {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut bytes::BytesMut,
    ) -> Result<IsNull, Box<dyn Error + Sync + Send>> {
        match self {
            RowValues::Int(i) => match *ty {
                Type::INT2 => i16::try_from(*i)?.to_sql(ty, out),
                Type::INT4 => i32::try_from(*i)?.to_sql(ty, out),
                _ => (*i).to_sql(ty, out),
            },
            #[allow(clippy::cast_possible_truncation)]
            RowValues::Float(f) => match *ty {
                Type::FLOAT4 => (*f as f32).to_sql(ty, out),
                _ => (*f).to_sql(ty, out),
            },
            RowValues::Text(s) => s.to_sql(ty, out),
            RowValues::Bool(b) => (*b).to_sql(ty, out),
            RowValues::Timestamp(dt) => match *ty {
                Type::TIMESTAMPTZ => Utc.from_utc_datetime(dt).to_sql(ty, out),
                Type::DATE => dt.date().to_sql(ty, out),
                _ => dt.to_sql(ty, out),
            },
            RowValues::Null => Ok(IsNull::Yes),
            RowValues::JSON(jsval) => jsval.to_sql(ty, out),
            RowValues::Blob(bytes) => bytes.to_sql(ty, out),
        }
    }

    fn accepts(ty: &Type) -> bool {
        matches!(
            *ty,
            Type::INT2
                | Type::INT4
                | Type::INT8
                | Type::FLOAT4
                | Type::FLOAT8
                | Type::TEXT
                | Type::VARCHAR
                | Type::CHAR
                | Type::NAME
                | Type::BOOL
                | Type::TIMESTAMP
                | Type::TIMESTAMPTZ
                | Type::DATE
                | Type::JSON
                | Type::JSONB
                | Type::BYTEA
        )
    }

    to_sql_checked!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ParameterDirection;

    #[test]
    fn procedure_call_names_arguments() {
        let params = vec![
            DbParameter::input("@id", RowValues::Int(1)),
            DbParameter::positional(RowValues::Text("x".into())),
            DbParameter::new("out", DbType::Integer, RowValues::Null, ParameterDirection::Output),
        ];
        assert_eq!(
            procedure_call("save_user_nickname", &params),
            "SELECT * FROM save_user_nickname(id => $1, $2)"
        );
        assert_eq!(as_refs(&params).len(), 2);
    }

    #[test]
    fn declared_types_stop_at_first_unspecified() {
        let params = vec![
            DbParameter::input("a", RowValues::Int(1)),
            DbParameter::input("b", RowValues::Null),
            DbParameter::input("c", RowValues::Bool(true)),
        ];
        assert_eq!(declared_types(&params), vec![Type::INT8]);
    }

    #[test]
    fn int_narrows_to_column_width() {
        let mut out = bytes::BytesMut::new();
        RowValues::Int(7).to_sql(&Type::INT4, &mut out).expect("int4");
        assert_eq!(out.len(), 4);

        let mut out = bytes::BytesMut::new();
        assert!(RowValues::Int(i64::MAX).to_sql(&Type::INT2, &mut out).is_err());
    }
}
