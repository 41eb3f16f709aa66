use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use futures_util::TryStreamExt;
use tiberius::{ColumnData, FromSql, QueryStream};

use crate::results::ResultSet;
use crate::types::RowValues;

/// Drain every row of `stream` into a `ResultSet`. Column names come from the first
/// result set.
///
/// # Errors
/// Returns the first driver error raised while fetching or decoding.
pub async fn build_result_set(mut stream: QueryStream<'_>) -> tiberius::Result<ResultSet> {
    let column_names: Vec<String> = stream
        .columns()
        .await?
        .map(|columns| columns.iter().map(|col| col.name().to_string()).collect())
        .unwrap_or_default();

    let mut result_set = ResultSet::with_capacity(10);
    result_set.set_column_names(Arc::new(column_names));

    let mut rows = stream.into_row_stream();
    while let Some(row) = rows.try_next().await? {
        let mut row_values = Vec::with_capacity(row.len());
        for (_, data) in row.cells() {
            row_values.push(extract_value(data)?);
        }
        result_set.add_row_values(row_values);
    }

    Ok(result_set)
}

/// Convert one cell into `RowValues`.
///
/// # Errors
/// Returns the driver error when a date/time cell cannot be decoded.
pub fn extract_value(data: &ColumnData<'static>) -> tiberius::Result<RowValues> {
    let value = match data {
        ColumnData::U8(v) => v.map(|v| RowValues::Int(i64::from(v))),
        ColumnData::I16(v) => v.map(|v| RowValues::Int(i64::from(v))),
        ColumnData::I32(v) => v.map(|v| RowValues::Int(i64::from(v))),
        ColumnData::I64(v) => v.map(RowValues::Int),
        ColumnData::F32(v) => v.map(|v| RowValues::Float(f64::from(v))),
        ColumnData::F64(v) => v.map(RowValues::Float),
        ColumnData::Bit(v) => v.map(RowValues::Bool),
        ColumnData::String(v) => v.as_ref().map(|s| RowValues::Text(s.to_string())),
        ColumnData::Guid(v) => v.map(|g| RowValues::Text(g.to_string())),
        ColumnData::Binary(v) => v.as_ref().map(|b| RowValues::Blob(b.to_vec())),
        ColumnData::Numeric(v) => v.map(|n| RowValues::Float(f64::from(n))),
        ColumnData::DateTime(_) | ColumnData::SmallDateTime(_) | ColumnData::DateTime2(_) => {
            NaiveDateTime::from_sql(data)?.map(RowValues::Timestamp)
        }
        ColumnData::Date(_) => NaiveDate::from_sql(data)?
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(RowValues::Timestamp),
        ColumnData::DateTimeOffset(_) => DateTime::<Utc>::from_sql(data)?
            .map(|dt| RowValues::Timestamp(dt.naive_utc())),
        ColumnData::Time(_) => NaiveTime::from_sql(data)?.map(|t| RowValues::Text(t.to_string())),
        // xml is not decoded
        _ => None,
    };
    Ok(value.unwrap_or(RowValues::Null))
}
