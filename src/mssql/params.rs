use tiberius::Query;

use crate::types::{DbParameter, RowValues};

fn bound(parameters: &[DbParameter]) -> impl Iterator<Item = &DbParameter> {
    parameters.iter().filter(|p| p.direction.is_bound())
}

/// `EXEC name @arg = @P1, ...`; unnamed parameters are passed positionally.
#[must_use]
pub fn procedure_call(name: &str, parameters: &[DbParameter]) -> String {
    let args: Vec<String> = bound(parameters)
        .enumerate()
        .map(|(i, p)| {
            let name = p.name.trim_start_matches('@');
            if name.is_empty() {
                format!("@P{}", i + 1)
            } else {
                format!("@{name} = @P{}", i + 1)
            }
        })
        .collect();
    if args.is_empty() {
        format!("EXEC {name}")
    } else {
        format!("EXEC {name} {}", args.join(", "))
    }
}

/// Bind parameters to the query in order; they become `@P1..@Pn` on the server.
pub fn bind_query_params<'a>(sql: &'a str, parameters: &[DbParameter]) -> Query<'a> {
    let mut query = Query::new(sql);

    for parameter in bound(parameters) {
        match &parameter.value {
            RowValues::Int(i) => query.bind(*i),
            RowValues::Float(f) => query.bind(*f),
            RowValues::Text(s) => query.bind(s.clone()),
            RowValues::Bool(b) => query.bind(*b),
            RowValues::Timestamp(dt) => query.bind(*dt),
            RowValues::Null => query.bind(Option::<String>::None),
            RowValues::JSON(jsval) => query.bind(jsval.to_string()),
            RowValues::Blob(bytes) => query.bind(bytes.clone()),
        }
    }

    query
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn procedure_call_syntax() {
        let params = vec![
            DbParameter::input("@id", RowValues::Int(1)),
            DbParameter::input("nickname", RowValues::Text("bo".into())),
        ];
        assert_eq!(
            procedure_call("save_user_nickname", &params),
            "EXEC save_user_nickname @id = @P1, @nickname = @P2"
        );
        assert_eq!(procedure_call("get_all_users", &[]), "EXEC get_all_users");
    }
}
