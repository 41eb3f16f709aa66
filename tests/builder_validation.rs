use sql_fluent::prelude::*;
use sql_fluent::test_utils::ScriptedVendor;

type ScriptedBuilder = Builder<ScriptedVendor>;

fn builder(label: &str) -> ScriptedBuilder {
    ScriptedBuilder::new(format!("scripted://{label}"), false).expect("builder")
}

#[test]
fn table_direct_is_rejected_everywhere() {
    let err = builder("td-type")
        .with_command_type(CommandKind::TableDirect)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsupportedOperation);

    let err = builder("td-command")
        .with_command("users", CommandKind::TableDirect)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsupportedOperation);

    let mut disposed = builder("td-disposed");
    disposed.dispose();
    let err = disposed.with_command_type(CommandKind::TableDirect).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsupportedOperation);
}

#[test]
fn empty_command_text_is_rejected() {
    for text in ["", "   ", "\n\t"] {
        let err = builder("empty-text")
            .with_command(text, CommandKind::Text)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument, "{text:?}");
    }
    let err = builder("empty-proc").with_procedure("").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[test]
fn timeout_bounds() {
    assert_eq!(builder("t0").with_timeout(0).expect("zero").timeout(), 0);
    assert_eq!(
        builder("tmax")
            .with_timeout(i64::from(u32::MAX))
            .expect("max")
            .timeout(),
        u32::MAX
    );
    for seconds in [-1, i64::MIN, i64::from(u32::MAX) + 1] {
        let err = builder("tbad").with_timeout(seconds).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfRange, "{seconds}");
        assert!(err.is_configuration_misuse());
    }
}

#[test]
fn absent_parameters_are_rejected_but_empty_ones_are_not() {
    let err = builder("params-none")
        .with_parameters(None::<ParameterSet>)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    let b = builder("params-empty")
        .with_parameters(ParameterSet::new())
        .expect("empty set");
    assert_eq!(b.parameters().map(ParameterSet::len), Some(0));

    let b = builder("params-vec")
        .with_parameters(vec![
            DbParameter::input("id", RowValues::Int(1)),
            DbParameter::positional(RowValues::Null),
        ])
        .expect("vec");
    let names: Vec<_> = b
        .parameters()
        .expect("set")
        .iter()
        .map(|p| p.name.clone())
        .collect();
    assert_eq!(names, ["id", ""]);
}

#[test]
fn settings_are_recorded_before_build() {
    let b = builder("settings")
        .with_procedure("get_all_users")
        .expect("procedure")
        .with_prepared_statement_requiring(false)
        .with_timeout(7)
        .expect("timeout")
        .with_transaction()
        .expect("transaction");

    let command = b.command().expect("command");
    assert_eq!(command.text, "get_all_users");
    assert_eq!(command.kind, CommandKind::StoredProcedure);
    assert_eq!(b.command_kind(), CommandKind::StoredProcedure);
    assert!(b.prepared_statement().enabled);
    assert!(!b.prepared_statement().require_parameters);
    assert_eq!(b.timeout(), 7);
    assert!(b.transaction_requested());
    // nothing begins before build
    assert_eq!(b.transaction_state(), None);
    assert_eq!(b.connection_string(), "scripted://settings");
}

#[test]
fn dispose_is_idempotent_and_blocks_transactions() {
    let mut b = builder("dispose-twice");
    assert!(b.connection().is_some());
    b.dispose();
    b.dispose();
    assert!(b.is_disposed());
    assert!(b.connection().is_none());

    let err = b.with_transaction().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
}

#[tokio::test]
async fn disposed_builder_cannot_build() {
    let mut b = builder("dispose-build");
    b.dispose();
    let err = b.build().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
}

#[test]
fn connection_construction_faults() {
    let err = ScriptedBuilder::new("", true).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    let err = ScriptedBuilder::new("scripted://broken?fatal_construct=true", false).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connection);
    assert!(std::error::Error::source(&err).is_some());
}

#[tokio::test]
async fn open_failure_surfaces_as_connection_error() {
    let err = ScriptedBuilder::new("scripted://unreachable?fail_open=true", false)
        .expect("builder")
        .build()
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connection);
}

#[test]
fn missing_environment_is_a_configuration_error() {
    // only meaningful when neither key is set in the surrounding environment
    let keys = [
        <ScriptedVendor as sql_fluent::Vendor>::CONNECTION_STRING_ENV,
        CONNECTION_STRING_ENV,
    ];
    if keys.iter().any(|key| std::env::var_os(key).is_some()) {
        return;
    }
    let err = ScriptedBuilder::from_env(false).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert!(err.to_string().contains(CONNECTION_STRING_ENV));
}
