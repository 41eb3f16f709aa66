use std::sync::Arc;

use sql_fluent::prelude::*;
use sql_fluent::{ConnectionState, DriverConnection};
use sql_fluent::test_utils::{ScriptedEvent, ScriptedJournal, ScriptedVendor, construction_count};

type ScriptedBuilder = Builder<ScriptedVendor>;

// Pooled tests share the global registry entry for the scripted vendor.
static POOLED: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

#[derive(Debug, Default, Clone, PartialEq)]
struct User {
    id: i64,
    name: String,
    age: i64,
}

impl User {
    fn from_row(row: &CustomDbRow) -> Result<Self, SqlFluentError> {
        let missing = |column: &str| SqlFluentError::InvalidState(format!("missing {column}"));
        Ok(Self {
            id: *row.get("id").and_then(RowValues::as_int).ok_or_else(|| missing("id"))?,
            name: row
                .get("db_name")
                .and_then(RowValues::as_text)
                .ok_or_else(|| missing("db_name"))?
                .to_string(),
            age: *row.get("age").and_then(RowValues::as_int).ok_or_else(|| missing("age"))?,
        })
    }
}

async fn journal_of(execution: &Execution<ScriptedVendor>) -> ScriptedJournal {
    execution
        .connection()
        .expect("connection")
        .lock()
        .await
        .journal()
}

#[derive(Debug, Default)]
struct Nickname {
    id: i64,
    name: String,
}

/// Read the first user, nickname it, then drop every other user, all in one transaction.
/// Returns the journal and the transaction state seen just before disposal.
async fn procedure_scenario(
    connection_string: &str,
) -> Result<(ScriptedJournal, Option<TransactionState>), SqlFluentError> {
    let mut execution = ScriptedBuilder::new(connection_string, false)?
        .with_command("get_all_users", CommandKind::StoredProcedure)?
        .with_parameters([
            DbParameter::input("min_age", RowValues::Int(18)),
            DbParameter::input("active", RowValues::Bool(true)),
        ])?
        .with_timeout(10)?
        .with_transaction()?
        .build()
        .await?;
    let journal = journal_of(&execution).await;

    let first = execution
        .read_first_command(|row| -> Result<Nickname, SqlFluentError> {
            Ok(Nickname {
                id: row.get("id").and_then(RowValues::as_int).copied().unwrap_or_default(),
                name: row
                    .get("db_name")
                    .and_then(RowValues::as_text)
                    .unwrap_or_default()
                    .to_string(),
            })
        })
        .await?;

    execution.with_parameters([DbParameter::input(
        "nickname",
        RowValues::Text(format!("{}#{}", first.name, first.id)),
    )])?;
    if execution.execute("save_user_nickname").await? {
        execution.clear_parameters();
        match execution.execute("delete_all_other_users").await {
            Ok(true) => execution.commit().await?,
            Ok(false) | Err(_) => execution.rollback().await?,
        }
    }

    let outcome = execution.transaction_state();
    execution.dispose();
    Ok((journal, outcome))
}

#[tokio::test]
async fn procedure_scenario_commits() -> Result<(), Box<dyn std::error::Error>> {
    let (journal, outcome) = procedure_scenario("scripted://scenario-commit?rows=3").await?;
    assert_eq!(outcome, Some(TransactionState::Committed));

    assert_eq!(journal.count(&ScriptedEvent::Began), 1);
    assert_eq!(journal.count(&ScriptedEvent::Committed), 1);
    assert_eq!(journal.count(&ScriptedEvent::RolledBack), 0);
    assert_eq!(journal.count(&ScriptedEvent::Closed), 1);

    let commands = journal.commands();
    let texts: Vec<_> = commands.iter().map(|c| c.text.as_str()).collect();
    assert_eq!(texts, ["get_all_users", "save_user_nickname", "delete_all_other_users"]);
    assert!(commands.iter().all(|c| c.kind == CommandKind::StoredProcedure));
    assert!(commands.iter().all(|c| c.timeout == 10));
    assert_eq!(commands[0].parameters.len(), 2);
    assert_eq!(commands[1].parameters.len(), 1);
    assert_eq!(commands[1].parameters[0].value, RowValues::Text("user0#0".into()));
    assert!(commands[2].parameters.is_empty());
    Ok(())
}

#[tokio::test]
async fn procedure_scenario_rolls_back() -> Result<(), Box<dyn std::error::Error>> {
    let (journal, outcome) =
        procedure_scenario("scripted://scenario-rollback?rows=3&zero_on=delete_all_other_users")
            .await?;
    assert_eq!(outcome, Some(TransactionState::RolledBack));

    assert_eq!(journal.count(&ScriptedEvent::RolledBack), 1);
    assert_eq!(journal.count(&ScriptedEvent::Committed), 0);
    assert_eq!(journal.count(&ScriptedEvent::Closed), 1);
    Ok(())
}

#[tokio::test]
async fn procedure_scenario_fault_abandons_the_transaction() -> Result<(), Box<dyn std::error::Error>> {
    let (journal, outcome) =
        procedure_scenario("scripted://scenario-fault?rows=3&fail_on=delete_all_other_users")
            .await?;
    // the fault closed the connection, so the rollback had nothing left to do
    assert_eq!(outcome, Some(TransactionState::Abandoned));

    assert_eq!(journal.count(&ScriptedEvent::Committed), 0);
    assert_eq!(journal.count(&ScriptedEvent::RolledBack), 0);
    assert_eq!(journal.count(&ScriptedEvent::Closed), 1);
    Ok(())
}

#[tokio::test]
async fn dispose_abandons_an_open_transaction() -> Result<(), Box<dyn std::error::Error>> {
    let (journal, outcome) =
        procedure_scenario("scripted://scenario-abandon?rows=3&zero_on=save_user_nickname").await?;
    assert_eq!(outcome, Some(TransactionState::Active));

    assert_eq!(journal.commands().len(), 2);
    assert_eq!(journal.count(&ScriptedEvent::Committed), 0);
    assert_eq!(journal.count(&ScriptedEvent::RolledBack), 0);
    assert_eq!(journal.count(&ScriptedEvent::Closed), 1);
    Ok(())
}

#[tokio::test]
async fn prepared_statement_truth_table() -> Result<(), Box<dyn std::error::Error>> {
    let one_param = || vec![DbParameter::input("id", RowValues::Int(1))];

    // (prepared policy as `Some(require_parameters)`, parameters, kind, expected prepared)
    let cases = [
        (None, Some(one_param()), CommandKind::Text, false),
        (Some(true), None, CommandKind::Text, false),
        (Some(true), Some(one_param()), CommandKind::Text, true),
        (Some(false), None, CommandKind::Text, true),
        (Some(false), Some(one_param()), CommandKind::Text, true),
        (Some(false), Some(one_param()), CommandKind::StoredProcedure, false),
    ];

    for (i, (policy, parameters, kind, expected)) in cases.into_iter().enumerate() {
        let mut builder = ScriptedBuilder::new(format!("scripted://prepared-{i}"), false)?
            .with_command_type(kind)?;
        if let Some(require_parameters) = policy {
            builder = builder.with_prepared_statement_requiring(require_parameters);
        }
        let builder = match parameters {
            Some(parameters) => builder.with_parameters(parameters)?,
            None => builder,
        };
        let mut execution = builder.build().await?;
        execution.execute("UPDATE users SET age = age + 1").await?;

        let record = journal_of(&execution).await.last_command().expect("command");
        assert_eq!(record.prepared, expected, "case {i}");
    }
    Ok(())
}

#[tokio::test]
async fn timeout_is_applied_to_every_command() -> Result<(), Box<dyn std::error::Error>> {
    for (seconds, expected) in [(None, DEFAULT_COMMAND_TIMEOUT_SECS), (Some(0), 0), (Some(45), 45)] {
        let mut builder = ScriptedBuilder::new("scripted://timeouts", false)?;
        if let Some(seconds) = seconds {
            builder = builder.with_timeout(seconds)?;
        }
        let mut execution = builder.build().await?;
        execution.execute("UPDATE users SET age = 1").await?;
        let _ = execution.read("SELECT * FROM users", User::from_row).await?;

        let journal = journal_of(&execution).await;
        assert!(journal.commands().iter().all(|c| c.timeout == expected));
    }

    let err = ScriptedBuilder::new("scripted://timeouts", false)?
        .with_timeout(-5)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OutOfRange);
    Ok(())
}

#[tokio::test]
async fn empty_results_and_zero_rows_affected() -> Result<(), Box<dyn std::error::Error>> {
    let mut execution = ScriptedBuilder::new("scripted://empty?empty_on=get_nobody&zero_on=touch_nobody", false)?
        .build()
        .await?;

    assert!(!execution.execute("touch_nobody").await?);
    assert!(execution.read("get_nobody", User::from_row).await?.is_none());
    assert_eq!(execution.read_first("get_nobody", User::from_row).await?, User::default());
    assert_eq!(
        execution
            .read_first_with("get_nobody", None::<ParameterSet>, User::from_row)
            .await?,
        User::default()
    );

    let first = execution.read_first("get_somebody", User::from_row).await?;
    assert_eq!(first.name, "user0");
    Ok(())
}

#[tokio::test]
async fn driver_fault_closes_connection_and_carries_code() -> Result<(), Box<dyn std::error::Error>> {
    let mut execution = ScriptedBuilder::new("scripted://fault?fail_on=explode&fail_code=40001", false)?
        .with_transaction()?
        .build()
        .await?;
    let journal = journal_of(&execution).await;

    let err = execution.execute("explode").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Database);
    assert_eq!(err.vendor_code(), Some("40001"));
    match &err {
        SqlFluentError::DatabaseError { vendor, .. } => assert_eq!(*vendor, DriverKind::Scripted),
        other => panic!("unexpected error {other:?}"),
    }

    assert!(!execution.is_connected());
    assert_eq!(journal.count(&ScriptedEvent::Closed), 1);
    assert_eq!(execution.transaction_state(), Some(TransactionState::Abandoned));
    // nothing to commit on an abandoned transaction
    execution.commit().await?;
    assert_eq!(journal.count(&ScriptedEvent::Committed), 0);

    execution.open().await?;
    assert!(execution.is_connected());
    assert!(execution.execute("UPDATE users SET age = 1").await?);
    Ok(())
}

#[tokio::test]
async fn prepare_fault_is_translated() -> Result<(), Box<dyn std::error::Error>> {
    let mut execution = ScriptedBuilder::new("scripted://prepare-fault?prepare_fault=true", false)?
        .with_prepared_statement_requiring(false)
        .build()
        .await?;
    let err = execution.execute("UPDATE users SET age = 1").await.unwrap_err();
    assert_eq!(err.vendor_code(), Some("26000"));
    assert!(!execution.is_connected());
    Ok(())
}

#[tokio::test]
async fn mapper_error_type_is_preserved() -> Result<(), Box<dyn std::error::Error>> {
    #[derive(Debug)]
    enum LookupError {
        Database(SqlFluentError),
        TooYoung(i64),
    }
    impl From<SqlFluentError> for LookupError {
        fn from(e: SqlFluentError) -> Self {
            LookupError::Database(e)
        }
    }

    let mut execution = ScriptedBuilder::new("scripted://mapper?rows=2", false)?
        .build()
        .await?;
    let result: Result<Option<Vec<User>>, LookupError> = execution
        .read("get_all_users", |row| -> Result<User, LookupError> {
            let user = User::from_row(row)?;
            if user.age < 21 {
                return Err(LookupError::TooYoung(user.age));
            }
            Ok(user)
        })
        .await;
    assert!(matches!(result, Err(LookupError::TooYoung(20))));

    let result: Result<Option<Vec<User>>, LookupError> = execution
        .read("   ", |row| -> Result<User, LookupError> { Ok(User::from_row(row)?) })
        .await;
    assert!(matches!(result, Err(LookupError::Database(e)) if e.kind() == ErrorKind::InvalidArgument));

    // a mapper failure leaves the connection alone
    assert!(execution.is_connected());
    Ok(())
}

#[tokio::test]
async fn post_build_reconfiguration() -> Result<(), Box<dyn std::error::Error>> {
    let mut execution = ScriptedBuilder::new("scripted://reconfigure", false)?
        .with_parameters([DbParameter::input("a", RowValues::Int(1))])?
        .build()
        .await?;
    let journal = journal_of(&execution).await;

    execution.execute("first").await?;
    execution.clear_parameters().execute("second").await?;
    execution
        .with_command_type(CommandKind::StoredProcedure)?
        .with_parameters(vec![DbParameter::positional(RowValues::Bool(true))])?
        .execute("third")
        .await?;

    let commands = journal.commands();
    assert_eq!(commands[0].parameters.len(), 1);
    assert!(commands[1].parameters.is_empty());
    assert_eq!(commands[2].kind, CommandKind::StoredProcedure);
    assert_eq!(commands[2].parameters[0].value, RowValues::Bool(true));

    let err = execution
        .with_command_type(CommandKind::TableDirect)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsupportedOperation);
    let err = execution.with_parameters(None::<Vec<DbParameter>>).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    Ok(())
}

#[tokio::test]
async fn async_mapper_and_configured_command() -> Result<(), Box<dyn std::error::Error>> {
    let mut execution = ScriptedBuilder::new("scripted://async-map?rows=2", false)?
        .with_command("get_all_users", CommandKind::Text)?
        .build()
        .await?;

    let ages = execution
        .read_async_map("get_all_users", |row| async move {
            tokio::task::yield_now().await;
            Ok::<_, SqlFluentError>(User::from_row(&row)?.age)
        })
        .await?;
    assert_eq!(ages, Some(vec![20, 21]));

    let first_age = execution
        .read_first_async_map("get_all_users", |row| async move {
            Ok::<_, SqlFluentError>(User::from_row(&row)?.age)
        })
        .await?;
    assert_eq!(first_age, 20);

    let users = execution.read_command(User::from_row).await?;
    assert_eq!(users.map(|u| u.len()), Some(2));
    let first = execution.read_first_command(User::from_row).await?;
    assert_eq!(first.id, 0);
    assert!(execution.execute_command().await?);
    Ok(())
}

#[tokio::test]
async fn pooled_builders_share_one_connection() -> Result<(), Box<dyn std::error::Error>> {
    let _guard = POOLED.lock().await;
    let registry = ConnectionRegistry::global();
    registry.reset::<ScriptedVendor>();

    let first = ScriptedBuilder::new("scripted://pooled-shared", true)?;
    let second = ScriptedBuilder::new("scripted://pooled-ignored", true)?;
    assert!(first.is_pooled() && second.is_pooled());
    assert!(Arc::ptr_eq(
        &first.connection().expect("first"),
        &second.connection().expect("second")
    ));
    assert_eq!(construction_count("scripted://pooled-shared"), 1);
    assert_eq!(construction_count("scripted://pooled-ignored"), 0);
    assert_eq!(
        registry.connection_string::<ScriptedVendor>().as_deref(),
        Some("scripted://pooled-shared")
    );

    let mut a = first.build().await?;
    let mut b = second.build().await?;
    let journal = journal_of(&a).await;
    assert_eq!(journal.count(&ScriptedEvent::Opened), 1);

    a.dispose();
    assert_eq!(journal.count(&ScriptedEvent::Closed), 0);
    assert!(b.is_connected());
    assert!(b.execute("UPDATE users SET age = 1").await?);

    b.dispose();
    assert_eq!(journal.count(&ScriptedEvent::Closed), 1);
    assert!(registry.get::<ScriptedVendor>().is_some());

    // a transient fault while creating the shared connection falls back to an exclusive one
    registry.reset::<ScriptedVendor>();
    let flaky = "scripted://pooled-flaky?transient_construct=1";
    let builder = ScriptedBuilder::new(flaky, true)?;
    assert!(!builder.is_pooled());
    assert_eq!(construction_count(flaky), 2);
    assert!(registry.get::<ScriptedVendor>().is_none());

    // a permanent one does not retry
    let fatal = "scripted://pooled-fatal?fatal_construct=true";
    let err = ScriptedBuilder::new(fatal, true).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Connection);
    assert_eq!(construction_count(fatal), 1);
    assert!(registry.get::<ScriptedVendor>().is_none());

    registry.reset::<ScriptedVendor>();
    Ok(())
}

#[tokio::test]
async fn pooled_dispose_rolls_back_before_the_next_use() -> Result<(), Box<dyn std::error::Error>> {
    let _guard = POOLED.lock().await;
    let registry = ConnectionRegistry::global();
    registry.reset::<ScriptedVendor>();

    let mut writer = ScriptedBuilder::new("scripted://pooled-abandon", true)?
        .with_transaction()?
        .build()
        .await?;
    let mut other = ScriptedBuilder::new("scripted://pooled-abandon", true)?
        .build()
        .await?;
    let journal = journal_of(&writer).await;
    assert!(writer.execute("UPDATE users SET age = 2").await?);

    // inside a runtime the rollback waits for the connection's next use
    writer.dispose();
    assert_eq!(journal.count(&ScriptedEvent::RolledBack), 0);
    assert_eq!(journal.count(&ScriptedEvent::Closed), 0);

    assert!(other.execute("UPDATE users SET age = 3").await?);
    assert_eq!(journal.count(&ScriptedEvent::RolledBack), 1);
    {
        let shared = other.connection().expect("connection");
        assert!(!shared.lock().await.in_transaction());
    }

    // a fresh pooled transaction can begin on the same connection
    let mut next = ScriptedBuilder::new("scripted://pooled-abandon", true)?
        .with_transaction()?
        .build()
        .await?;
    assert_eq!(next.transaction_state(), Some(TransactionState::Active));
    next.commit().await?;
    assert_eq!(journal.count(&ScriptedEvent::Began), 2);
    assert_eq!(journal.count(&ScriptedEvent::Committed), 1);
    assert_eq!(journal.count(&ScriptedEvent::RolledBack), 1);

    next.dispose();
    other.dispose();
    assert_eq!(journal.count(&ScriptedEvent::Closed), 1);
    registry.reset::<ScriptedVendor>();
    Ok(())
}

#[test]
fn pooled_dispose_rolls_back_at_once_outside_a_runtime() -> Result<(), Box<dyn std::error::Error>> {
    let _guard = POOLED.blocking_lock();
    let registry = ConnectionRegistry::global();
    registry.reset::<ScriptedVendor>();

    let mut writer = ScriptedBuilder::new("scripted://pooled-blocking", true)?
        .with_transaction()?
        .build_blocking()?;
    let mut other = ScriptedBuilder::new("scripted://pooled-blocking", true)?.build_blocking()?;
    let shared = writer.connection().expect("connection");
    let journal = shared.try_lock().expect("idle").journal();

    writer.dispose();
    assert_eq!(journal.count(&ScriptedEvent::RolledBack), 1);
    assert!(!shared.try_lock().expect("idle").in_transaction());

    // the rollback is not repeated on the next use
    assert!(other.execute_blocking("UPDATE users SET age = 4")?);
    assert_eq!(journal.count(&ScriptedEvent::RolledBack), 1);

    other.dispose();
    registry.reset::<ScriptedVendor>();
    Ok(())
}

#[tokio::test]
async fn outside_connection_handles_do_not_keep_a_pooled_connection_open()
-> Result<(), Box<dyn std::error::Error>> {
    let _guard = POOLED.lock().await;
    let registry = ConnectionRegistry::global();
    registry.reset::<ScriptedVendor>();

    let mut a = ScriptedBuilder::new("scripted://pooled-handles", true)?.build().await?;
    let mut b = ScriptedBuilder::new("scripted://pooled-handles", true)?.build().await?;
    let kept_a = a.connection().expect("a");
    let kept_b = b.connection().expect("b");
    let from_registry = registry.get::<ScriptedVendor>().expect("entry");
    let journal = journal_of(&a).await;

    a.dispose();
    assert_eq!(journal.count(&ScriptedEvent::Closed), 0);
    b.dispose();
    assert_eq!(journal.count(&ScriptedEvent::Closed), 1);
    assert_eq!(kept_b.lock().await.state(), ConnectionState::Closed);
    drop((kept_a, from_registry));

    registry.reset::<ScriptedVendor>();
    Ok(())
}
