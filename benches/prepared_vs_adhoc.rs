//! Criterion comparison of single-row lookups through an `SqliteExecution`, with and
//! without prepared statements. Both variants hit the same in-memory dataset so the
//! numbers reflect statement compilation rather than storage.

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use sql_fluent::prelude::*;
use std::sync::LazyLock;
use tokio::runtime::Runtime;

// Dedicated runtime for the async execution path.
static TOKIO_RUNTIME: LazyLock<Runtime> =
    LazyLock::new(|| Runtime::new().expect("create tokio runtime"));

/// Resolve how many lookups each iteration should perform.
fn lookup_count() -> i64 {
    std::env::var("BENCH_LOOKUPS")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(500)
}

/// Seeded in-memory execution, optionally preparing every command.
async fn seeded_execution(prepared: bool, rows: i64) -> SqliteExecution {
    let mut builder = SqliteBuilder::new(":memory:", false).expect("builder");
    if prepared {
        builder = builder.with_prepared_statement();
    }
    let mut execution = builder.build().await.expect("build");
    execution
        .execute("CREATE TABLE test (id INTEGER PRIMARY KEY, name TEXT NOT NULL, score INTEGER)")
        .await
        .expect("create table");
    execution
        .execute(&format!(
            "WITH RECURSIVE seq(n) AS (SELECT 1 UNION ALL SELECT n + 1 FROM seq WHERE n < {rows}) \
             INSERT INTO test (id, name, score) SELECT n, 'name_' || n, n * 7 FROM seq"
        ))
        .await
        .expect("seed rows");
    execution
}

fn score(row: &CustomDbRow) -> Result<i64, SqlFluentError> {
    Ok(row.get("score").and_then(RowValues::as_int).copied().unwrap_or_default())
}

fn bench_lookups(c: &mut Criterion) {
    let lookups = lookup_count();
    let mut group = c.benchmark_group("sqlite_single_row_lookup");
    group.throughput(Throughput::Elements(u64::try_from(lookups).unwrap_or(0)));

    for (label, prepared) in [("adhoc", false), ("prepared", true)] {
        group.bench_with_input(BenchmarkId::new(label, lookups), &lookups, |b, &lookups| {
            b.to_async(&*TOKIO_RUNTIME).iter_custom(|iters| async move {
                let mut execution = seeded_execution(prepared, lookups).await;
                let start = std::time::Instant::now();
                for _ in 0..iters {
                    for id in 1..=lookups {
                        execution
                            .with_parameters([DbParameter::positional(RowValues::Int(id))])
                            .expect("parameters");
                        let value = execution
                            .read_first("SELECT score FROM test WHERE id = ?1", score)
                            .await
                            .expect("lookup");
                        black_box(value);
                    }
                }
                start.elapsed()
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_lookups);
criterion_main!(benches);
