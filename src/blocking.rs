use std::future::Future;
use std::sync::LazyLock;

use tokio::runtime::{Builder as RuntimeBuilder, Handle, Runtime};

use crate::error::SqlFluentError;

// One worker is enough: blocking callers drive their own future through `block_on`, the
// worker only keeps spawned driver tasks (e.g. the Postgres connection) alive in between.
static BLOCKING_RUNTIME: LazyLock<std::io::Result<Runtime>> = LazyLock::new(|| {
    RuntimeBuilder::new_multi_thread()
        .worker_threads(1)
        .thread_name("sql-fluent-blocking")
        .enable_all()
        .build()
});

/// Drive `future` to completion on the crate's blocking runtime.
///
/// # Errors
/// Returns `SqlFluentError::InvalidState` when called from inside an async runtime (use the
/// async variant there), or if the blocking runtime could not be started.
pub(crate) fn run<F: Future>(future: F) -> Result<F::Output, SqlFluentError> {
    if Handle::try_current().is_ok() {
        return Err(SqlFluentError::InvalidState(
            "blocking call made from within an async runtime; use the async variant".to_string(),
        ));
    }
    let runtime = BLOCKING_RUNTIME.as_ref().map_err(|e| {
        SqlFluentError::InvalidState(format!("blocking runtime unavailable: {e}"))
    })?;
    Ok(runtime.block_on(future))
}
