use crate::driver::Vendor;
use crate::error::SqlFluentError;

/// Generic environment key, used when the vendor-specific key is unset.
pub const CONNECTION_STRING_ENV: &str = "DB_CONNECTION";

/// Default command timeout in seconds.
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u32 = 30;

/// Affected-row count at or above which `execute` reports success.
pub const NON_QUERY_SUCCESS_THRESHOLD: u64 = 1;

/// Resolve the connection string for `V` from the environment.
///
/// The vendor key (`V::CONNECTION_STRING_ENV`) wins; the generic `DB_CONNECTION` is the
/// fallback. Empty values count as unset.
///
/// # Errors
/// Returns `SqlFluentError::ConfigError` if neither key holds a value.
pub fn connection_string_from_env<V: Vendor>() -> Result<String, SqlFluentError> {
    lookup(V::CONNECTION_STRING_ENV)
        .or_else(|| lookup(CONNECTION_STRING_ENV))
        .ok_or_else(|| {
            SqlFluentError::ConfigError(format!(
                "no {} connection string: set {} or {}",
                V::KIND,
                V::CONNECTION_STRING_ENV,
                CONNECTION_STRING_ENV
            ))
        })
}

fn lookup(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}
