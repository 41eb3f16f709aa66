use thiserror::Error;

use crate::types::DriverKind;

/// Boxed cause carried by connection and database errors.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum SqlFluentError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Out of range: {0}")]
    OutOfRange(String),

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Connection error: {message}")]
    ConnectionError {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("Prepared statement error: {0}")]
    PreparationError(String),

    #[error("Database error ({vendor}{}): {message}", .code.as_deref().map(|c| format!(", code {c}")).unwrap_or_default())]
    DatabaseError {
        vendor: DriverKind,
        code: Option<String>,
        message: String,
        #[source]
        source: BoxError,
    },
}

/// Discriminant of [`SqlFluentError`], handy for matching without destructuring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    InvalidState,
    OutOfRange,
    UnsupportedOperation,
    Configuration,
    Connection,
    Preparation,
    Database,
}

impl SqlFluentError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            SqlFluentError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            SqlFluentError::InvalidState(_) => ErrorKind::InvalidState,
            SqlFluentError::OutOfRange(_) => ErrorKind::OutOfRange,
            SqlFluentError::UnsupportedOperation(_) => ErrorKind::UnsupportedOperation,
            SqlFluentError::ConfigError(_) => ErrorKind::Configuration,
            SqlFluentError::ConnectionError { .. } => ErrorKind::Connection,
            SqlFluentError::PreparationError(_) => ErrorKind::Preparation,
            SqlFluentError::DatabaseError { .. } => ErrorKind::Database,
        }
    }

    /// Vendor error code (SQLSTATE, SQLite extended code, SQL Server error number).
    #[must_use]
    pub fn vendor_code(&self) -> Option<&str> {
        match self {
            SqlFluentError::DatabaseError { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    /// Build a `DatabaseError` out of a vendor fault.
    pub fn database<F: crate::driver::VendorFault>(vendor: DriverKind, fault: F) -> Self {
        SqlFluentError::DatabaseError {
            vendor,
            code: fault.code(),
            message: fault.to_string(),
            source: Box::new(fault),
        }
    }

    pub fn connection(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        SqlFluentError::ConnectionError {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// True for the errors raised before any I/O happens.
    #[must_use]
    pub fn is_configuration_misuse(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::InvalidArgument
                | ErrorKind::InvalidState
                | ErrorKind::OutOfRange
                | ErrorKind::UnsupportedOperation
                | ErrorKind::Configuration
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("relation \"users\" does not exist")]
    struct FakeFault;

    impl crate::driver::VendorFault for FakeFault {
        fn code(&self) -> Option<String> {
            Some("42P01".to_string())
        }

        fn is_transient(&self) -> bool {
            false
        }
    }

    #[test]
    fn database_error_keeps_code_and_cause() {
        let err = SqlFluentError::database(DriverKind::Postgres, FakeFault);
        assert_eq!(err.kind(), ErrorKind::Database);
        assert_eq!(err.vendor_code(), Some("42P01"));
        assert!(!err.is_configuration_misuse());
        assert_eq!(
            err.to_string(),
            "Database error (postgres, code 42P01): relation \"users\" does not exist"
        );
        let source = std::error::Error::source(&err).expect("cause kept");
        assert!(source.downcast_ref::<FakeFault>().is_some());
    }

    #[test]
    fn misuse_errors_are_flagged() {
        assert!(SqlFluentError::OutOfRange("timeout".into()).is_configuration_misuse());
        assert!(
            !SqlFluentError::PreparationError("not prepared".into()).is_configuration_misuse()
        );
    }
}
