use std::time::Duration;

use thiserror::Error;

/// Expected, recoverable outcomes of registry operations
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A required field is missing or malformed
    #[error("invalid {field}: {message}")]
    Validation {
        field: &'static str,
        message: String,
    },

    /// No record exists for the requested vehicle
    #[error("vehicle {id} not found")]
    NotFound { id: String },

    /// The vehicle reported again before the minimum update interval elapsed
    #[error("vehicle {id} is updating too fast, retry in {}ms", retry_after.as_millis())]
    RateLimited { id: String, retry_after: Duration },
}

impl RegistryError {
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            field,
            message: message.into(),
        }
    }

    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }
}

/// Failure of the durable mirror. Never fatal: callers log it and keep the
/// in-memory registry authoritative.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("database error during {operation}")]
    Database {
        operation: &'static str,
        #[source]
        source: sqlx::Error,
    },

    #[error("{operation} timed out after {}ms", after.as_millis())]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
}

impl PersistenceError {
    /// Adapter for `map_err` that tags a sqlx error with the failed operation
    pub fn database(operation: &'static str) -> impl FnOnce(sqlx::Error) -> Self {
        move |source| Self::Database { operation, source }
    }
}
