// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for mockcloud-core.
//!
//! Provides a unified error type for persistence operations. Unique-key
//! violations are surfaced as their own variant so callers can treat a lost
//! insert race as an expected outcome rather than a failure.

use std::fmt;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors returned by the persistence layer.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum CoreError {
    /// A record was not found.
    NotFound {
        /// Kind of record (environment, queue, table, ...).
        entity: String,
        /// The identifier that was looked up.
        id: String,
    },

    /// A record with the same key already exists.
    AlreadyExists {
        /// Kind of record.
        entity: String,
        /// The conflicting identifier.
        id: String,
    },

    /// An insert or update violated a unique constraint.
    UniqueViolation {
        /// Driver message naming the constraint.
        details: String,
    },

    /// A record is in the wrong state for the requested operation.
    InvalidState {
        /// Kind of record.
        entity: String,
        /// The record identifier.
        id: String,
        /// The expected state.
        expected: String,
        /// The actual state.
        actual: String,
    },

    /// Input validation failed.
    ValidationError {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// Database operation failed.
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Shorthand for [`CoreError::NotFound`].
    pub fn not_found(entity: &str, id: &str) -> Self {
        Self::NotFound {
            entity: entity.to_string(),
            id: id.to_string(),
        }
    }

    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "NOT_FOUND",
            Self::AlreadyExists { .. } => "ALREADY_EXISTS",
            Self::UniqueViolation { .. } => "UNIQUE_VIOLATION",
            Self::InvalidState { .. } => "INVALID_STATE",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
        }
    }

    /// Whether this error is a unique-key violation.
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, Self::UniqueViolation { .. })
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { entity, id } => {
                write!(f, "{} '{}' not found", entity, id)
            }
            Self::AlreadyExists { entity, id } => {
                write!(f, "{} '{}' already exists", entity, id)
            }
            Self::UniqueViolation { details } => {
                write!(f, "Unique constraint violated: {}", details)
            }
            Self::InvalidState {
                entity,
                id,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "{} '{}' is in invalid state: expected '{}', got '{}'",
                    entity, id, expected, actual
                )
            }
            Self::ValidationError { field, message } => {
                write!(f, "Validation error for '{}': {}", field, message)
            }
            Self::DatabaseError { operation, details } => {
                write!(f, "Database error during '{}': {}", operation, details)
            }
        }
    }
}

impl std::error::Error for CoreError {}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        if let Some(db) = err.as_database_error()
            && db.is_unique_violation()
        {
            return CoreError::UniqueViolation {
                details: db.message().to_string(),
            };
        }
        CoreError::DatabaseError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::DatabaseError {
            operation: "json".to_string(),
            details: err.to_string(),
        }
    }
}
