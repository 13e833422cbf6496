//! Error types for cairn operations

use crate::{EventType, Identifier};
use thiserror::Error;

/// Value encoding errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Malformed {format} payload for {identifier}: {reason}")]
    Malformed {
        identifier: Identifier,
        format: String,
        reason: String,
    },

    #[error("Middleware {stage} failed for {identifier}: {reason}")]
    Middleware {
        stage: String,
        identifier: Identifier,
        reason: String,
    },

    #[error("Unresolved placeholder {placeholder} in {identifier}")]
    UnresolvedPlaceholder {
        identifier: Identifier,
        placeholder: String,
    },

    #[error("Cannot bind document for {identifier}: {reason}")]
    Binding { identifier: Identifier, reason: String },

    #[error("Serialization failed: {reason}")]
    Serialization { reason: String },
}

/// Validation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    RequiredFieldMissing { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Constraint violation on {constraint}: {reason}")]
    ConstraintViolation { constraint: String, reason: String },
}

/// Path template errors, raised when patterns are compiled.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PatternError {
    #[error("Path template {template} is missing the {{{group}}} placeholder")]
    MissingGroup { template: String, group: String },

    #[error("Invalid path template {template}: {reason}")]
    InvalidTemplate { template: String, reason: String },
}

/// Durable log errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LogError {
    #[error("I/O failure on {location}: {reason}")]
    Io { location: String, reason: String },

    #[error("Replay failed: {reason}")]
    ReplayFailed { reason: String },

    #[error("Event {event_type}:{identifier} cannot be persisted: {reason}")]
    Rejected {
        event_type: EventType,
        identifier: Identifier,
        reason: String,
    },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Configuration parse error: {reason}")]
    Parse { reason: String },
}

/// Master error type for all cairn errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Pattern error: {0}")]
    Pattern(#[from] PatternError),

    #[error("Log error: {0}")]
    Log(#[from] LogError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store is read-only, rejected {operation}")]
    ReadOnly { operation: String },

    #[error("Identifier mismatch: location says {expected}, document says {found}")]
    IdentifierMismatch { expected: Identifier, found: String },

    #[error("Store is not listening yet")]
    NotReady,

    #[error("Pending write for {identifier} was abandoned before its event was applied")]
    WriteAbandoned { identifier: Identifier },
}

impl StoreError {
    /// Whether this error means the record was dropped rather than failed.
    pub fn is_dropped_record(&self) -> bool {
        matches!(self, StoreError::IdentifierMismatch { .. })
    }
}

/// Result type alias for cairn operations.
pub type StoreResult<T> = Result<T, StoreError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn ident() -> Identifier {
        Identifier::new(["providers"], "svc1")
    }

    #[test]
    fn test_decode_error_display_malformed() {
        let err = DecodeError::Malformed {
            identifier: ident(),
            format: "yml".to_string(),
            reason: "unexpected token".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Malformed yml payload"));
        assert!(msg.contains("providers/svc1"));
        assert!(msg.contains("unexpected token"));
    }

    #[test]
    fn test_pattern_error_display_missing_group() {
        let err = PatternError::MissingGroup {
            template: "{type}/{id}".to_string(),
            group: "path".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("{type}/{id}"));
        assert!(msg.contains("{path}"));
    }

    #[test]
    fn test_log_error_display_io() {
        let err = LogError::Io {
            location: "entities/providers/svc1.yml".to_string(),
            reason: "disk full".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("I/O failure"));
        assert!(msg.contains("disk full"));
    }

    #[test]
    fn test_read_only_display() {
        let err = StoreError::ReadOnly {
            operation: "append".to_string(),
        };
        assert!(format!("{}", err).contains("read-only"));
    }

    #[test]
    fn test_store_error_from_variants() {
        let decode = StoreError::from(DecodeError::Serialization {
            reason: "bad".to_string(),
        });
        assert!(matches!(decode, StoreError::Decode(_)));

        let validation = StoreError::from(ValidationError::RequiredFieldMissing {
            field: "url".to_string(),
        });
        assert!(matches!(validation, StoreError::Validation(_)));

        let pattern = StoreError::from(PatternError::InvalidTemplate {
            template: "{".to_string(),
            reason: "unclosed".to_string(),
        });
        assert!(matches!(pattern, StoreError::Pattern(_)));

        let log = StoreError::from(LogError::ReplayFailed {
            reason: "gone".to_string(),
        });
        assert!(matches!(log, StoreError::Log(_)));

        let config = StoreError::from(ConfigError::MissingRequired {
            field: "root".to_string(),
        });
        assert!(matches!(config, StoreError::Config(_)));
    }

    #[test]
    fn test_identifier_mismatch_is_dropped_record() {
        let err = StoreError::IdentifierMismatch {
            expected: ident(),
            found: "svc2".to_string(),
        };
        assert!(err.is_dropped_record());
        assert!(!StoreError::NotReady.is_dropped_record());
    }
}
