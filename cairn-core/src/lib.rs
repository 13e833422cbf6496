//! cairn Core - Identifiers, Events and Errors
//!
//! Shared vocabulary of the cairn store: how records are addressed, what an
//! event looks like, how failures are reported and how the store is
//! configured. Every other crate depends on this one.

mod config;
mod diagnostic;
mod document;
mod error;
mod event;
mod filter;
mod identifier;

use chrono::{DateTime, Utc};

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

pub use config::{StoreConfig, DEFAULT_PATH_PATTERN};
pub use diagnostic::{CollectingDiagnostics, DiagnosticEvent, DiagnosticSink, TracingDiagnostics};
pub use document::{get_path, is_empty_document, merge_patch, Document, DocumentMap};
pub use error::{
    ConfigError, DecodeError, LogError, PatternError, StoreError, StoreResult, ValidationError,
};
pub use event::{
    EventType, Format, LifecycleState, MutationEvent, ReloadEvent, StateChangeEvent, StoreEvent,
};
pub use filter::{glob_match, EventFilter};
pub use identifier::Identifier;
