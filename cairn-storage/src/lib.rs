//! cairn Storage - Cache Engine, Value Encoding and Layering
//!
//! Materializes the event log into typed in-memory views and layers
//! defaults and overrides on top of them. The durable side lives in
//! `cairn-events`; the directory-backed driver lives here because it needs
//! the path patterns and codecs.

pub mod cache;
pub mod directory;
pub mod encoding;
pub mod layering;
pub mod path_pattern;

pub use cache::{
    CacheChange, CacheEngine, CacheEngineBuilder, CachedValue, ChangeKind, EntityStore,
    EventProcessor, IdentifierIndex, PendingWrite, ScopedStore, Validator,
};
pub use directory::DirectoryLogDriver;
pub use encoding::{
    AdditionalEvents, DecodeContext, DecodeRequest, Decoded, DecoderMiddleware, ValueEncoding,
};
pub use layering::{
    DefaultsStore, EntitySchema, FieldSpec, KeyAliases, LayeredStore, LayeredStoreBuilder,
    MigratedRecord, Migration, MigrationMiddleware, SchemaRegistry,
};
pub use path_pattern::{ParsedPath, PathPattern, PathPatterns};

// Re-export core types for convenience
pub use cairn_core::{
    Document, DocumentMap, EventType, Format, Identifier, MutationEvent, StoreConfig, StoreError,
    StoreResult,
};
pub use cairn_events::{EventLog, EventLogOptions, InMemoryLogDriver, LogDriver};
