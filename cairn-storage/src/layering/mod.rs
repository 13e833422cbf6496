//! Defaults and overrides layering.
//!
//! # Modules
//!
//! - `defaults`: type-level and subtype defaults, entity schemas
//! - `diff`: merge, subtraction, diff and alias alignment of documents
//! - `migration`: storage schema upgrades during decode
//! - `overrides`: relocation of override records onto their owners
//! - `store`: [`LayeredStore`], composing the above over one event log

mod defaults;
mod diff;
mod migration;
mod overrides;
mod store;

pub use defaults::{
    strip_placeholders, DefaultsFanOut, DefaultsStore, EntitySchema, FieldSpec, SchemaRegistry,
    PLACEHOLDER, TYPE_LEVEL_ID,
};
pub use diff::{
    align, diff, diff_aligned, merge_defaults, merge_diff, subtract_defaults, ChangeType,
    DocumentChange, KeyAliases,
};
pub use migration::{
    schema_version, MigratedRecord, Migration, MigrationMiddleware, SCHEMA_VERSION_FIELD,
};
pub use overrides::{
    override_identifier, override_key_path, take_at, value_at, OverrideIndex, OverrideRelocator,
};
pub use store::{LayeredStore, LayeredStoreBuilder};
