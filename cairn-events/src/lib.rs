//! cairn Events - Durable Log Contract and Event Log Facade
//!
//! This crate defines how mutation events reach durable storage and how they
//! are fanned out to the engines that materialize them.
//!
//! # Architecture
//!
//! ```text
//! writer ─▶ EventLog::push ─▶ LogDriver::append/delete ─▶ EventSubscriber::on_event
//!                 ▲
//!   startup ──────┘ LogDriver::replay (sorted by identifier)
//! ```
//!
//! # Traits
//!
//! - `LogDriver`: durable log collaborator (append, delete, replay)
//! - `EventSubscriber`: receiver of fanned-out events

mod driver;
mod store;
mod subscriber;

pub use driver::{InMemoryLogDriver, LogDriver};
pub use store::{EventLog, EventLogOptions, MIGRATION_PASSES};
pub use subscriber::EventSubscriber;

// Re-export core types for convenience
pub use cairn_core::{
    EventFilter, EventType, Format, Identifier, LifecycleState, MutationEvent, ReloadEvent,
    StateChangeEvent, StoreEvent,
};
