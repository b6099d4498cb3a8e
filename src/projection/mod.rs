//! Projection of domain events into the document store.

/// Typed document shapes
pub mod documents;
/// In-memory store with JSON snapshots
mod memory_store;
/// Per-event handlers
mod mutator;
/// Store contract
mod store;

pub use memory_store::MemoryStore;
pub use mutator::{ApplyOutcome, ProjectionMutator, ProjectionWriteError};
pub use store::*;
