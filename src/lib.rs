//! Ledger to document-store synchronization for the relief distribution platform.
//!
//! Contract events are read from a ledger event gateway, decoded into typed domain events and
//! projected idempotently into a document store. A [`SyncOrchestrator`](sync::SyncOrchestrator)
//! owned by the host drives historical backfill and live subscriptions.

pub mod config;
pub mod domain;
mod error;
pub mod ledger;
pub mod projection;
pub mod sync;
pub mod utils;

pub use error::SyncError;
