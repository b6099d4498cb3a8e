//! Ledger integration module
//!
//! This module provides the read-only client contract for the relief contract's event log, the
//! GraphQL gateway client implementing it, and an in-process ledger for embedding and tests.

/// Ledger client trait and GraphQL gateway client
mod client;
/// In-process ledger
pub mod memory;
/// Type definitions for ledger data structures
mod types;

pub use client::{GraphqlLedgerClient, LedgerClient, LogStream};
pub use memory::MemoryLedger;
pub use types::*;
