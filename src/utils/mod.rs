//!
//! Utility module for the sync service.
//!
//! Re-exports formatting helpers and the retry wrapper shared by ledger queries and projection
//! writes.
/// Utility functions for formatting and display
pub mod index;
/// Bounded exponential backoff for transient failures
pub mod retry;

pub use index::format_token_amount;
pub use retry::{Transient, retry_transient};
