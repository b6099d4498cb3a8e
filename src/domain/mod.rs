//! Domain events and their decoding from raw ledger logs.

/// Token amounts in base units
mod amount;
/// Raw log to domain event decoding
pub mod decoder;
/// Typed domain events, addresses and idempotency keys
mod events;

pub use amount::{Amount, AmountParseError};
pub use decoder::{DecodeError, decode};
pub use events::*;
