//! Typed domain events decoded from contract logs.

use super::amount::Amount;
use crate::ledger::{EventKind, LogPosition};
use chrono::{DateTime, Utc};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

/// A ledger account reference.
///
/// `0x`-prefixed hex addresses are normalized to lowercase; any other non-empty identifier is kept
/// as given.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(String);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid address {0:?}: must not be empty")]
pub struct InvalidAddress(pub String);

impl Address {
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl FromStr for Address {
	type Err = InvalidAddress;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(InvalidAddress(s.to_string()));
		}

		let hex_bytes = s
			.strip_prefix("0x")
			.or_else(|| s.strip_prefix("0X"))
			.and_then(|digits| hex::decode(digits).ok())
			.filter(|bytes| !bytes.is_empty());
		match hex_bytes {
			Some(bytes) => Ok(Address(format!("0x{}", hex::encode(bytes)))),
			None => Ok(Address(s.to_string())),
		}
	}
}

impl TryFrom<String> for Address {
	type Error = InvalidAddress;

	fn try_from(value: String) -> Result<Self, Self::Error> {
		value.parse()
	}
}

impl From<Address> for String {
	fn from(address: Address) -> Self {
		address.0
	}
}

impl fmt::Display for Address {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// Deduplication key of one applied log: `"{transactionHash}:{logIndex}"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
	pub fn derive(transaction_hash: &str, log_index: u64) -> Self {
		IdempotencyKey(format!("{}:{}", transaction_hash, log_index))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for IdempotencyKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// Ledger metadata shared by every domain event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventMeta {
	pub kind: EventKind,
	pub block_number: u64,
	pub log_index: u64,
	pub transaction_hash: String,
	pub emitted_at: Option<DateTime<Utc>>,
}

impl EventMeta {
	pub fn key(&self) -> IdempotencyKey {
		IdempotencyKey::derive(&self.transaction_hash, self.log_index)
	}

	pub fn position(&self) -> LogPosition {
		LogPosition {
			block_number: self.block_number,
			log_index: self.log_index,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmergencyEventCreated {
	#[serde(deserialize_with = "domain_id")]
	pub event_id: String,
	pub name: String,
	#[serde(default)]
	pub location: Option<String>,
	pub target_funding: Amount,
	pub creator: Address,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FundsDistributed {
	pub beneficiary: Address,
	pub amount: Amount,
	#[serde(deserialize_with = "domain_id")]
	pub event_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FundsSpent {
	pub beneficiary: Address,
	pub vendor: Address,
	pub amount: Amount,
	#[serde(default, deserialize_with = "optional_domain_id")]
	pub event_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategorySpent {
	pub beneficiary: Address,
	pub vendor: Address,
	pub category: String,
	pub amount: Amount,
	#[serde(default, deserialize_with = "optional_domain_id")]
	pub event_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BeneficiaryWhitelisted {
	pub beneficiary: Address,
	#[serde(default, deserialize_with = "optional_domain_id")]
	pub event_id: Option<String>,
	#[serde(default = "whitelisted_by_default")]
	pub status: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VendorWhitelisted {
	pub vendor: Address,
	#[serde(default)]
	pub category: Option<String>,
	#[serde(default = "whitelisted_by_default")]
	pub status: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FundsDonated {
	pub donor: Address,
	pub amount: Amount,
	#[serde(default, deserialize_with = "optional_domain_id")]
	pub event_id: Option<String>,
}

fn whitelisted_by_default() -> bool {
	true
}

/// Event-specific payload. One variant per [`EventKind`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventPayload {
	EmergencyEventCreated(EmergencyEventCreated),
	FundsDistributed(FundsDistributed),
	FundsSpent(FundsSpent),
	CategorySpent(CategorySpent),
	BeneficiaryWhitelisted(BeneficiaryWhitelisted),
	VendorWhitelisted(VendorWhitelisted),
	FundsDonated(FundsDonated),
}

impl EventPayload {
	pub fn kind(&self) -> EventKind {
		match self {
			EventPayload::EmergencyEventCreated(_) => EventKind::EmergencyEventCreated,
			EventPayload::FundsDistributed(_) => EventKind::FundsDistributed,
			EventPayload::FundsSpent(_) => EventKind::FundsSpent,
			EventPayload::CategorySpent(_) => EventKind::CategorySpent,
			EventPayload::BeneficiaryWhitelisted(_) => EventKind::BeneficiaryWhitelisted,
			EventPayload::VendorWhitelisted(_) => EventKind::VendorWhitelisted,
			EventPayload::FundsDonated(_) => EventKind::FundsDonated,
		}
	}
}

/// A decoded ledger event. Ephemeral: decoded, applied, discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainEvent {
	pub meta: EventMeta,
	pub payload: EventPayload,
}

impl DomainEvent {
	pub fn kind(&self) -> EventKind {
		self.meta.kind
	}

	pub fn key(&self) -> IdempotencyKey {
		self.meta.key()
	}
}

/// Contract ids arrive either as uint256 numbers or strings.
struct DomainIdVisitor;

impl<'de> Visitor<'de> for DomainIdVisitor {
	type Value = String;

	fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.write_str("a non-empty string or non-negative integer id")
	}

	fn visit_u64<E: de::Error>(self, v: u64) -> Result<String, E> {
		Ok(v.to_string())
	}

	fn visit_i64<E: de::Error>(self, v: i64) -> Result<String, E> {
		if v < 0 {
			return Err(E::custom(format!("negative id {}", v)));
		}
		Ok(v.to_string())
	}

	fn visit_str<E: de::Error>(self, v: &str) -> Result<String, E> {
		let v = v.trim();
		if v.is_empty() {
			return Err(E::custom("empty id"));
		}
		Ok(v.to_string())
	}
}

fn domain_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
	deserializer.deserialize_any(DomainIdVisitor)
}

fn optional_domain_id<'de, D: Deserializer<'de>>(
	deserializer: D,
) -> Result<Option<String>, D::Error> {
	#[derive(Deserialize)]
	struct Wrapper(#[serde(deserialize_with = "domain_id")] String);

	let wrapper: Option<Wrapper> = Option::deserialize(deserializer)?;
	Ok(wrapper.map(|Wrapper(id)| id))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn addresses_are_normalized() {
		let address: Address = "0xAbCdEf0123456789aBcDeF0123456789AbCdEf01"
			.parse()
			.expect("valid address");
		assert_eq!(address.as_str(), "0xabcdef0123456789abcdef0123456789abcdef01");
	}

	#[test]
	fn non_hex_identifiers_are_kept_verbatim() {
		for input in ["B1", "vendor-7", "0xZZ", "0xabc"] {
			let address: Address = input.parse().expect("non-empty identifier");
			assert_eq!(address.as_str(), input);
		}
		let padded: Address = "  B1 ".parse().expect("trimmed");
		assert_eq!(padded.as_str(), "B1");
	}

	#[test]
	fn empty_addresses_are_rejected() {
		for input in ["", "   "] {
			assert!(input.parse::<Address>().is_err(), "{:?} should be rejected", input);
		}
	}

	#[test]
	fn idempotency_key_joins_hash_and_index() {
		assert_eq!(IdempotencyKey::derive("0xAA", 0).as_str(), "0xAA:0");
		assert_ne!(
			IdempotencyKey::derive("0xAA", 1),
			IdempotencyKey::derive("0xAA", 0)
		);
	}
}
