//! Types for ledger event gateway integration

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Contract events this service projects into the document store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventKind {
	EmergencyEventCreated,
	FundsDistributed,
	FundsSpent,
	CategorySpent,
	BeneficiaryWhitelisted,
	VendorWhitelisted,
	FundsDonated,
}

impl EventKind {
	/// Every tracked kind, in the order backfill walks them.
	pub const ALL: [EventKind; 7] = [
		EventKind::EmergencyEventCreated,
		EventKind::FundsDistributed,
		EventKind::FundsSpent,
		EventKind::CategorySpent,
		EventKind::BeneficiaryWhitelisted,
		EventKind::VendorWhitelisted,
		EventKind::FundsDonated,
	];

	/// The event name as emitted by the contract.
	pub fn signature(&self) -> &'static str {
		match self {
			EventKind::EmergencyEventCreated => "EmergencyEventCreated",
			EventKind::FundsDistributed => "FundsDistributed",
			EventKind::FundsSpent => "FundsSpent",
			EventKind::CategorySpent => "CategorySpent",
			EventKind::BeneficiaryWhitelisted => "BeneficiaryWhitelisted",
			EventKind::VendorWhitelisted => "VendorWhitelisted",
			EventKind::FundsDonated => "FundsDonated",
		}
	}
}

impl fmt::Display for EventKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.signature())
	}
}

impl FromStr for EventKind {
	type Err = UnknownEventKind;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		EventKind::ALL
			.into_iter()
			.find(|kind| kind.signature() == s)
			.ok_or_else(|| UnknownEventKind(s.to_string()))
	}
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown event kind: {0}")]
pub struct UnknownEventKind(pub String);

/// Position of a log within the ledger. Ordering is (block, log index).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogPosition {
	pub block_number: u64,
	pub log_index: u64,
}

impl fmt::Display for LogPosition {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "block {} log {}", self.block_number, self.log_index)
	}
}

/// A log as delivered by the ledger, before decoding.
///
/// `args` holds the contract event arguments by name, as produced by the gateway's ABI layer.
/// Block numbers, log indexes and timestamps are accepted as JSON integers or as decimal or `0x`
/// hex strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawLog {
	/// The contract event name.
	pub event: String,
	#[serde(deserialize_with = "flexible_u64")]
	pub block_number: u64,
	#[serde(deserialize_with = "flexible_u64")]
	pub log_index: u64,
	pub transaction_hash: String,
	/// Block timestamp in unix seconds, when the gateway provides it.
	#[serde(default, deserialize_with = "flexible_timestamp")]
	pub block_timestamp: Option<i64>,
	#[serde(default)]
	pub args: serde_json::Value,
	/// Why the gateway row could not be read. The decoder skips such logs.
	#[serde(skip)]
	pub malformed: Option<String>,
}

impl RawLog {
	pub fn position(&self) -> LogPosition {
		LogPosition {
			block_number: self.block_number,
			log_index: self.log_index,
		}
	}

	/// Read one gateway row of `kind`.
	///
	/// A row without the expected shape does not fail its page: it becomes a log carrying the
	/// reason in `malformed`, positioned as well as the row allows.
	pub fn from_gateway_row(kind: EventKind, row: &Value) -> RawLog {
		match RawLog::deserialize(row) {
			Ok(log) => log,
			Err(e) => {
				let number = |field: &str| row.get(field).and_then(parse_u64).unwrap_or(0);
				RawLog {
					event: row
						.get("event")
						.and_then(Value::as_str)
						.unwrap_or(kind.signature())
						.to_string(),
					block_number: number("blockNumber"),
					log_index: number("logIndex"),
					transaction_hash: row
						.get("transactionHash")
						.and_then(Value::as_str)
						.unwrap_or_default()
						.to_string(),
					block_timestamp: None,
					args: Value::Null,
					malformed: Some(e.to_string()),
				}
			}
		}
	}
}

/// Parse a JSON integer, decimal string or `0x` hex string.
pub(crate) fn parse_u64(value: &Value) -> Option<u64> {
	match value {
		Value::Number(n) => n.as_u64(),
		Value::String(s) => {
			let s = s.trim();
			match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
				Some(digits) => u64::from_str_radix(digits, 16).ok(),
				None => s.parse().ok(),
			}
		}
		_ => None,
	}
}

fn flexible_u64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
	let value = Value::deserialize(deserializer)?;
	parse_u64(&value).ok_or_else(|| de::Error::custom(format!("invalid unsigned integer {}", value)))
}

fn flexible_timestamp<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
	let value = Value::deserialize(deserializer)?;
	if value.is_null() {
		return Ok(None);
	}
	parse_u64(&value)
		.and_then(|secs| i64::try_from(secs).ok())
		.map(Some)
		.ok_or_else(|| de::Error::custom(format!("invalid block timestamp {}", value)))
}

/// Upper bound of a block range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockTag {
	Number(u64),
	/// The ledger head at the time the range is resolved.
	Latest,
}

impl From<u64> for BlockTag {
	fn from(block: u64) -> Self {
		BlockTag::Number(block)
	}
}

impl FromStr for BlockTag {
	type Err = std::num::ParseIntError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		if s.eq_ignore_ascii_case("latest") {
			Ok(BlockTag::Latest)
		} else {
			s.parse().map(BlockTag::Number)
		}
	}
}

impl fmt::Display for BlockTag {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			BlockTag::Number(block) => write!(f, "{}", block),
			BlockTag::Latest => f.write_str("latest"),
		}
	}
}

/// Error types for ledger queries and subscriptions
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
	#[error("GraphQL error: {0}")]
	GraphQLError(String),

	#[error("No data returned")]
	NoData,

	#[error("WebSocket error: {0}")]
	WebSocketError(#[from] tokio_tungstenite::tungstenite::Error),

	#[error("HTTP error: {0}")]
	HttpError(#[from] reqwest::Error),

	#[error("JSON parse error: {0}")]
	JsonError(#[from] serde_json::Error),

	#[error("Session error: {0}")]
	SessionError(String),

	#[error("Request timed out after {0:?}")]
	Timeout(Duration),

	#[error("Ledger unavailable: {0}")]
	Unavailable(String),

	#[error("Invalid ledger configuration: {0}")]
	Config(String),
}

impl crate::utils::Transient for LedgerError {
	fn is_transient(&self) -> bool {
		!matches!(self, LedgerError::Config(_) | LedgerError::JsonError(_))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn gateway_rows_accept_string_numbers() {
		let row = json!({
			"event": "FundsDonated",
			"blockNumber": "0x2a",
			"logIndex": "3",
			"transactionHash": "0xabc",
			"blockTimestamp": "0x6553f100",
			"args": {}
		});
		let log = RawLog::from_gateway_row(EventKind::FundsDonated, &row);
		assert!(log.malformed.is_none());
		assert_eq!(log.position(), LogPosition { block_number: 42, log_index: 3 });
		assert_eq!(log.block_timestamp, Some(1_700_000_000));
	}

	#[test]
	fn unreadable_rows_keep_their_position() {
		let row = json!({
			"event": "FundsDonated",
			"blockNumber": 42,
			"logIndex": null,
			"transactionHash": "0xabc",
			"args": {}
		});
		let log = RawLog::from_gateway_row(EventKind::FundsDonated, &row);
		assert!(log.malformed.is_some());
		assert_eq!(log.block_number, 42);
		assert_eq!(log.transaction_hash, "0xabc");

		let log = RawLog::from_gateway_row(EventKind::FundsSpent, &json!("garbage"));
		assert_eq!(log.event, "FundsSpent");
		assert!(log.malformed.is_some());
	}
}
