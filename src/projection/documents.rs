//! Typed shapes of the projection documents.
//!
//! Writers serialize these through [`to_document`](super::store::to_document); only the fields
//! owned by the ledger are ever written, so merges leave application-side edits alone.

use crate::domain::{Address, Amount, EventMeta, IdempotencyKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const STATUS_ACTIVE: &str = "active";
pub const DONATION_CONFIRMED: &str = "confirmed";

/// Where in the ledger a document was derived from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerRef {
	pub transaction_hash: String,
	pub block_number: u64,
	pub log_index: u64,
}

impl From<&EventMeta> for LedgerRef {
	fn from(meta: &EventMeta) -> Self {
		Self {
			transaction_hash: meta.transaction_hash.clone(),
			block_number: meta.block_number,
			log_index: meta.log_index,
		}
	}
}

/// Ledger-owned fields of `disasters/{eventId}`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DisasterLedgerFields {
	pub id: String,
	pub name: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub location: Option<String>,
	pub target_funding: Amount,
	pub creator: Address,
	pub ledger: LedgerRef,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DisasterStats {
	pub distribution_count: u64,
	pub beneficiary_count: u64,
	pub vendor_count: u64,
}

/// Read view of a disaster document.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisasterEvent {
	pub id: Option<String>,
	pub name: Option<String>,
	pub location: Option<String>,
	pub status: Option<String>,
	pub target_funding: Option<Amount>,
	#[serde(default)]
	pub current_funding: Amount,
	#[serde(default)]
	pub stats: DisasterStats,
	pub creator: Option<Address>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
	Distribution,
	Spend,
	CategorySpend,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartyKind {
	Disaster,
	Beneficiary,
	Vendor,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartyRef {
	pub kind: PartyKind,
	pub id: String,
}

impl PartyRef {
	pub fn disaster(id: &str) -> Self {
		Self {
			kind: PartyKind::Disaster,
			id: id.to_string(),
		}
	}

	pub fn beneficiary(address: &Address) -> Self {
		Self {
			kind: PartyKind::Beneficiary,
			id: address.to_string(),
		}
	}

	pub fn vendor(address: &Address) -> Self {
		Self {
			kind: PartyKind::Vendor,
			id: address.to_string(),
		}
	}
}

/// `transactions/{key}`. Written once, never updated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRecord {
	pub id: IdempotencyKey,
	#[serde(rename = "type")]
	pub tx_type: TransactionType,
	pub from: PartyRef,
	pub to: PartyRef,
	pub amount: Amount,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub category: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub disaster_id: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub timestamp: Option<DateTime<Utc>>,
	pub ledger: LedgerRef,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
	Beneficiary,
	Vendor,
}

/// Ledger-owned fields of `users/{address}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
	pub address: Address,
	pub role: Role,
	pub whitelisted: bool,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub disaster_id: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub updated_at: Option<DateTime<Utc>>,
	pub ledger: LedgerRef,
}

/// Ledger-owned fields of `vendors/{address}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VendorRecord {
	pub address: Address,
	pub role: Role,
	pub whitelisted: bool,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub category: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub updated_at: Option<DateTime<Utc>>,
	pub ledger: LedgerRef,
}

/// `donations/{key}`. Written once, never updated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DonationRecord {
	pub id: IdempotencyKey,
	pub donor: Address,
	pub amount: Amount,
	pub status: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub disaster_id: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub timestamp: Option<DateTime<Utc>>,
	pub ledger: LedgerRef,
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn transaction_record_wire_shape() {
		let record = TransactionRecord {
			id: IdempotencyKey::derive("0xaa", 0),
			tx_type: TransactionType::CategorySpend,
			from: PartyRef {
				kind: PartyKind::Beneficiary,
				id: "0x1111111111111111111111111111111111111111".to_string(),
			},
			to: PartyRef {
				kind: PartyKind::Vendor,
				id: "0x2222222222222222222222222222222222222222".to_string(),
			},
			amount: Amount::new(25),
			category: Some("food".to_string()),
			disaster_id: None,
			timestamp: None,
			ledger: LedgerRef {
				transaction_hash: "0xaa".to_string(),
				block_number: 7,
				log_index: 0,
			},
		};

		let value = serde_json::to_value(&record).expect("serializes");
		assert_eq!(value["id"], json!("0xaa:0"));
		assert_eq!(value["type"], json!("category_spend"));
		assert_eq!(value["from"]["kind"], json!("beneficiary"));
		assert_eq!(value["amount"], json!("25"));
		assert_eq!(value["ledger"]["blockNumber"], json!(7));
		assert!(value.get("disasterId").is_none());
	}

	#[test]
	fn disaster_view_tolerates_partial_documents() {
		let view: DisasterEvent = serde_json::from_value(json!({
			"currentFunding": "500",
			"stats": { "distributionCount": 1 }
		}))
		.expect("deserializes");
		assert_eq!(view.current_funding, Amount::new(500));
		assert_eq!(view.stats.distribution_count, 1);
		assert_eq!(view.stats.vendor_count, 0);
		assert!(view.name.is_none());
	}
}
