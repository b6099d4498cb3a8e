//! Raw log decoding.
//!
//! [`decode`] is pure: it maps a [`RawLog`] to a [`DomainEvent`] or explains why it cannot. Callers
//! treat every [`DecodeError`] as a skip, never as a reason to stop a range.

use super::events::*;
use crate::ledger::{EventKind, RawLog};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
	#[error("unreadable ledger row: {0}")]
	MalformedLog(String),

	#[error("unrecognized event {event:?}")]
	UnknownEvent { event: String },

	#[error("{kind} arguments are not an object")]
	MalformedArgs { kind: EventKind },

	#[error("invalid {kind} arguments: {source}")]
	InvalidArgs {
		kind: EventKind,
		#[source]
		source: serde_json::Error,
	},

	#[error("missing transaction hash")]
	MissingTransactionHash,

	#[error("invalid block timestamp {0}")]
	InvalidTimestamp(i64),
}

/// Decode one raw log.
pub fn decode(raw: &RawLog) -> Result<DomainEvent, DecodeError> {
	if let Some(reason) = &raw.malformed {
		return Err(DecodeError::MalformedLog(reason.clone()));
	}

	let kind: EventKind = raw.event.parse().map_err(|_| DecodeError::UnknownEvent {
		event: raw.event.clone(),
	})?;

	if raw.transaction_hash.trim().is_empty() {
		return Err(DecodeError::MissingTransactionHash);
	}

	let emitted_at = raw
		.block_timestamp
		.map(|secs| {
			DateTime::<Utc>::from_timestamp(secs, 0).ok_or(DecodeError::InvalidTimestamp(secs))
		})
		.transpose()?;

	if !raw.args.is_object() {
		return Err(DecodeError::MalformedArgs { kind });
	}

	let payload = match kind {
		EventKind::EmergencyEventCreated => {
			EventPayload::EmergencyEventCreated(args(kind, raw)?)
		}
		EventKind::FundsDistributed => EventPayload::FundsDistributed(args(kind, raw)?),
		EventKind::FundsSpent => EventPayload::FundsSpent(args(kind, raw)?),
		EventKind::CategorySpent => EventPayload::CategorySpent(args(kind, raw)?),
		EventKind::BeneficiaryWhitelisted => {
			EventPayload::BeneficiaryWhitelisted(args(kind, raw)?)
		}
		EventKind::VendorWhitelisted => EventPayload::VendorWhitelisted(args(kind, raw)?),
		EventKind::FundsDonated => EventPayload::FundsDonated(args(kind, raw)?),
	};

	Ok(DomainEvent {
		meta: EventMeta {
			kind,
			block_number: raw.block_number,
			log_index: raw.log_index,
			transaction_hash: raw.transaction_hash.clone(),
			emitted_at,
		},
		payload,
	})
}

fn args<T: DeserializeOwned>(kind: EventKind, raw: &RawLog) -> Result<T, DecodeError> {
	T::deserialize(&raw.args).map_err(|source| DecodeError::InvalidArgs { kind, source })
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::domain::Amount;
	use serde_json::json;

	const BENEFICIARY: &str = "0x00000000000000000000000000000000000000b1";

	fn raw(event: &str, args: serde_json::Value) -> RawLog {
		RawLog {
			event: event.to_string(),
			block_number: 120,
			log_index: 4,
			transaction_hash: "0xAA".to_string(),
			block_timestamp: Some(1_700_000_000),
			args,
			malformed: None,
		}
	}

	#[test]
	fn decodes_funds_distributed() {
		let event = decode(&raw(
			"FundsDistributed",
			json!({ "beneficiary": BENEFICIARY, "amount": "500", "eventId": "E1" }),
		))
		.expect("decodes");

		assert_eq!(event.kind(), EventKind::FundsDistributed);
		assert_eq!(event.key().as_str(), "0xAA:4");
		assert_eq!(
			event.meta.emitted_at.map(|t| t.timestamp()),
			Some(1_700_000_000)
		);
		match event.payload {
			EventPayload::FundsDistributed(payload) => {
				assert_eq!(payload.amount, Amount::new(500));
				assert_eq!(payload.event_id, "E1");
				assert_eq!(payload.beneficiary.as_str(), BENEFICIARY);
			}
			other => panic!("unexpected payload {:?}", other),
		}
	}

	#[test]
	fn plain_identifiers_are_accepted_as_addresses() {
		let event = decode(&raw(
			"FundsDistributed",
			json!({ "beneficiary": "B1", "amount": 500, "eventId": "E1" }),
		))
		.expect("decodes");
		match event.payload {
			EventPayload::FundsDistributed(payload) => {
				assert_eq!(payload.beneficiary.as_str(), "B1");
				assert_eq!(payload.amount, Amount::new(500));
			}
			other => panic!("unexpected payload {:?}", other),
		}
	}

	#[test]
	fn numeric_ids_and_optional_fields() {
		let event = decode(&raw(
			"EmergencyEventCreated",
			json!({
				"eventId": 7,
				"name": "Flood relief",
				"targetFunding": "0x3e8",
				"creator": BENEFICIARY
			}),
		))
		.expect("decodes");
		match event.payload {
			EventPayload::EmergencyEventCreated(payload) => {
				assert_eq!(payload.event_id, "7");
				assert_eq!(payload.location, None);
				assert_eq!(payload.target_funding, Amount::new(1000));
			}
			other => panic!("unexpected payload {:?}", other),
		}

		let whitelisted = decode(&raw(
			"BeneficiaryWhitelisted",
			json!({ "beneficiary": BENEFICIARY }),
		))
		.expect("decodes");
		match whitelisted.payload {
			EventPayload::BeneficiaryWhitelisted(payload) => {
				assert!(payload.status);
				assert_eq!(payload.event_id, None);
			}
			other => panic!("unexpected payload {:?}", other),
		}
	}

	#[test]
	fn unknown_events_are_reported() {
		let err = decode(&raw("OwnershipTransferred", json!({}))).expect_err("unknown");
		assert!(matches!(err, DecodeError::UnknownEvent { .. }));
	}

	#[test]
	fn bad_fields_are_reported() {
		let bad_vendor = decode(&raw(
			"FundsSpent",
			json!({ "beneficiary": BENEFICIARY, "vendor": "", "amount": "1" }),
		))
		.expect_err("vendor is empty");
		assert!(matches!(
			bad_vendor,
			DecodeError::InvalidArgs {
				kind: EventKind::FundsSpent,
				..
			}
		));

		let missing_amount = decode(&raw(
			"FundsDonated",
			json!({ "donor": BENEFICIARY }),
		))
		.expect_err("amount missing");
		assert!(matches!(missing_amount, DecodeError::InvalidArgs { .. }));

		let positional = decode(&raw("FundsDonated", json!([BENEFICIARY, "1"])))
			.expect_err("positional args");
		assert!(matches!(positional, DecodeError::MalformedArgs { .. }));
	}

	#[test]
	fn unreadable_rows_are_reported() {
		let row = json!({ "event": "FundsDonated", "blockNumber": 9, "logIndex": null });
		let log = RawLog::from_gateway_row(EventKind::FundsDonated, &row);
		assert!(matches!(decode(&log), Err(DecodeError::MalformedLog(_))));
	}

	#[test]
	fn missing_transaction_hash_is_rejected() {
		let mut log = raw(
			"FundsDonated",
			json!({ "donor": BENEFICIARY, "amount": 1 }),
		);
		log.transaction_hash = String::new();
		assert!(matches!(
			decode(&log),
			Err(DecodeError::MissingTransactionHash)
		));
	}
}
