//! Applies decoded domain events to the projection store.
//!
//! Each event kind has one handler. Handlers that create immutable records go through
//! [`DocumentStore::insert_once`] keyed by the event's idempotency key, so a re-delivered event is
//! reported as a duplicate and its increments are never applied twice.

use super::documents::*;
use super::store::{Collection, Document, DocumentStore, FieldIncrement, SetOptions, StoreError, to_document};
use crate::config::RetryConfig;
use crate::domain::{
	Amount, BeneficiaryWhitelisted, CategorySpent, DomainEvent, EmergencyEventCreated, EventMeta,
	EventPayload, FundsDistributed, FundsDonated, FundsSpent, IdempotencyKey, VendorWhitelisted,
};
use crate::ledger::EventKind;
use crate::utils::{format_token_amount, retry_transient};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
	Applied,
	/// The idempotency key was already applied; nothing was written.
	Duplicate,
}

#[derive(Debug, thiserror::Error)]
#[error("failed to apply {kind} {key}: {source}")]
pub struct ProjectionWriteError {
	pub key: IdempotencyKey,
	pub kind: EventKind,
	#[source]
	pub source: StoreError,
}

pub struct ProjectionMutator {
	store: Arc<dyn DocumentStore>,
	retry: RetryConfig,
	token_decimals: u32,
}

impl ProjectionMutator {
	pub fn new(store: Arc<dyn DocumentStore>, retry: RetryConfig, token_decimals: u32) -> Self {
		Self {
			store,
			retry,
			token_decimals,
		}
	}

	/// Apply one event, retrying transient store failures with backoff.
	pub async fn apply(&self, event: &DomainEvent) -> Result<ApplyOutcome, ProjectionWriteError> {
		let key = event.key();
		let what = format!("applying {} {}", event.kind(), key);

		let outcome = retry_transient(&self.retry, &what, || self.apply_once(event))
			.await
			.map_err(|source| ProjectionWriteError {
				key: key.clone(),
				kind: event.kind(),
				source,
			})?;

		debug!("{} {} -> {:?}", event.kind(), key, outcome);
		Ok(outcome)
	}

	async fn apply_once(&self, event: &DomainEvent) -> Result<ApplyOutcome, StoreError> {
		let meta = &event.meta;
		match &event.payload {
			EventPayload::EmergencyEventCreated(created) => self.create_disaster(meta, created).await,
			EventPayload::FundsDistributed(distributed) => {
				self.record_distribution(meta, distributed).await
			}
			EventPayload::FundsSpent(spent) => self.record_spend(meta, spent).await,
			EventPayload::CategorySpent(spent) => self.record_category_spend(meta, spent).await,
			EventPayload::BeneficiaryWhitelisted(whitelisted) => {
				self.whitelist_beneficiary(meta, whitelisted).await
			}
			EventPayload::VendorWhitelisted(whitelisted) => {
				self.whitelist_vendor(meta, whitelisted).await
			}
			EventPayload::FundsDonated(donated) => self.record_donation(meta, donated).await,
		}
	}

	async fn create_disaster(
		&self,
		meta: &EventMeta,
		created: &EmergencyEventCreated,
	) -> Result<ApplyOutcome, StoreError> {
		let fields = DisasterLedgerFields {
			id: created.event_id.clone(),
			name: created.name.clone(),
			location: created.location.clone(),
			target_funding: created.target_funding,
			creator: created.creator.clone(),
			ledger: LedgerRef::from(meta),
			created_at: meta.emitted_at,
		};
		self.store
			.set(
				Collection::Disasters,
				&created.event_id,
				to_document(&fields)?,
				SetOptions::merge(),
			)
			.await?;

		// Funding may already have been counted by a distribution that arrived first
		let defaults = document(json!({
			"status": STATUS_ACTIVE,
			"currentFunding": "0",
			"stats.distributionCount": 0,
			"stats.beneficiaryCount": 0,
			"stats.vendorCount": 0,
		}));
		self.store
			.init_fields(Collection::Disasters, &created.event_id, defaults)
			.await?;

		info!(
			"Disaster {} ({}) created, target {}",
			created.event_id,
			created.name,
			format_token_amount(created.target_funding, self.token_decimals)
		);
		Ok(ApplyOutcome::Applied)
	}

	async fn record_distribution(
		&self,
		meta: &EventMeta,
		distributed: &FundsDistributed,
	) -> Result<ApplyOutcome, StoreError> {
		let key = meta.key();
		let record = TransactionRecord {
			id: key.clone(),
			tx_type: TransactionType::Distribution,
			from: PartyRef::disaster(&distributed.event_id),
			to: PartyRef::beneficiary(&distributed.beneficiary),
			amount: distributed.amount,
			category: None,
			disaster_id: Some(distributed.event_id.clone()),
			timestamp: meta.emitted_at,
			ledger: LedgerRef::from(meta),
		};

		let delta = funding_delta(distributed.amount, &distributed.event_id)?;
		let increments = [
			FieldIncrement::amount(
				Collection::Disasters,
				&distributed.event_id,
				"currentFunding",
				delta,
			),
			FieldIncrement::counter(
				Collection::Disasters,
				&distributed.event_id,
				"stats.distributionCount",
				1,
			),
		];

		let created = self
			.store
			.insert_once(
				Collection::Transactions,
				key.as_str(),
				to_document(&record)?,
				&increments,
			)
			.await?;
		if created {
			info!(
				"Distributed {} to {} for disaster {}",
				format_token_amount(distributed.amount, self.token_decimals),
				distributed.beneficiary,
				distributed.event_id
			);
		}
		Ok(outcome(created))
	}

	async fn record_spend(
		&self,
		meta: &EventMeta,
		spent: &FundsSpent,
	) -> Result<ApplyOutcome, StoreError> {
		let record = TransactionRecord {
			id: meta.key(),
			tx_type: TransactionType::Spend,
			from: PartyRef::beneficiary(&spent.beneficiary),
			to: PartyRef::vendor(&spent.vendor),
			amount: spent.amount,
			category: None,
			disaster_id: spent.event_id.clone(),
			timestamp: meta.emitted_at,
			ledger: LedgerRef::from(meta),
		};
		self.insert_transaction(record).await
	}

	async fn record_category_spend(
		&self,
		meta: &EventMeta,
		spent: &CategorySpent,
	) -> Result<ApplyOutcome, StoreError> {
		let record = TransactionRecord {
			id: meta.key(),
			tx_type: TransactionType::CategorySpend,
			from: PartyRef::beneficiary(&spent.beneficiary),
			to: PartyRef::vendor(&spent.vendor),
			amount: spent.amount,
			category: Some(spent.category.clone()),
			disaster_id: spent.event_id.clone(),
			timestamp: meta.emitted_at,
			ledger: LedgerRef::from(meta),
		};
		self.insert_transaction(record).await
	}

	async fn insert_transaction(&self, record: TransactionRecord) -> Result<ApplyOutcome, StoreError> {
		let created = self
			.store
			.insert_once(
				Collection::Transactions,
				record.id.as_str(),
				to_document(&record)?,
				&[],
			)
			.await?;
		Ok(outcome(created))
	}

	async fn whitelist_beneficiary(
		&self,
		meta: &EventMeta,
		whitelisted: &BeneficiaryWhitelisted,
	) -> Result<ApplyOutcome, StoreError> {
		let profile = UserProfile {
			address: whitelisted.beneficiary.clone(),
			role: Role::Beneficiary,
			whitelisted: whitelisted.status,
			disaster_id: whitelisted.event_id.clone(),
			updated_at: meta.emitted_at,
			ledger: LedgerRef::from(meta),
		};
		self.store
			.set(
				Collection::Users,
				whitelisted.beneficiary.as_str(),
				to_document(&profile)?,
				SetOptions::merge(),
			)
			.await?;
		info!(
			"Beneficiary {} whitelisted={}",
			whitelisted.beneficiary, whitelisted.status
		);
		Ok(ApplyOutcome::Applied)
	}

	async fn whitelist_vendor(
		&self,
		meta: &EventMeta,
		whitelisted: &VendorWhitelisted,
	) -> Result<ApplyOutcome, StoreError> {
		let record = VendorRecord {
			address: whitelisted.vendor.clone(),
			role: Role::Vendor,
			whitelisted: whitelisted.status,
			category: whitelisted.category.clone(),
			updated_at: meta.emitted_at,
			ledger: LedgerRef::from(meta),
		};
		self.store
			.set(
				Collection::Vendors,
				whitelisted.vendor.as_str(),
				to_document(&record)?,
				SetOptions::merge(),
			)
			.await?;
		info!("Vendor {} whitelisted={}", whitelisted.vendor, whitelisted.status);
		Ok(ApplyOutcome::Applied)
	}

	async fn record_donation(
		&self,
		meta: &EventMeta,
		donated: &FundsDonated,
	) -> Result<ApplyOutcome, StoreError> {
		let key = meta.key();
		let record = DonationRecord {
			id: key.clone(),
			donor: donated.donor.clone(),
			amount: donated.amount,
			status: DONATION_CONFIRMED.to_string(),
			disaster_id: donated.event_id.clone(),
			timestamp: meta.emitted_at,
			ledger: LedgerRef::from(meta),
		};
		let created = self
			.store
			.insert_once(Collection::Donations, key.as_str(), to_document(&record)?, &[])
			.await?;
		if created {
			info!(
				"Donation of {} from {}",
				format_token_amount(donated.amount, self.token_decimals),
				donated.donor
			);
		}
		Ok(outcome(created))
	}
}

fn outcome(created: bool) -> ApplyOutcome {
	if created {
		ApplyOutcome::Applied
	} else {
		ApplyOutcome::Duplicate
	}
}

fn funding_delta(amount: Amount, disaster_id: &str) -> Result<i128, StoreError> {
	i128::try_from(amount.value()).map_err(|_| StoreError::Overflow {
		collection: Collection::Disasters,
		id: disaster_id.to_string(),
		field: "currentFunding".to_string(),
	})
}

fn document(value: Value) -> Document {
	match value {
		Value::Object(map) => map,
		_ => Document::new(),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::domain::Address;
	use crate::projection::MemoryStore;

	const BENEFICIARY: &str = "0x00000000000000000000000000000000000000b1";
	const VENDOR: &str = "0x00000000000000000000000000000000000000f1";
	const CREATOR: &str = "0x00000000000000000000000000000000000000c1";

	fn address(s: &str) -> Address {
		s.parse().expect("valid address")
	}

	fn meta(kind: EventKind, tx: &str, log_index: u64) -> EventMeta {
		EventMeta {
			kind,
			block_number: 100,
			log_index,
			transaction_hash: tx.to_string(),
			emitted_at: None,
		}
	}

	fn distribution(tx: &str, amount: u128) -> DomainEvent {
		DomainEvent {
			meta: meta(EventKind::FundsDistributed, tx, 0),
			payload: EventPayload::FundsDistributed(FundsDistributed {
				beneficiary: address(BENEFICIARY),
				amount: Amount::new(amount),
				event_id: "E1".to_string(),
			}),
		}
	}

	fn creation() -> DomainEvent {
		DomainEvent {
			meta: meta(EventKind::EmergencyEventCreated, "0x01", 0),
			payload: EventPayload::EmergencyEventCreated(EmergencyEventCreated {
				event_id: "E1".to_string(),
				name: "Flood".to_string(),
				location: Some("Valencia".to_string()),
				target_funding: Amount::new(10_000),
				creator: address(CREATOR),
			}),
		}
	}

	fn fast_retry() -> RetryConfig {
		RetryConfig {
			initial_interval_ms: 1,
			max_interval_ms: 5,
			multiplier: 2.0,
			max_elapsed_ms: 200,
		}
	}

	fn mutator(store: &Arc<MemoryStore>) -> ProjectionMutator {
		ProjectionMutator::new(store.clone(), fast_retry(), 18)
	}

	async fn disaster(store: &MemoryStore) -> DisasterEvent {
		let doc = store
			.get(Collection::Disasters, "E1")
			.await
			.expect("get")
			.expect("disaster exists");
		serde_json::from_value(Value::Object(doc)).expect("disaster view")
	}

	#[tokio::test]
	async fn distribution_applies_once() {
		let store = Arc::new(MemoryStore::new());
		let mutator = mutator(&store);
		mutator.apply(&creation()).await.expect("create");

		let event = distribution("0xaa", 500);
		assert_eq!(mutator.apply(&event).await.expect("first"), ApplyOutcome::Applied);
		assert_eq!(mutator.apply(&event).await.expect("second"), ApplyOutcome::Duplicate);

		let view = disaster(&store).await;
		assert_eq!(view.current_funding, Amount::new(500));
		assert_eq!(view.stats.distribution_count, 1);
		assert_eq!(store.count(Collection::Transactions).await, 1);
	}

	#[tokio::test]
	async fn creation_after_distribution_keeps_funding() {
		let store = Arc::new(MemoryStore::new());
		let mutator = mutator(&store);
		mutator.apply(&distribution("0xaa", 500)).await.expect("distribute");
		mutator.apply(&creation()).await.expect("create");

		let view = disaster(&store).await;
		assert_eq!(view.current_funding, Amount::new(500));
		assert_eq!(view.status.as_deref(), Some(STATUS_ACTIVE));
		assert_eq!(view.name.as_deref(), Some("Flood"));
		assert_eq!(view.stats.distribution_count, 1);
	}

	#[tokio::test]
	async fn re_creation_keeps_application_status() {
		let store = Arc::new(MemoryStore::new());
		let mutator = mutator(&store);
		mutator.apply(&creation()).await.expect("create");
		store
			.update(Collection::Disasters, "E1", document(json!({ "status": "closed" })))
			.await
			.expect("manual edit");
		mutator.apply(&creation()).await.expect("re-apply");

		assert_eq!(disaster(&store).await.status.as_deref(), Some("closed"));
	}

	#[tokio::test]
	async fn latest_whitelisting_wins() {
		let store = Arc::new(MemoryStore::new());
		let mutator = mutator(&store);
		for (log_index, status) in [(0, true), (1, false)] {
			let event = DomainEvent {
				meta: meta(EventKind::VendorWhitelisted, "0xbb", log_index),
				payload: EventPayload::VendorWhitelisted(VendorWhitelisted {
					vendor: address(VENDOR),
					category: Some("food".to_string()),
					status,
				}),
			};
			mutator.apply(&event).await.expect("whitelist");
		}

		let doc = store
			.get(Collection::Vendors, VENDOR)
			.await
			.expect("get")
			.expect("vendor exists");
		assert_eq!(doc["whitelisted"], json!(false));
		assert_eq!(doc["category"], json!("food"));
		assert_eq!(doc["role"], json!("vendor"));
	}

	#[tokio::test]
	async fn transient_failures_are_retried() {
		let store = Arc::new(MemoryStore::new());
		let mutator = mutator(&store);
		store.fail_next_writes(2);

		let outcome = mutator.apply(&distribution("0xaa", 5)).await.expect("retried");
		assert_eq!(outcome, ApplyOutcome::Applied);
		assert_eq!(disaster(&store).await.current_funding, Amount::new(5));
	}

	#[tokio::test]
	async fn exhausted_retries_surface_the_key() {
		let store = Arc::new(MemoryStore::new());
		let mutator = mutator(&store);
		store.fail_next_writes(u32::MAX);

		let err = mutator
			.apply(&distribution("0xaa", 5))
			.await
			.expect_err("store stays down");
		assert_eq!(err.key.as_str(), "0xaa:0");
		assert_eq!(err.kind, EventKind::FundsDistributed);
		assert!(matches!(err.source, StoreError::Unavailable(_)));
	}

	#[tokio::test]
	async fn oversized_amount_is_rejected() {
		let store = Arc::new(MemoryStore::new());
		let mutator = mutator(&store);

		let err = mutator
			.apply(&distribution("0xaa", u128::MAX))
			.await
			.expect_err("does not fit a signed delta");
		assert!(matches!(err.source, StoreError::Overflow { .. }));
		assert_eq!(store.count(Collection::Transactions).await, 0);
	}

	fn spend(tx: &str, amount: u128) -> DomainEvent {
		DomainEvent {
			meta: meta(EventKind::FundsSpent, tx, 2),
			payload: EventPayload::FundsSpent(FundsSpent {
				beneficiary: address(BENEFICIARY),
				vendor: address(VENDOR),
				amount: Amount::new(amount),
				event_id: Some("E1".to_string()),
			}),
		}
	}

	fn category_spend(tx: &str, amount: u128) -> DomainEvent {
		DomainEvent {
			meta: meta(EventKind::CategorySpent, tx, 3),
			payload: EventPayload::CategorySpent(CategorySpent {
				beneficiary: address(BENEFICIARY),
				vendor: address(VENDOR),
				category: "food".to_string(),
				amount: Amount::new(amount),
				event_id: None,
			}),
		}
	}

	async fn transaction(store: &MemoryStore, key: &str) -> Document {
		store
			.get(Collection::Transactions, key)
			.await
			.expect("get")
			.expect("transaction exists")
	}

	#[tokio::test]
	async fn spend_records_are_written_once() {
		let store = Arc::new(MemoryStore::new());
		let mutator = mutator(&store);

		assert_eq!(
			mutator.apply(&spend("0xcc", 40)).await.expect("first"),
			ApplyOutcome::Applied
		);
		// Same key with different content must not overwrite the record
		assert_eq!(
			mutator.apply(&spend("0xcc", 99)).await.expect("replay"),
			ApplyOutcome::Duplicate
		);

		let record = transaction(&store, "0xcc:2").await;
		assert_eq!(record["type"], json!("spend"));
		assert_eq!(record["amount"], json!("40"));
		assert_eq!(record["from"]["kind"], json!("beneficiary"));
		assert_eq!(record["to"]["id"], json!(VENDOR));
		assert_eq!(record["disasterId"], json!("E1"));
		assert_eq!(store.count(Collection::Transactions).await, 1);
		// Spending never touches disaster funding
		assert!(
			store
				.get(Collection::Disasters, "E1")
				.await
				.expect("get")
				.is_none()
		);
	}

	#[tokio::test]
	async fn category_spend_records_keep_their_category() {
		let store = Arc::new(MemoryStore::new());
		let mutator = mutator(&store);

		let event = category_spend("0xdd", 15);
		assert_eq!(mutator.apply(&event).await.expect("first"), ApplyOutcome::Applied);
		assert_eq!(
			mutator.apply(&event).await.expect("replay"),
			ApplyOutcome::Duplicate
		);

		let record = transaction(&store, "0xdd:3").await;
		assert_eq!(record["type"], json!("category_spend"));
		assert_eq!(record["category"], json!("food"));
		assert_eq!(record["amount"], json!("15"));
		assert!(record.get("disasterId").is_none());
		assert_eq!(store.count(Collection::Transactions).await, 1);
	}

	#[tokio::test]
	async fn beneficiary_whitelisting_upserts_one_profile() {
		let store = Arc::new(MemoryStore::new());
		let mutator = mutator(&store);
		let whitelisting = |log_index: u64, status: bool| DomainEvent {
			meta: meta(EventKind::BeneficiaryWhitelisted, "0xee", log_index),
			payload: EventPayload::BeneficiaryWhitelisted(BeneficiaryWhitelisted {
				beneficiary: address(BENEFICIARY),
				event_id: Some("E1".to_string()),
				status,
			}),
		};

		mutator.apply(&whitelisting(0, true)).await.expect("whitelist");
		mutator.apply(&whitelisting(0, true)).await.expect("replay");
		assert_eq!(store.count(Collection::Users).await, 1);
		let doc = store
			.get(Collection::Users, BENEFICIARY)
			.await
			.expect("get")
			.expect("profile exists");
		assert_eq!(doc["whitelisted"], json!(true));
		assert_eq!(doc["role"], json!("beneficiary"));
		assert_eq!(doc["disasterId"], json!("E1"));

		mutator.apply(&whitelisting(1, false)).await.expect("revoke");
		let doc = store
			.get(Collection::Users, BENEFICIARY)
			.await
			.expect("get")
			.expect("profile exists");
		assert_eq!(doc["whitelisted"], json!(false));
		assert_eq!(store.count(Collection::Users).await, 1);
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
	async fn concurrent_distributions_sum_exactly() {
		let store = Arc::new(MemoryStore::new());
		let mutator = Arc::new(mutator(&store));

		// Every distribution arrives twice at once, as from backfill and a live feed
		let mut tasks = tokio::task::JoinSet::new();
		for i in 0..20u128 {
			for _ in 0..2 {
				let mutator = mutator.clone();
				tasks.spawn(async move {
					mutator
						.apply(&distribution(&format!("0x{:02x}", i), i + 1))
						.await
				});
			}
		}

		let mut applied = 0;
		let mut duplicates = 0;
		while let Some(joined) = tasks.join_next().await {
			match joined.expect("task completes").expect("applies") {
				ApplyOutcome::Applied => applied += 1,
				ApplyOutcome::Duplicate => duplicates += 1,
			}
		}
		assert_eq!((applied, duplicates), (20, 20));

		let view = disaster(&store).await;
		assert_eq!(view.current_funding, Amount::new((1..=20u128).sum()));
		assert_eq!(view.stats.distribution_count, 20);
		assert_eq!(store.count(Collection::Transactions).await, 20);
	}
}
