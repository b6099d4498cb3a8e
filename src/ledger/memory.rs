//! In-process ledger.
//!
//! `MemoryLedger` keeps an ordered log history and fans appended logs out to live subscribers.
//! Hosts use it to embed the sync pipeline without a gateway, and the test suites use it to
//! script historical ranges, redelivery and dropped feeds.

use super::client::{LedgerClient, LogStream};
use super::types::{EventKind, LedgerError, RawLog};
use async_trait::async_trait;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

type Subscriber = (EventKind, mpsc::UnboundedSender<Result<RawLog, LedgerError>>);

#[derive(Default)]
struct LedgerState {
	history: Vec<RawLog>,
	head: u64,
	subscribers: Vec<Subscriber>,
	pending_query_failures: u32,
	pending_subscribe_failures: u32,
}

#[derive(Default)]
pub struct MemoryLedger {
	state: Mutex<LedgerState>,
}

impl MemoryLedger {
	pub fn new() -> Self {
		Self::default()
	}

	fn state(&self) -> MutexGuard<'_, LedgerState> {
		self.state.lock().unwrap_or_else(PoisonError::into_inner)
	}

	/// Add a log to history without notifying live subscribers.
	pub fn record(&self, log: RawLog) {
		let mut state = self.state();
		state.head = state.head.max(log.block_number);
		state.history.push(log);
	}

	/// Add a log to history and deliver it to matching live subscribers.
	pub fn emit(&self, log: RawLog) {
		self.deliver(log.clone());
		self.record(log);
	}

	/// Deliver a log to matching live subscribers only, as a redelivering feed would.
	pub fn deliver(&self, log: RawLog) {
		let mut state = self.state();
		state.subscribers.retain(|(kind, sender)| {
			if kind.signature() != log.event {
				return !sender.is_closed();
			}
			sender.send(Ok(log.clone())).is_ok()
		});
	}

	/// Push an error into every live feed of `kind`.
	pub fn fail_feed(&self, kind: EventKind, message: &str) {
		let state = self.state();
		for (_, sender) in state.subscribers.iter().filter(|(k, _)| *k == kind) {
			let _ = sender.send(Err(LedgerError::Unavailable(message.to_string())));
		}
	}

	/// End every open subscription stream.
	pub fn close_subscriptions(&self) {
		self.state().subscribers.clear();
	}

	/// Move the head forward without adding logs.
	pub fn set_head(&self, block: u64) {
		let mut state = self.state();
		state.head = state.head.max(block);
	}

	/// Make the next `count` range queries fail with a transient error.
	pub fn fail_next_queries(&self, count: u32) {
		self.state().pending_query_failures = count;
	}

	/// Make the next `count` subscribe attempts fail with a transient error.
	pub fn fail_next_subscribes(&self, count: u32) {
		self.state().pending_subscribe_failures = count;
	}

	/// Number of open subscriptions for `kind`.
	pub fn subscriber_count(&self, kind: EventKind) -> usize {
		self.state()
			.subscribers
			.iter()
			.filter(|(k, sender)| *k == kind && !sender.is_closed())
			.count()
	}
}

#[async_trait]
impl LedgerClient for MemoryLedger {
	async fn latest_block(&self) -> Result<u64, LedgerError> {
		Ok(self.state().head)
	}

	async fn query_events(
		&self,
		kind: EventKind,
		from_block: u64,
		to_block: u64,
	) -> Result<Vec<RawLog>, LedgerError> {
		let mut state = self.state();
		if state.pending_query_failures > 0 {
			state.pending_query_failures -= 1;
			return Err(LedgerError::Unavailable("injected query failure".to_string()));
		}

		let mut logs: Vec<RawLog> = state
			.history
			.iter()
			.filter(|log| {
				log.event == kind.signature()
					&& log.block_number >= from_block
					&& log.block_number <= to_block
			})
			.cloned()
			.collect();
		logs.sort_by_key(RawLog::position);
		Ok(logs)
	}

	async fn subscribe(&self, kind: EventKind) -> Result<LogStream, LedgerError> {
		let mut state = self.state();
		if state.pending_subscribe_failures > 0 {
			state.pending_subscribe_failures -= 1;
			return Err(LedgerError::Unavailable(
				"injected subscribe failure".to_string(),
			));
		}

		let (sender, receiver) = mpsc::unbounded_channel();
		state.subscribers.push((kind, sender));

		let stream = futures::stream::unfold(receiver, |mut receiver| async move {
			receiver.recv().await.map(|item| (item, receiver))
		});
		Ok(Box::pin(stream))
	}

	fn name(&self) -> &'static str {
		"MemoryLedger"
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use futures_util::StreamExt;
	use serde_json::json;

	fn log(event: &str, block: u64, index: u64) -> RawLog {
		RawLog {
			event: event.to_string(),
			block_number: block,
			log_index: index,
			transaction_hash: format!("0x{:02x}{:02x}", block, index),
			block_timestamp: None,
			args: json!({}),
			malformed: None,
		}
	}

	#[tokio::test]
	async fn query_filters_by_kind_and_range_in_order() {
		let ledger = MemoryLedger::new();
		ledger.record(log("FundsDistributed", 12, 1));
		ledger.record(log("FundsDistributed", 10, 0));
		ledger.record(log("FundsSpent", 11, 0));
		ledger.record(log("FundsDistributed", 12, 0));
		ledger.record(log("FundsDistributed", 30, 0));

		let logs = ledger
			.query_events(EventKind::FundsDistributed, 10, 20)
			.await
			.expect("query should succeed");
		let positions: Vec<(u64, u64)> = logs
			.iter()
			.map(|l| (l.block_number, l.log_index))
			.collect();
		assert_eq!(positions, vec![(10, 0), (12, 0), (12, 1)]);
		assert_eq!(ledger.latest_block().await.expect("head"), 30);
	}

	#[tokio::test]
	async fn emitted_logs_reach_matching_subscribers() {
		let ledger = MemoryLedger::new();
		let mut distributed = ledger
			.subscribe(EventKind::FundsDistributed)
			.await
			.expect("subscribe");
		let _spent = ledger.subscribe(EventKind::FundsSpent).await.expect("subscribe");

		ledger.emit(log("FundsDistributed", 5, 0));

		let received = distributed
			.next()
			.await
			.expect("stream open")
			.expect("log delivered");
		assert_eq!(received.block_number, 5);

		ledger.close_subscriptions();
		assert!(distributed.next().await.is_none());
	}

	#[tokio::test]
	async fn injected_failures_are_consumed() {
		let ledger = MemoryLedger::new();
		ledger.fail_next_queries(1);
		assert!(ledger.query_events(EventKind::FundsSpent, 0, 1).await.is_err());
		assert!(ledger.query_events(EventKind::FundsSpent, 0, 1).await.is_ok());
	}
}
