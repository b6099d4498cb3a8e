//! Health snapshot maintained from sync events.

use super::events::{DeliverySource, SyncEvent, SyncEventHandler};
use crate::SyncError;
use crate::domain::IdempotencyKey;
use crate::ledger::EventKind;
use serde::Serialize;
use tokio::sync::RwLock;

const MAX_FAILED_EVENTS: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedEvent {
	pub key: IdempotencyKey,
	pub kind: EventKind,
	pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
	/// Cursor position: every tracked kind is applied through this block.
	pub last_processed_block: Option<u64>,
	pub listening: bool,
	/// Highest block delivered through a live subscription.
	pub last_live_block: Option<u64>,
	/// Kinds whose subscription gave up after repeated failures.
	pub failed_subscriptions: Vec<EventKind>,
	/// Kinds whose feed dropped and whose missed blocks are not replayed yet.
	pub interrupted_subscriptions: Vec<EventKind>,
	/// Most recent events that could not be applied, oldest first.
	pub failed_events: Vec<FailedEvent>,
	/// Every failed application since start, including those no longer listed.
	pub failed_events_total: u64,
	pub last_error: Option<String>,
}

impl HealthStatus {
	pub fn is_degraded(&self) -> bool {
		!self.failed_subscriptions.is_empty()
			|| !self.interrupted_subscriptions.is_empty()
			|| !self.failed_events.is_empty()
	}
}

/// Event handler that folds sync events into a [`HealthStatus`].
#[derive(Default)]
pub struct HealthRecorder {
	status: RwLock<HealthStatus>,
}

impl HealthRecorder {
	pub fn new() -> Self {
		Self::default()
	}

	pub async fn snapshot(&self) -> HealthStatus {
		self.status.read().await.clone()
	}
}

#[async_trait::async_trait]
impl SyncEventHandler for HealthRecorder {
	async fn handle(&self, event: &SyncEvent) -> Result<(), SyncError> {
		let mut status = self.status.write().await;
		match event {
			SyncEvent::EventApplied {
				key,
				position,
				source,
				..
			} => {
				status.failed_events.retain(|failed| &failed.key != key);
				if *source != DeliverySource::Backfill {
					let block = position.block_number;
					status.last_live_block = Some(status.last_live_block.map_or(block, |b| b.max(block)));
				}
			}
			SyncEvent::EventFailed {
				kind, key, error, ..
			} => {
				status.failed_events_total += 1;
				status.failed_events.retain(|failed| &failed.key != key);
				status.failed_events.push(FailedEvent {
					key: key.clone(),
					kind: *kind,
					error: error.clone(),
				});
				if status.failed_events.len() > MAX_FAILED_EVENTS {
					let excess = status.failed_events.len() - MAX_FAILED_EVENTS;
					status.failed_events.drain(..excess);
				}
				status.last_error = Some(format!("{} {}: {}", kind, key, error));
			}
			SyncEvent::SubscriptionLost {
				kind,
				error,
				gave_up,
				..
			} => {
				if *gave_up {
					status.interrupted_subscriptions.retain(|k| k != kind);
					if !status.failed_subscriptions.contains(kind) {
						status.failed_subscriptions.push(*kind);
					}
				} else if !status.interrupted_subscriptions.contains(kind) {
					status.interrupted_subscriptions.push(*kind);
				}
				status.last_error = Some(format!("{} subscription: {}", kind, error));
			}
			SyncEvent::SubscriptionRestored { kind, .. } => {
				status.failed_subscriptions.retain(|k| k != kind);
				status.interrupted_subscriptions.retain(|k| k != kind);
			}
			SyncEvent::ListeningChanged(listening) => {
				status.listening = *listening;
				status.interrupted_subscriptions.clear();
				if *listening {
					status.failed_subscriptions.clear();
				}
			}
			SyncEvent::BackfillCompleted { to, .. } => {
				status.last_processed_block =
					Some(status.last_processed_block.map_or(*to, |b| b.max(*to)));
			}
			SyncEvent::EventSkipped { .. } => {}
		}
		Ok(())
	}

	fn name(&self) -> &'static str {
		"health"
	}
}
