//! Notifications emitted while syncing.
//!
//! The backfill coordinator and the live subscription manager report what happened to every log
//! (applied, duplicate, skipped, failed) and to every subscription through an [`EventDispatcher`].
//! Handlers are registered on the orchestrator; the health recorder is one of them, hosts may add
//! their own for metrics or alerting.

use crate::SyncError;
use crate::domain::IdempotencyKey;
use crate::ledger::{EventKind, LogPosition};
use std::fmt;
use std::sync::Arc;

/// Which path delivered a log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliverySource {
	Backfill,
	Live,
	/// Blocks a live feed missed while it was being re-opened
	Replay,
}

impl fmt::Display for DeliverySource {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			DeliverySource::Backfill => f.write_str("backfill"),
			DeliverySource::Live => f.write_str("live"),
			DeliverySource::Replay => f.write_str("replay"),
		}
	}
}

/// Events that occur during synchronization
#[derive(Debug, Clone)]
pub enum SyncEvent {
	/// An event reached the projection store, or was recognized as already applied
	EventApplied {
		kind: EventKind,
		key: IdempotencyKey,
		position: LogPosition,
		source: DeliverySource,
		duplicate: bool,
	},
	/// A log could not be decoded and was skipped
	EventSkipped {
		position: LogPosition,
		source: DeliverySource,
		reason: String,
	},
	/// Applying an event failed after retries
	EventFailed {
		kind: EventKind,
		key: IdempotencyKey,
		position: LogPosition,
		source: DeliverySource,
		error: String,
	},
	/// A full backfill pass finished and the cursor advanced
	BackfillCompleted { from: u64, to: u64 },
	/// A live subscription dropped or could not be opened
	SubscriptionLost {
		kind: EventKind,
		error: String,
		attempt: u32,
		gave_up: bool,
	},
	/// A live subscription is open again and the blocks it missed, if any, were replayed
	SubscriptionRestored {
		kind: EventKind,
		replayed: Option<(u64, u64)>,
	},
	/// The live manager started or stopped
	ListeningChanged(bool),
}

/// Trait for handling sync events.
#[async_trait::async_trait]
pub trait SyncEventHandler: Send + Sync {
	/// Handle a sync event. Called for every event, from both backfill and live tasks.
	async fn handle(&self, event: &SyncEvent) -> Result<(), SyncError>;

	/// Get the name of this handler for logging and diagnostics.
	fn name(&self) -> &'static str;
}

/// Event dispatcher that manages multiple event handlers.
///
/// Handlers are shared between the backfill path and every live task, so they take `&self` and
/// keep their own interior state.
#[derive(Clone, Default)]
pub struct EventDispatcher {
	handlers: Vec<Arc<dyn SyncEventHandler>>,
}

impl EventDispatcher {
	pub fn new() -> Self {
		Self::default()
	}

	/// Register a new event handler. Handlers are called in registration order.
	pub fn register_handler(&mut self, handler: Arc<dyn SyncEventHandler>) {
		self.handlers.push(handler);
	}

	/// Dispatch an event to all registered handlers.
	///
	/// Errors from handlers are logged, but do not stop other handlers from running.
	pub async fn dispatch(&self, event: &SyncEvent) {
		for handler in &self.handlers {
			if let Err(e) = handler.handle(event).await {
				tracing::error!("Handler {} failed to process event: {}", handler.name(), e);
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicUsize, Ordering};

	struct Counting(AtomicUsize);

	#[async_trait::async_trait]
	impl SyncEventHandler for Counting {
		async fn handle(&self, _event: &SyncEvent) -> Result<(), SyncError> {
			self.0.fetch_add(1, Ordering::SeqCst);
			Ok(())
		}

		fn name(&self) -> &'static str {
			"counting"
		}
	}

	struct Failing;

	#[async_trait::async_trait]
	impl SyncEventHandler for Failing {
		async fn handle(&self, _event: &SyncEvent) -> Result<(), SyncError> {
			Err(SyncError::Handler("boom".to_string()))
		}

		fn name(&self) -> &'static str {
			"failing"
		}
	}

	#[tokio::test]
	async fn failing_handler_does_not_block_others() {
		let counting = Arc::new(Counting(AtomicUsize::new(0)));
		let mut dispatcher = EventDispatcher::new();
		dispatcher.register_handler(Arc::new(Failing));
		dispatcher.register_handler(counting.clone());

		dispatcher.dispatch(&SyncEvent::ListeningChanged(true)).await;
		dispatcher
			.dispatch(&SyncEvent::BackfillCompleted { from: 0, to: 10 })
			.await;

		assert_eq!(counting.0.load(Ordering::SeqCst), 2);
	}
}
