//! Decode and apply, shared by backfill and live delivery.

use super::events::{DeliverySource, EventDispatcher, SyncEvent};
use crate::domain::decode;
use crate::ledger::{LogPosition, RawLog};
use crate::projection::{ApplyOutcome, ProjectionMutator, ProjectionWriteError};
use std::sync::Arc;
use tracing::{error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
	Applied(LogPosition),
	Duplicate(LogPosition),
	/// The log could not be decoded and was skipped.
	Skipped(LogPosition),
}

pub struct EventPipeline {
	mutator: ProjectionMutator,
	dispatcher: Arc<EventDispatcher>,
}

impl EventPipeline {
	pub fn new(mutator: ProjectionMutator, dispatcher: Arc<EventDispatcher>) -> Self {
		Self {
			mutator,
			dispatcher,
		}
	}

	pub fn dispatcher(&self) -> &EventDispatcher {
		&self.dispatcher
	}

	/// Decode `raw` and apply it. Decode failures are reported and skipped; write failures are
	/// reported and returned.
	pub async fn process(
		&self,
		raw: &RawLog,
		source: DeliverySource,
	) -> Result<ProcessOutcome, ProjectionWriteError> {
		let position = raw.position();

		let event = match decode(raw) {
			Ok(event) => event,
			Err(e) => {
				warn!(
					"Skipping {} log at {} ({}): {}",
					raw.event, position, source, e
				);
				self.dispatcher
					.dispatch(&SyncEvent::EventSkipped {
						position,
						source,
						reason: e.to_string(),
					})
					.await;
				return Ok(ProcessOutcome::Skipped(position));
			}
		};

		match self.mutator.apply(&event).await {
			Ok(outcome) => {
				let duplicate = outcome == ApplyOutcome::Duplicate;
				self.dispatcher
					.dispatch(&SyncEvent::EventApplied {
						kind: event.kind(),
						key: event.key(),
						position,
						source,
						duplicate,
					})
					.await;
				Ok(if duplicate {
					ProcessOutcome::Duplicate(position)
				} else {
					ProcessOutcome::Applied(position)
				})
			}
			Err(e) => {
				error!("Failed to apply event at {} ({}): {}", position, source, e);
				self.dispatcher
					.dispatch(&SyncEvent::EventFailed {
						kind: e.kind,
						key: e.key.clone(),
						position,
						source,
						error: e.source.to_string(),
					})
					.await;
				Err(e)
			}
		}
	}
}
