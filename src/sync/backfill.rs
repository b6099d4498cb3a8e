//! Historical catch-up over a closed block range.
//!
//! Every tracked kind is walked separately in batches of `batch_size` blocks. Within a kind, logs
//! are applied in (block, log index) order; a checkpoint is stored after every finished batch and
//! the cursor only advances once all kinds completed the pass.

use super::cursor::CursorRepository;
use super::events::{DeliverySource, SyncEvent};
use super::pipeline::{EventPipeline, ProcessOutcome};
use super::progress_tracker::{SyncProgressTracker, SyncStats};
use crate::SyncError;
use crate::config::{RetryConfig, SyncSettings};
use crate::ledger::{BlockTag, EventKind, LedgerClient, LedgerError, LogPosition};
use crate::utils::retry_transient;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct BackfillReport {
	pub from: u64,
	/// Resolved upper bound of the pass.
	pub to: u64,
	/// Kinds that skipped batches covered by an earlier interrupted pass.
	pub resumed_kinds: Vec<EventKind>,
	pub stats: SyncStats,
}

/// Run a ledger query under `timeout`, retrying transient failures with backoff.
pub(crate) async fn bounded_query<T, F, Fut>(
	retry: &RetryConfig,
	timeout: Duration,
	what: &str,
	mut query: F,
) -> Result<T, LedgerError>
where
	F: FnMut() -> Fut,
	Fut: Future<Output = Result<T, LedgerError>>,
{
	retry_transient(retry, what, || {
		let attempt = query();
		async move {
			match tokio::time::timeout(timeout, attempt).await {
				Ok(result) => result,
				Err(_) => Err(LedgerError::Timeout(timeout)),
			}
		}
	})
	.await
}

pub struct BackfillCoordinator {
	ledger: Arc<dyn LedgerClient>,
	pipeline: Arc<EventPipeline>,
	cursor_repo: Arc<dyn CursorRepository>,
	settings: SyncSettings,
	retry: RetryConfig,
}

impl BackfillCoordinator {
	pub fn new(
		ledger: Arc<dyn LedgerClient>,
		pipeline: Arc<EventPipeline>,
		cursor_repo: Arc<dyn CursorRepository>,
		settings: SyncSettings,
		retry: RetryConfig,
	) -> Self {
		Self {
			ledger,
			pipeline,
			cursor_repo,
			settings,
			retry,
		}
	}

	/// Resolve `latest` to the ledger head minus the configured confirmation depth.
	pub async fn resolve_target(&self, to: BlockTag) -> Result<u64, SyncError> {
		match to {
			BlockTag::Number(block) => Ok(block),
			BlockTag::Latest => {
				let head = bounded_query(
					&self.retry,
					self.settings.query_timeout(),
					"latest block query",
					|| self.ledger.latest_block(),
				)
				.await?;
				Ok(head.saturating_sub(self.settings.confirmation_depth))
			}
		}
	}

	pub async fn sync_range(&self, from: u64, to: BlockTag) -> Result<BackfillReport, SyncError> {
		let to = self.resolve_target(to).await?;
		let mut tracker = SyncProgressTracker::new(from);
		let mut resumed_kinds = Vec::new();

		if from > to {
			info!("Nothing to backfill: from block {} is past {}", from, to);
			return Ok(BackfillReport {
				from,
				to,
				resumed_kinds,
				stats: tracker.get_stats(),
			});
		}

		info!(
			"Backfilling blocks {}..={} for {} event kinds via {}",
			from,
			to,
			self.settings.tracked_events.len(),
			self.ledger.name()
		);

		let mut cursor = self.cursor_repo.load().await?;
		for &kind in &self.settings.tracked_events {
			let resume = cursor.resume_point(kind, from);
			if resume > from {
				info!("Resuming {} backfill at block {}", kind, resume);
				resumed_kinds.push(kind);
			}

			let mut last_processed: Option<LogPosition> = None;
			let mut batch_start = resume;
			while batch_start <= to {
				let batch_end = batch_start
					.saturating_add(self.settings.batch_size - 1)
					.min(to);

				let batch = self
					.sync_batch(kind, batch_start, batch_end, &mut tracker, &mut last_processed)
					.await;
				let saved = match batch {
					Ok(()) => {
						cursor.record_checkpoint(kind, from, batch_end);
						self.cursor_repo.save(&cursor).await.map_err(SyncError::from)
					}
					Err(e) => Err(e),
				};
				if let Err(e) = saved {
					return Err(SyncError::BackfillAborted {
						kind,
						last_processed,
						source: Box::new(e),
					});
				}

				tracker.log_progress(false);
				if batch_end == u64::MAX {
					break;
				}
				batch_start = batch_end + 1;
			}
		}

		cursor.complete_pass(to);
		self.cursor_repo.save(&cursor).await?;
		tracker.log_progress(true);

		self.pipeline
			.dispatcher()
			.dispatch(&SyncEvent::BackfillCompleted { from, to })
			.await;

		let stats = tracker.get_stats();
		info!("{}", stats.summary());
		Ok(BackfillReport {
			from,
			to,
			resumed_kinds,
			stats,
		})
	}

	async fn sync_batch(
		&self,
		kind: EventKind,
		from: u64,
		to: u64,
		tracker: &mut SyncProgressTracker,
		last_processed: &mut Option<LogPosition>,
	) -> Result<(), SyncError> {
		let what = format!("{} query for blocks {}..={}", kind, from, to);
		let mut logs = bounded_query(&self.retry, self.settings.query_timeout(), &what, || {
			self.ledger.query_events(kind, from, to)
		})
		.await?;
		logs.sort_by_key(|log| log.position());
		debug!("{} {} logs in blocks {}..={}", logs.len(), kind, from, to);

		for raw in &logs {
			match self.pipeline.process(raw, DeliverySource::Backfill).await? {
				ProcessOutcome::Applied(position) => tracker.record_applied(kind, position.block_number),
				ProcessOutcome::Duplicate(position) => {
					tracker.record_duplicate(kind, position.block_number)
				}
				ProcessOutcome::Skipped(position) => tracker.record_skipped(kind, position.block_number),
			}
			*last_processed = Some(raw.position());
		}
		Ok(())
	}
}
