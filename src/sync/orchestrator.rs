//! Sync orchestrator, the entry point embedding hosts hold on to.
//!
//! The orchestrator validates configuration, probes the ledger, loads the cursor and wires the
//! event pipeline, the backfill coordinator and the live subscription manager together. Backfill
//! passes are serialized; live subscriptions run independently and may overlap a backfill since
//! re-delivered events are recognized as duplicates.

use super::backfill::{BackfillCoordinator, BackfillReport};
use super::cursor::CursorRepository;
use super::events::{EventDispatcher, SyncEventHandler};
use super::health::{HealthRecorder, HealthStatus};
use super::live::LiveSubscriptionManager;
use super::pipeline::EventPipeline;
use crate::SyncError;
use crate::config::Config;
use crate::ledger::{BlockTag, LedgerClient};
use crate::projection::{DocumentStore, ProjectionMutator};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// Components built by [`SyncOrchestrator::initialize`].
struct Runtime {
	backfill: BackfillCoordinator,
	live: LiveSubscriptionManager,
	/// Serializes backfill passes
	backfill_lock: Mutex<()>,
}

pub struct SyncOrchestrator {
	config: Config,
	ledger: Arc<dyn LedgerClient>,
	store: Arc<dyn DocumentStore>,
	cursor_repo: Arc<dyn CursorRepository>,
	dispatcher: EventDispatcher,
	health: Arc<HealthRecorder>,
	runtime: Option<Runtime>,
}

impl SyncOrchestrator {
	pub fn new(
		config: Config,
		ledger: Arc<dyn LedgerClient>,
		store: Arc<dyn DocumentStore>,
		cursor_repo: Arc<dyn CursorRepository>,
	) -> Self {
		let health = Arc::new(HealthRecorder::new());
		let mut dispatcher = EventDispatcher::new();
		dispatcher.register_handler(health.clone());

		Self {
			config,
			ledger,
			store,
			cursor_repo,
			dispatcher,
			health,
			runtime: None,
		}
	}

	/// Register an additional sync event handler. Handlers registered after `initialize` are not
	/// picked up.
	pub fn register_handler(&mut self, handler: Arc<dyn SyncEventHandler>) {
		self.dispatcher.register_handler(handler);
	}

	/// Validate configuration, probe the ledger and load the cursor. Idempotent.
	pub async fn initialize(&mut self) -> Result<(), SyncError> {
		if self.runtime.is_some() {
			return Ok(());
		}

		self.config.validate()?;

		let timeout = self.config.sync.query_timeout();
		let head = match tokio::time::timeout(timeout, self.ledger.latest_block()).await {
			Ok(Ok(head)) => head,
			Ok(Err(e)) => {
				return Err(SyncError::Initialization(format!(
					"ledger {} unreachable: {}",
					self.ledger.name(),
					e
				)));
			}
			Err(_) => {
				return Err(SyncError::Initialization(format!(
					"ledger {} did not answer within {:?}",
					self.ledger.name(),
					timeout
				)));
			}
		};

		let cursor = self.cursor_repo.load().await?;
		info!(
			"Initialized sync against {} at head {} (cursor: {:?})",
			self.ledger.name(),
			head,
			cursor.last_processed_block
		);

		let mutator = ProjectionMutator::new(
			self.store.clone(),
			self.config.retry.clone(),
			self.config.sync.token_decimals,
		);
		let pipeline = Arc::new(EventPipeline::new(mutator, Arc::new(self.dispatcher.clone())));

		self.runtime = Some(Runtime {
			backfill: BackfillCoordinator::new(
				self.ledger.clone(),
				pipeline.clone(),
				self.cursor_repo.clone(),
				self.config.sync.clone(),
				self.config.retry.clone(),
			),
			live: LiveSubscriptionManager::new(
				self.ledger.clone(),
				pipeline,
				&self.config.sync,
				&self.config.live,
				self.config.retry.clone(),
			),
			backfill_lock: Mutex::new(()),
		});
		Ok(())
	}

	fn runtime(&self) -> Result<&Runtime, SyncError> {
		self.runtime.as_ref().ok_or(SyncError::NotInitialized)
	}

	/// Backfill `[from, to]`. Concurrent calls run one after another.
	pub async fn sync_range(&self, from: u64, to: BlockTag) -> Result<BackfillReport, SyncError> {
		let runtime = self.runtime()?;
		let _guard = runtime.backfill_lock.lock().await;
		runtime.backfill.sync_range(from, to).await
	}

	/// Open live subscriptions. Feeds that drop later replay from the cursor position onwards.
	pub async fn start_listening(&self) -> Result<(), SyncError> {
		let resume_from = self.resume_block().await?;
		self.runtime()?.live.start(resume_from).await;
		Ok(())
	}

	/// Stop live subscriptions. Safe to call at any time, including before `initialize`.
	pub async fn stop_listening(&self) {
		if let Some(runtime) = &self.runtime {
			runtime.live.stop().await;
		}
	}

	pub async fn health(&self) -> Result<HealthStatus, SyncError> {
		self.runtime()?;
		let mut status = self.health.snapshot().await;
		status.last_processed_block = self.cursor_repo.load().await?.last_processed_block;
		Ok(status)
	}

	/// First block not yet covered by the cursor, or the configured start block.
	pub async fn resume_block(&self) -> Result<u64, SyncError> {
		self.runtime()?;
		let cursor = self.cursor_repo.load().await?;
		Ok(cursor.next_block(self.config.sync.start_block))
	}

	/// Backfill from the cursor (or the configured start block) to the latest block, then listen.
	pub async fn catch_up_and_listen(&self) -> Result<BackfillReport, SyncError> {
		let from = self.resume_block().await?;
		let report = self.sync_range(from, BlockTag::Latest).await?;
		self.start_listening().await?;
		Ok(report)
	}
}
