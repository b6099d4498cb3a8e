//! Live subscriptions, one task per tracked event kind.
//!
//! Every task owns its subscription stream and pushes delivered logs through the shared pipeline.
//! A dropped, failing or silent stream is re-opened with exponential backoff, and the blocks it may
//! have missed are replayed from the ledger before the kind counts as restored. After
//! `max_resubscribe_attempts` consecutive failures the task gives up and the kind is reported as
//! failed. Shutdown is signalled through a watch channel and only interrupts waiting, never a
//! mutation in progress.

use super::backfill::bounded_query;
use super::events::{DeliverySource, SyncEvent};
use super::pipeline::EventPipeline;
use crate::config::{LiveConfig, RetryConfig, SyncSettings};
use crate::ledger::{EventKind, LedgerClient, LedgerError, LogStream, RawLog};
use backoff::backoff::Backoff;
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum SubscriptionError {
	#[error("failed to subscribe to {kind}: {source}")]
	Subscribe {
		kind: EventKind,
		#[source]
		source: LedgerError,
	},

	#[error("{kind} feed failed: {source}")]
	Feed {
		kind: EventKind,
		#[source]
		source: LedgerError,
	},

	#[error("{kind} feed ended")]
	Ended { kind: EventKind },

	#[error("{kind} feed silent for {after:?}")]
	Idle { kind: EventKind, after: Duration },

	#[error("failed to replay missed {kind} blocks: {source}")]
	Replay {
		kind: EventKind,
		#[source]
		source: LedgerError,
	},
}

enum ManagerState {
	Stopped,
	Listening {
		shutdown: watch::Sender<bool>,
		tasks: Vec<JoinHandle<()>>,
	},
}

pub struct LiveSubscriptionManager {
	ledger: Arc<dyn LedgerClient>,
	pipeline: Arc<EventPipeline>,
	kinds: Vec<EventKind>,
	retry: RetryConfig,
	max_attempts: u32,
	subscribe_timeout: Duration,
	idle_timeout: Option<Duration>,
	query_timeout: Duration,
	batch_size: u64,
	state: Mutex<ManagerState>,
}

impl LiveSubscriptionManager {
	pub fn new(
		ledger: Arc<dyn LedgerClient>,
		pipeline: Arc<EventPipeline>,
		settings: &SyncSettings,
		live: &LiveConfig,
		retry: RetryConfig,
	) -> Self {
		Self {
			ledger,
			pipeline,
			kinds: settings.tracked_events.clone(),
			retry,
			max_attempts: live.max_resubscribe_attempts.max(1),
			subscribe_timeout: live.subscribe_timeout(),
			idle_timeout: live.idle_timeout(),
			query_timeout: settings.query_timeout(),
			batch_size: settings.batch_size.max(1),
			state: Mutex::new(ManagerState::Stopped),
		}
	}

	/// Open one subscription task per tracked kind. No-op while already listening.
	///
	/// `resume_from` is the first block not yet covered by backfill; a feed lost before it
	/// delivered anything replays from there.
	pub async fn start(&self, resume_from: u64) {
		let mut state = self.state.lock().await;
		if matches!(*state, ManagerState::Listening { .. }) {
			debug!("Live subscriptions already running");
			return;
		}

		// Announce before spawning so early failures are not cleared by it
		self.pipeline
			.dispatcher()
			.dispatch(&SyncEvent::ListeningChanged(true))
			.await;

		let (shutdown, shutdown_rx) = watch::channel(false);
		let tasks = self
			.kinds
			.iter()
			.map(|&kind| {
				let worker = SubscriptionWorker {
					kind,
					ledger: self.ledger.clone(),
					pipeline: self.pipeline.clone(),
					retry: self.retry.clone(),
					max_attempts: self.max_attempts,
					subscribe_timeout: self.subscribe_timeout,
					idle_timeout: self.idle_timeout,
					query_timeout: self.query_timeout,
					batch_size: self.batch_size,
					watermark: resume_from,
					shutdown: shutdown_rx.clone(),
				};
				tokio::spawn(worker.run())
			})
			.collect();

		*state = ManagerState::Listening { shutdown, tasks };
		info!("Listening for {} event kinds", self.kinds.len());
	}

	/// Signal every task to stop and wait for them. No-op while stopped.
	pub async fn stop(&self) {
		let mut state = self.state.lock().await;
		let ManagerState::Listening { shutdown, tasks } =
			std::mem::replace(&mut *state, ManagerState::Stopped)
		else {
			debug!("Live subscriptions already stopped");
			return;
		};

		// Tasks that already gave up have dropped their receivers
		let _ = shutdown.send(true);
		for task in tasks {
			if let Err(e) = task.await {
				error!("Subscription task panicked: {}", e);
			}
		}

		info!("Stopped live subscriptions");
		self.pipeline
			.dispatcher()
			.dispatch(&SyncEvent::ListeningChanged(false))
			.await;
	}

	pub async fn is_listening(&self) -> bool {
		matches!(*self.state.lock().await, ManagerState::Listening { .. })
	}
}

struct SubscriptionWorker {
	kind: EventKind,
	ledger: Arc<dyn LedgerClient>,
	pipeline: Arc<EventPipeline>,
	retry: RetryConfig,
	max_attempts: u32,
	subscribe_timeout: Duration,
	idle_timeout: Option<Duration>,
	query_timeout: Duration,
	batch_size: u64,
	/// Lowest block the feed may have missed. Replays start here.
	watermark: u64,
	shutdown: watch::Receiver<bool>,
}

impl SubscriptionWorker {
	async fn run(mut self) {
		let mut backoff = self.retry.backoff();
		let mut failures = 0u32;
		let mut interrupted = false;

		loop {
			if *self.shutdown.borrow() {
				return;
			}

			let subscribe_timeout = self.subscribe_timeout;
			let subscribed = tokio::select! {
				_ = self.shutdown.changed() => return,
				result = tokio::time::timeout(subscribe_timeout, self.ledger.subscribe(self.kind)) => {
					match result {
						Ok(subscribed) => subscribed,
						Err(_) => Err(LedgerError::Timeout(subscribe_timeout)),
					}
				}
			};

			let lost = match subscribed {
				Ok(mut stream) => {
					info!("Subscribed to {} events", self.kind);
					// The new feed buffers while missed blocks are replayed
					let replayed = if interrupted {
						self.replay_missed().await
					} else {
						Ok(None)
					};
					match replayed {
						Ok(replayed) => {
							if interrupted {
								self.pipeline
									.dispatcher()
									.dispatch(&SyncEvent::SubscriptionRestored {
										kind: self.kind,
										replayed,
									})
									.await;
							}
							failures = 0;
							backoff.reset();
							match self.consume(&mut stream).await {
								None => return,
								Some(SubscriptionError::Idle { after, .. }) => {
									info!("{} feed silent for {:?}, re-opening", self.kind, after);
									interrupted = true;
									continue;
								}
								Some(lost) => lost,
							}
						}
						Err(lost) => lost,
					}
				}
				Err(source) => SubscriptionError::Subscribe {
					kind: self.kind,
					source,
				},
			};

			interrupted = true;
			failures += 1;
			let gave_up = failures >= self.max_attempts;
			if gave_up {
				error!(
					"Giving up on {} subscription after {} attempts: {}",
					self.kind, failures, lost
				);
			} else {
				warn!(
					"{} subscription lost (attempt {}/{}): {}",
					self.kind, failures, self.max_attempts, lost
				);
			}
			self.pipeline
				.dispatcher()
				.dispatch(&SyncEvent::SubscriptionLost {
					kind: self.kind,
					error: lost.to_string(),
					attempt: failures,
					gave_up,
				})
				.await;
			if gave_up {
				return;
			}

			let wait = backoff
				.next_backoff()
				.unwrap_or(Duration::from_millis(self.retry.max_interval_ms));
			tokio::select! {
				_ = self.shutdown.changed() => return,
				_ = tokio::time::sleep(wait) => {}
			}
		}
	}

	/// Apply every log of this kind from the watermark through the current head.
	async fn replay_missed(&mut self) -> Result<Option<(u64, u64)>, SubscriptionError> {
		let kind = self.kind;
		let replay_error = |source| SubscriptionError::Replay { kind, source };

		let head = bounded_query(&self.retry, self.query_timeout, "latest block query", || {
			self.ledger.latest_block()
		})
		.await
		.map_err(replay_error)?;
		let from = self.watermark;
		if from > head {
			return Ok(None);
		}

		let mut batch_start = from;
		while batch_start <= head {
			let batch_end = batch_start.saturating_add(self.batch_size - 1).min(head);
			let what = format!("{} replay of blocks {}..={}", kind, batch_start, batch_end);
			let logs = bounded_query(&self.retry, self.query_timeout, &what, || {
				self.ledger.query_events(kind, batch_start, batch_end)
			})
			.await
			.map_err(replay_error)?;
			for raw in &logs {
				self.handle(raw, DeliverySource::Replay).await;
			}
			if batch_end == u64::MAX {
				break;
			}
			batch_start = batch_end + 1;
		}

		info!("Replayed {} blocks {}..={}", kind, from, head);
		Ok(Some((from, head)))
	}

	async fn handle(&mut self, raw: &RawLog, source: DeliverySource) {
		match self.pipeline.process(raw, source).await {
			Ok(_) => self.watermark = self.watermark.max(raw.block_number),
			// Failures are already reported through the dispatcher
			Err(e) => debug!("{} {} event not applied: {}", source, self.kind, e),
		}
	}

	/// Drain `stream` until it fails, goes silent or shutdown is signalled (`None`).
	async fn consume(&mut self, stream: &mut LogStream) -> Option<SubscriptionError> {
		let idle_timeout = self.idle_timeout;
		loop {
			let next = tokio::select! {
				_ = self.shutdown.changed() => return None,
				item = next_within(stream, idle_timeout) => item,
			};

			match next {
				Some(Some(Ok(raw))) => self.handle(&raw, DeliverySource::Live).await,
				Some(Some(Err(source))) => {
					return Some(SubscriptionError::Feed {
						kind: self.kind,
						source,
					});
				}
				Some(None) => return Some(SubscriptionError::Ended { kind: self.kind }),
				None => {
					return Some(SubscriptionError::Idle {
						kind: self.kind,
						after: idle_timeout.unwrap_or_default(),
					});
				}
			}
		}
	}
}

/// Next stream item, or `None` when nothing arrived within `idle_timeout`.
async fn next_within(
	stream: &mut LogStream,
	idle_timeout: Option<Duration>,
) -> Option<Option<Result<RawLog, LedgerError>>> {
	match idle_timeout {
		Some(limit) => tokio::time::timeout(limit, stream.next()).await.ok(),
		None => Some(stream.next().await),
	}
}
