//! Ledger to projection synchronization: backfill, live subscriptions and their orchestration.

/// Historical catch-up
pub mod backfill;
/// Persisted sync cursor and per-kind checkpoints
pub mod cursor;
/// Sync notifications and handlers
pub mod events;
/// Health snapshot
pub mod health;
/// Live subscriptions
pub mod live;
/// Orchestrator
pub mod orchestrator;
/// Decode and apply
pub mod pipeline;
/// Per-pass counters
pub mod progress_tracker;

pub use backfill::{BackfillCoordinator, BackfillReport};
pub use cursor::{
	CursorError, CursorRepository, FileCursorRepository, KindCheckpoint, MemoryCursorRepository,
	SyncCursor,
};
pub use events::{DeliverySource, EventDispatcher, SyncEvent, SyncEventHandler};
pub use health::{FailedEvent, HealthRecorder, HealthStatus};
pub use live::{LiveSubscriptionManager, SubscriptionError};
pub use orchestrator::SyncOrchestrator;
pub use pipeline::{EventPipeline, ProcessOutcome};
pub use progress_tracker::{KindCounts, SyncProgressTracker, SyncStats};
