use crate::config::ConfigError;
use crate::ledger::{EventKind, LedgerError, LogPosition};
use crate::projection::ProjectionWriteError;
use crate::sync::CursorError;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
	#[error("Configuration error: {0}")]
	Config(#[from] ConfigError),

	#[error("Ledger query error: {0}")]
	LedgerQuery(#[from] LedgerError),

	#[error("Projection write error: {0}")]
	ProjectionWrite(#[from] ProjectionWriteError),

	#[error("Cursor error: {0}")]
	Cursor(#[from] CursorError),

	#[error("Initialization failed: {0}")]
	Initialization(String),

	#[error("Sync orchestrator is not initialized")]
	NotInitialized,

	#[error(
		"Backfill of {kind} aborted (last processed: {}): {source}",
		describe_position(.last_processed)
	)]
	BackfillAborted {
		kind: EventKind,
		last_processed: Option<LogPosition>,
		#[source]
		source: Box<SyncError>,
	},

	#[error("Event handler error: {0}")]
	Handler(String),
}

fn describe_position(position: &Option<LogPosition>) -> String {
	match position {
		Some(position) => position.to_string(),
		None => "none".to_string(),
	}
}
