//! Persisted sync cursor.
//!
//! `last_processed_block` only moves after a complete backfill pass over every tracked kind. While
//! a pass is in progress, each kind records a checkpoint after every finished batch so an
//! interrupted pass can skip the batches it already applied.

use crate::ledger::EventKind;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum CursorError {
	#[error("cursor I/O error on {path:?}: {source}")]
	Io {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("corrupt cursor file {path:?}: {source}")]
	Corrupt {
		path: PathBuf,
		#[source]
		source: serde_json::Error,
	},
}

/// Per-kind progress inside an unfinished pass that started at `range_start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KindCheckpoint {
	pub kind: EventKind,
	pub range_start: u64,
	pub through_block: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCursor {
	pub last_processed_block: Option<u64>,
	#[serde(default)]
	pub checkpoints: Vec<KindCheckpoint>,
	#[serde(default)]
	pub updated_at: Option<DateTime<Utc>>,
}

impl SyncCursor {
	/// First block a catch-up should start from.
	pub fn next_block(&self, start_block: u64) -> u64 {
		self.last_processed_block
			.map_or(start_block, |block| block.saturating_add(1).max(start_block))
	}

	/// Where a pass starting at `from` should resume for `kind`.
	pub fn resume_point(&self, kind: EventKind, from: u64) -> u64 {
		self.checkpoints
			.iter()
			.find(|c| c.kind == kind && c.range_start <= from && from <= c.through_block)
			.map_or(from, |c| c.through_block + 1)
	}

	pub fn record_checkpoint(&mut self, kind: EventKind, range_start: u64, through_block: u64) {
		self.checkpoints.retain(|c| c.kind != kind);
		self.checkpoints.push(KindCheckpoint {
			kind,
			range_start,
			through_block,
		});
		self.updated_at = Some(Utc::now());
	}

	/// Close a full pass through `to`: advance the cursor and drop the checkpoints.
	pub fn complete_pass(&mut self, to: u64) {
		self.last_processed_block = Some(self.last_processed_block.map_or(to, |b| b.max(to)));
		self.checkpoints.clear();
		self.updated_at = Some(Utc::now());
	}
}

#[async_trait]
pub trait CursorRepository: Send + Sync {
	async fn load(&self) -> Result<SyncCursor, CursorError>;
	async fn save(&self, cursor: &SyncCursor) -> Result<(), CursorError>;
}

/// JSON file, replaced atomically on every save.
pub struct FileCursorRepository {
	path: PathBuf,
}

impl FileCursorRepository {
	pub fn new(path: PathBuf) -> Self {
		Self { path }
	}

	fn io_error(&self, source: std::io::Error) -> CursorError {
		CursorError::Io {
			path: self.path.clone(),
			source,
		}
	}
}

#[async_trait]
impl CursorRepository for FileCursorRepository {
	async fn load(&self) -> Result<SyncCursor, CursorError> {
		let exists = tokio::fs::try_exists(&self.path)
			.await
			.map_err(|e| self.io_error(e))?;
		if !exists {
			info!("No sync cursor at {:?}, starting fresh", self.path);
			return Ok(SyncCursor::default());
		}

		let content = tokio::fs::read(&self.path)
			.await
			.map_err(|e| self.io_error(e))?;
		let cursor: SyncCursor =
			serde_json::from_slice(&content).map_err(|source| CursorError::Corrupt {
				path: self.path.clone(),
				source,
			})?;
		info!(
			"Loaded sync cursor from {:?}: last processed block {:?}, {} checkpoints",
			self.path,
			cursor.last_processed_block,
			cursor.checkpoints.len()
		);
		Ok(cursor)
	}

	async fn save(&self, cursor: &SyncCursor) -> Result<(), CursorError> {
		if let Some(parent) = self.path.parent() {
			if !parent.as_os_str().is_empty() {
				tokio::fs::create_dir_all(parent)
					.await
					.map_err(|e| self.io_error(e))?;
			}
		}

		let content = serde_json::to_vec_pretty(cursor).map_err(|source| CursorError::Corrupt {
			path: self.path.clone(),
			source,
		})?;
		let tmp = self.path.with_extension("tmp");
		tokio::fs::write(&tmp, &content)
			.await
			.map_err(|e| self.io_error(e))?;
		tokio::fs::rename(&tmp, &self.path)
			.await
			.map_err(|e| self.io_error(e))?;

		debug!("Saved sync cursor to {:?}", self.path);
		Ok(())
	}
}

/// Cursor kept in memory, for tests and hosts that persist progress elsewhere.
#[derive(Default)]
pub struct MemoryCursorRepository {
	cursor: Mutex<SyncCursor>,
}

impl MemoryCursorRepository {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn current(&self) -> SyncCursor {
		self.cursor
			.lock()
			.unwrap_or_else(std::sync::PoisonError::into_inner)
			.clone()
	}
}

#[async_trait]
impl CursorRepository for MemoryCursorRepository {
	async fn load(&self) -> Result<SyncCursor, CursorError> {
		Ok(self.current())
	}

	async fn save(&self, cursor: &SyncCursor) -> Result<(), CursorError> {
		*self
			.cursor
			.lock()
			.unwrap_or_else(std::sync::PoisonError::into_inner) = cursor.clone();
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn next_block_follows_cursor() {
		let mut cursor = SyncCursor::default();
		assert_eq!(cursor.next_block(50), 50);
		cursor.complete_pass(80);
		assert_eq!(cursor.next_block(50), 81);
		cursor.complete_pass(60);
		assert_eq!(cursor.last_processed_block, Some(80));
	}

	#[test]
	fn checkpoints_cover_only_their_range() {
		let mut cursor = SyncCursor::default();
		cursor.record_checkpoint(EventKind::FundsDistributed, 100, 149);

		assert_eq!(cursor.resume_point(EventKind::FundsDistributed, 100), 150);
		assert_eq!(cursor.resume_point(EventKind::FundsDonated, 100), 100);
		assert_eq!(cursor.resume_point(EventKind::FundsDistributed, 90), 90);
		assert_eq!(cursor.resume_point(EventKind::FundsDistributed, 160), 160);

		cursor.complete_pass(200);
		assert!(cursor.checkpoints.is_empty());
	}

	#[tokio::test]
	async fn file_repository_round_trips() {
		let dir = tempfile::tempdir().expect("tempdir");
		let repo = FileCursorRepository::new(dir.path().join("state").join("cursor.json"));

		assert_eq!(repo.load().await.expect("empty load"), SyncCursor::default());

		let mut cursor = SyncCursor::default();
		cursor.record_checkpoint(EventKind::VendorWhitelisted, 10, 19);
		repo.save(&cursor).await.expect("save");

		let loaded = repo.load().await.expect("load");
		assert_eq!(loaded.checkpoints, cursor.checkpoints);
		assert_eq!(loaded.last_processed_block, None);
	}

	#[tokio::test]
	async fn corrupt_file_is_reported() {
		let dir = tempfile::tempdir().expect("tempdir");
		let path = dir.path().join("cursor.json");
		std::fs::write(&path, b"not json").expect("write");

		let err = FileCursorRepository::new(path)
			.load()
			.await
			.expect_err("corrupt");
		assert!(matches!(err, CursorError::Corrupt { .. }));
	}
}
