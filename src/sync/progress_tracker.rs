//! Progress tracking for a backfill pass.
//!
//! The tracker counts what happened to each log per event kind and logs progress every
//! [`LOG_INTERVAL_BLOCKS`] blocks. Its [`SyncStats`] end up in the backfill report.

use crate::ledger::EventKind;
use std::collections::BTreeMap;
use tracing::info;

const LOG_INTERVAL_BLOCKS: u64 = 1_000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KindCounts {
	pub applied: usize,
	pub duplicates: usize,
	pub skipped: usize,
}

#[derive(Debug, Clone)]
pub struct SyncProgressTracker {
	start_block: u64,
	/// The highest block we've processed a log from
	highest_processed_block: u64,
	has_processed_data: bool,
	counts: BTreeMap<EventKind, KindCounts>,
	/// Last block at which we logged progress
	last_logged_block: u64,
}

impl SyncProgressTracker {
	pub fn new(start_block: u64) -> Self {
		Self {
			start_block,
			highest_processed_block: start_block,
			has_processed_data: false,
			counts: BTreeMap::new(),
			last_logged_block: start_block,
		}
	}

	fn record_processed(&mut self, kind: EventKind, block: u64) -> &mut KindCounts {
		self.highest_processed_block = self.highest_processed_block.max(block);
		self.has_processed_data = true;
		self.counts.entry(kind).or_default()
	}

	pub fn record_applied(&mut self, kind: EventKind, block: u64) {
		self.record_processed(kind, block).applied += 1;
	}

	pub fn record_duplicate(&mut self, kind: EventKind, block: u64) {
		self.record_processed(kind, block).duplicates += 1;
	}

	pub fn record_skipped(&mut self, kind: EventKind, block: u64) {
		self.record_processed(kind, block).skipped += 1;
	}

	/// Log progress every 1000 blocks or when forced
	pub fn log_progress(&mut self, force: bool) {
		let blocks_since_last_log = self
			.highest_processed_block
			.saturating_sub(self.last_logged_block);
		let should_log = force || blocks_since_last_log >= LOG_INTERVAL_BLOCKS;

		if should_log && self.has_processed_data {
			let totals = self.totals();
			info!(
				"Sync progress: {} applied, {} duplicates, {} skipped up to block {}",
				totals.applied, totals.duplicates, totals.skipped, self.highest_processed_block
			);
			self.last_logged_block = self.highest_processed_block;
		}
	}

	fn totals(&self) -> KindCounts {
		self.counts.values().fold(KindCounts::default(), |acc, c| KindCounts {
			applied: acc.applied + c.applied,
			duplicates: acc.duplicates + c.duplicates,
			skipped: acc.skipped + c.skipped,
		})
	}

	pub fn get_stats(&self) -> SyncStats {
		SyncStats {
			start_block: self.start_block,
			highest_processed_block: self.highest_processed_block,
			has_processed_data: self.has_processed_data,
			per_kind: self.counts.clone(),
			totals: self.totals(),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStats {
	pub start_block: u64,
	pub highest_processed_block: u64,
	pub has_processed_data: bool,
	pub per_kind: BTreeMap<EventKind, KindCounts>,
	pub totals: KindCounts,
}

impl SyncStats {
	/// Get a human-readable summary of the sync statistics
	pub fn summary(&self) -> String {
		format!(
			"Sync from block {} to {}: {} applied, {} duplicates, {} skipped across {} event kinds",
			self.start_block,
			self.highest_processed_block,
			self.totals.applied,
			self.totals.duplicates,
			self.totals.skipped,
			self.per_kind.len()
		)
	}
}
