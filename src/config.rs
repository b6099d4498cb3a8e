//! TOML configuration for the sync service.
//!
//! Only `[ledger]` is required; every other section falls back to defaults.

use crate::ledger::EventKind;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
	#[error("failed to read config file {path:?}: {source}")]
	Io {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("failed to parse config: {0}")]
	Parse(#[from] toml::de::Error),

	#[error("invalid config: {0}")]
	Invalid(String),
}

/// Root configuration structure as read from the TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
	pub ledger: LedgerConfig,
	#[serde(default)]
	pub sync: SyncSettings,
	#[serde(default)]
	pub retry: RetryConfig,
	#[serde(default)]
	pub live: LiveConfig,
	#[serde(default)]
	pub store: StoreConfig,
}

/// Ledger event gateway connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
	/// GraphQL HTTP endpoint used for range queries.
	pub http_url: String,
	/// GraphQL WebSocket endpoint used for live subscriptions.
	pub ws_url: String,
	/// Address of the relief contract.
	pub contract_address: String,
	#[serde(default = "default_request_timeout_secs")]
	pub request_timeout_secs: u64,
	#[serde(default = "default_page_size")]
	pub page_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
	/// First block to backfill when no cursor has been persisted.
	#[serde(default)]
	pub start_block: u64,
	/// Blocks per backfill query.
	#[serde(default = "default_batch_size")]
	pub batch_size: u64,
	#[serde(default = "default_tracked_events")]
	pub tracked_events: Vec<EventKind>,
	#[serde(default = "default_cursor_path")]
	pub cursor_path: PathBuf,
	/// Blocks behind head that `latest` resolves to.
	#[serde(default)]
	pub confirmation_depth: u64,
	/// Upper bound for a single ledger query, including internal pagination.
	#[serde(default = "default_query_timeout_secs")]
	pub query_timeout_secs: u64,
	/// Decimals used when amounts are written to logs.
	#[serde(default = "default_token_decimals")]
	pub token_decimals: u32,
}

impl Default for SyncSettings {
	fn default() -> Self {
		Self {
			start_block: 0,
			batch_size: default_batch_size(),
			tracked_events: default_tracked_events(),
			cursor_path: default_cursor_path(),
			confirmation_depth: 0,
			query_timeout_secs: default_query_timeout_secs(),
			token_decimals: default_token_decimals(),
		}
	}
}

impl SyncSettings {
	pub fn query_timeout(&self) -> Duration {
		Duration::from_secs(self.query_timeout_secs)
	}
}

/// Exponential backoff applied to ledger queries, projection writes and resubscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
	#[serde(default = "default_initial_interval_ms")]
	pub initial_interval_ms: u64,
	#[serde(default = "default_max_interval_ms")]
	pub max_interval_ms: u64,
	#[serde(default = "default_multiplier")]
	pub multiplier: f64,
	/// Total time budget before a failure is considered permanent.
	#[serde(default = "default_max_elapsed_ms")]
	pub max_elapsed_ms: u64,
}

impl Default for RetryConfig {
	fn default() -> Self {
		Self {
			initial_interval_ms: default_initial_interval_ms(),
			max_interval_ms: default_max_interval_ms(),
			multiplier: default_multiplier(),
			max_elapsed_ms: default_max_elapsed_ms(),
		}
	}
}

impl RetryConfig {
	pub fn backoff(&self) -> ExponentialBackoff {
		ExponentialBackoffBuilder::new()
			.with_initial_interval(Duration::from_millis(self.initial_interval_ms))
			.with_max_interval(Duration::from_millis(self.max_interval_ms))
			.with_multiplier(self.multiplier)
			.with_max_elapsed_time(Some(Duration::from_millis(self.max_elapsed_ms)))
			.build()
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveConfig {
	/// Consecutive failed (re)subscriptions tolerated per event kind.
	#[serde(default = "default_max_resubscribe_attempts")]
	pub max_resubscribe_attempts: u32,
	/// Upper bound for opening one subscription. A timeout counts as a failed attempt.
	#[serde(default = "default_subscribe_timeout_ms")]
	pub subscribe_timeout_ms: u64,
	/// A feed silent for this long is re-opened and the quiet period replayed. `0` disables it.
	#[serde(default = "default_idle_timeout_ms")]
	pub idle_timeout_ms: u64,
}

impl Default for LiveConfig {
	fn default() -> Self {
		Self {
			max_resubscribe_attempts: default_max_resubscribe_attempts(),
			subscribe_timeout_ms: default_subscribe_timeout_ms(),
			idle_timeout_ms: default_idle_timeout_ms(),
		}
	}
}

impl LiveConfig {
	pub fn subscribe_timeout(&self) -> Duration {
		Duration::from_millis(self.subscribe_timeout_ms)
	}

	pub fn idle_timeout(&self) -> Option<Duration> {
		(self.idle_timeout_ms > 0).then(|| Duration::from_millis(self.idle_timeout_ms))
	}
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
	/// Where the document snapshot is persisted. In-memory only when unset.
	#[serde(default)]
	pub snapshot_path: Option<PathBuf>,
}

fn default_request_timeout_secs() -> u64 {
	30
}

fn default_page_size() -> u32 {
	500
}

fn default_batch_size() -> u64 {
	2_000
}

fn default_tracked_events() -> Vec<EventKind> {
	EventKind::ALL.to_vec()
}

fn default_cursor_path() -> PathBuf {
	PathBuf::from("./data/sync-cursor.json")
}

fn default_query_timeout_secs() -> u64 {
	60
}

fn default_token_decimals() -> u32 {
	18
}

fn default_initial_interval_ms() -> u64 {
	200
}

fn default_max_interval_ms() -> u64 {
	5_000
}

fn default_multiplier() -> f64 {
	2.0
}

fn default_max_elapsed_ms() -> u64 {
	30_000
}

fn default_max_resubscribe_attempts() -> u32 {
	5
}

fn default_subscribe_timeout_ms() -> u64 {
	30_000
}

fn default_idle_timeout_ms() -> u64 {
	600_000
}

impl Config {
	/// Configuration with defaults for everything except the ledger connection.
	pub fn new(ledger: LedgerConfig) -> Self {
		Self {
			ledger,
			sync: SyncSettings::default(),
			retry: RetryConfig::default(),
			live: LiveConfig::default(),
			store: StoreConfig::default(),
		}
	}

	pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
		let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
			path: path.to_path_buf(),
			source,
		})?;
		Self::from_toml_str(&content)
	}

	pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
		let mut config: Config = toml::from_str(content)?;
		config.sync.tracked_events = dedup_preserving_order(&config.sync.tracked_events);
		config.validate()?;
		Ok(config)
	}

	pub fn validate(&self) -> Result<(), ConfigError> {
		let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

		if self.ledger.http_url.trim().is_empty() || self.ledger.ws_url.trim().is_empty() {
			return invalid("ledger.http_url and ledger.ws_url are required");
		}
		if self.ledger.contract_address.trim().is_empty() {
			return invalid("ledger.contract_address is required");
		}
		if self.ledger.page_size == 0 {
			return invalid("ledger.page_size must be greater than zero");
		}
		if self.sync.batch_size == 0 {
			return invalid("sync.batch_size must be greater than zero");
		}
		if self.sync.tracked_events.is_empty() {
			return invalid("sync.tracked_events must name at least one event");
		}
		if self.sync.query_timeout_secs == 0 {
			return invalid("sync.query_timeout_secs must be greater than zero");
		}
		if self.live.subscribe_timeout_ms == 0 {
			return invalid("live.subscribe_timeout_ms must be greater than zero");
		}
		if self.retry.multiplier < 1.0 {
			return invalid("retry.multiplier must be at least 1.0");
		}
		if self.retry.initial_interval_ms > self.retry.max_interval_ms {
			return invalid("retry.initial_interval_ms must not exceed retry.max_interval_ms");
		}
		Ok(())
	}
}

fn dedup_preserving_order(kinds: &[EventKind]) -> Vec<EventKind> {
	let mut seen = Vec::with_capacity(kinds.len());
	for kind in kinds {
		if !seen.contains(kind) {
			seen.push(*kind);
		}
	}
	seen
}
