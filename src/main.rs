use clap::Parser;
use relief_ledger_sync::config::Config;
use relief_ledger_sync::ledger::{BlockTag, GraphqlLedgerClient};
use relief_ledger_sync::projection::MemoryStore;
use relief_ledger_sync::sync::{FileCursorRepository, SyncOrchestrator};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Projects relief contract events from the ledger into the document store
#[derive(Parser, Debug)]
#[command(name = "relief-ledger-sync")]
#[command(version, about, long_about = None)]
struct Args {
	/// Path to the configuration file
	#[arg(short, long, env = "RELIEF_SYNC_CONFIG", default_value = "./relief-sync.toml")]
	config: PathBuf,

	/// Backfill from this block instead of the persisted cursor
	#[arg(long)]
	from_block: Option<u64>,

	/// Run one backfill pass to the latest block and exit
	#[arg(long, default_value = "false")]
	backfill_only: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,reqwest=warn")),
		)
		.with_target(false)
		.with_thread_ids(false)
		.with_thread_names(false)
		.with_file(false)
		.with_line_number(false)
		.init();

	let args = Args::parse();
	info!("Starting relief-ledger-sync v{}", env!("CARGO_PKG_VERSION"));

	let config = Config::from_file(&args.config).map_err(|e| {
		error!("Failed to load configuration: {}", e);
		e
	})?;
	info!("Configuration loaded from {:?}", args.config);

	let ledger = Arc::new(GraphqlLedgerClient::new(&config.ledger)?);
	let store = match &config.store.snapshot_path {
		Some(path) => Arc::new(MemoryStore::open(path).await?),
		None => {
			warn!("No store.snapshot_path configured, projections are kept in memory only");
			Arc::new(MemoryStore::new())
		}
	};
	let cursor_repo = Arc::new(FileCursorRepository::new(config.sync.cursor_path.clone()));

	let mut orchestrator = SyncOrchestrator::new(config, ledger, store, cursor_repo);
	orchestrator.initialize().await?;

	if args.backfill_only {
		let from = match args.from_block {
			Some(from) => from,
			None => orchestrator.resume_block().await?,
		};
		let report = orchestrator.sync_range(from, BlockTag::Latest).await?;
		info!("{}", report.stats.summary());
		info!("Backfill complete, exiting");
		return Ok(());
	}

	let report = match args.from_block {
		Some(from) => {
			let report = orchestrator.sync_range(from, BlockTag::Latest).await?;
			orchestrator.start_listening().await?;
			report
		}
		None => orchestrator.catch_up_and_listen().await?,
	};
	info!("{}", report.stats.summary());
	info!("Listening for new events, press Ctrl-C to stop");
	tokio::signal::ctrl_c().await?;

	info!("Shutting down");
	orchestrator.stop_listening().await;
	let health = orchestrator.health().await?;
	if health.is_degraded() {
		warn!(
			"Stopped with {} failed events and {} failed subscriptions",
			health.failed_events_total,
			health.failed_subscriptions.len()
		);
	}
	Ok(())
}
