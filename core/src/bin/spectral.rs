use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use spectral_core::{
	config::{default_data_dir, AppConfig},
	infra::{logging, queue::EntryId},
	Core,
};
use std::path::PathBuf;
use tokio::signal;

#[derive(Parser, Debug)]
#[command(name = "spectral", about = "Offline-first capture sync engine")]
struct Args {
	/// Path to the data directory
	#[arg(long, env = "SPECTRAL_DATA_DIR")]
	data_dir: Option<PathBuf>,

	/// Override the configured API base url
	#[arg(long, env = "SPECTRAL_API_URL")]
	api_url: Option<String>,

	#[command(subcommand)]
	command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
	/// Run the sync engine until interrupted, assuming the network is up
	Run,

	/// Drain the queue once and exit
	Sync,

	/// Print queue totals
	Status,

	/// Inspect and act on dead-lettered entries
	#[command(subcommand)]
	DeadLetters(DeadLetterCommand),

	/// Remove completed entries past the retention window
	Purge,
}

#[derive(Subcommand, Debug)]
enum DeadLetterCommand {
	List,

	/// Give a dead letter a fresh retry budget
	Replay { entry_id: EntryId },

	/// Drop one dead letter, or all of them
	Clear { entry_id: Option<EntryId> },
}

#[tokio::main]
async fn main() -> Result<()> {
	let args = Args::parse();

	let data_dir = match args.data_dir {
		Some(dir) => dir,
		None => default_data_dir()?,
	};

	let mut config = AppConfig::load_from(&data_dir)
		.with_context(|| format!("failed to load config from {}", data_dir.display()))?;
	if let Some(api_url) = args.api_url {
		config.api_url = api_url;
	}

	logging::init(&config.logs_dir(), Some(&config.log_level))?;

	let core = Core::open_with_http(config).await?;

	let result = run(&core, args.command).await;
	core.shutdown().await;

	result
}

async fn run(core: &Core, command: Command) -> Result<()> {
	match command {
		Command::Run => {
			core.start().await?;
			core.connectivity().online();

			println!("Sync engine running, press Ctrl+C to stop");
			wait_for_shutdown().await;
		}

		Command::Sync => {
			core.connectivity().online();
			let report = core.sync().drain_now().await?;
			println!(
				"Drained {} batch(es): {} completed, {} failed, {} dead-lettered",
				report.batches, report.completed, report.failed, report.dead_lettered
			);
		}

		Command::Status => {
			let status = core.status().await?;
			let counts = status.counts;
			println!("records:      {}", core.store().count().await?);
			println!("pending:      {}", counts.pending);
			println!("in flight:    {}", counts.in_flight);
			println!("failed:       {}", counts.failed);
			println!("dead letters: {}", counts.dead_letter);
			println!("completed:    {}", counts.completed);
		}

		Command::DeadLetters(DeadLetterCommand::List) => {
			let dead = core.queue().list_dead_letters().await?;
			if dead.is_empty() {
				println!("No dead letters");
			}

			for entry in dead {
				println!(
					"{}  {:<11} {:<6} {}  attempts={}  {}",
					entry.entry_id,
					entry.record_type,
					entry.action,
					entry.record_local_id,
					entry.attempt_count,
					entry.last_error.as_deref().unwrap_or("-"),
				);
			}
		}

		Command::DeadLetters(DeadLetterCommand::Replay { entry_id }) => {
			core.queue().replay(entry_id).await?;
			println!("Entry {entry_id} queued for replay");
		}

		Command::DeadLetters(DeadLetterCommand::Clear { entry_id: Some(entry_id) }) => {
			core.queue().clear_dead_letter(entry_id).await?;
			println!("Cleared dead letter {entry_id}");
		}

		Command::DeadLetters(DeadLetterCommand::Clear { entry_id: None }) => {
			let cleared = core.queue().clear_dead_letters().await?;
			println!("Cleared {cleared} dead letter(s)");
		}

		Command::Purge => {
			let retention = core.config().sync.completed_retention();
			let purged = core.store().purge_completed(retention).await?;
			println!("Purged {purged} completed entries");
		}
	}

	Ok(())
}

async fn wait_for_shutdown() {
	let ctrl_c = async {
		if let Err(e) = signal::ctrl_c().await {
			eprintln!("Failed to listen for Ctrl+C: {e}");
			std::future::pending::<()>().await;
		}
	};

	#[cfg(unix)]
	let terminate = async {
		match signal::unix::signal(signal::unix::SignalKind::terminate()) {
			Ok(mut sigterm) => {
				sigterm.recv().await;
			}
			Err(_) => std::future::pending::<()>().await,
		}
	};

	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();

	tokio::select! {
		_ = ctrl_c => {}
		_ = terminate => {}
	}
}
