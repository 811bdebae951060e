use anyhow::{anyhow, Context};
use std::{path::Path, sync::Once};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Name of the daily rotated log file inside the logs directory
pub const LOG_FILE: &str = "spectral.log";

/// Filter used when neither `RUST_LOG` nor a configured level is set
pub const DEFAULT_FILTER: &str = "spectral_core=info,spectral=info";

/// Initialize tracing to stdout and to `{logs_dir}/spectral.log`.
///
/// `RUST_LOG` wins over `level`. Only the first call has any effect.
pub fn init(logs_dir: &Path, level: Option<&str>) -> anyhow::Result<()> {
	static INIT: Once = Once::new();
	let mut result = Ok(());

	INIT.call_once(|| {
		result = install(logs_dir, level);
	});

	result
}

fn install(logs_dir: &Path, level: Option<&str>) -> anyhow::Result<()> {
	std::fs::create_dir_all(logs_dir)
		.with_context(|| format!("failed to create logs directory {}", logs_dir.display()))?;

	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
		EnvFilter::new(
			level
				.map(|level| format!("spectral_core={level},spectral={level}"))
				.unwrap_or_else(|| DEFAULT_FILTER.to_string()),
		)
	});

	let file_appender = RollingFileAppender::new(Rotation::DAILY, logs_dir, LOG_FILE);

	tracing_subscriber::registry()
		.with(filter)
		.with(
			fmt::layer()
				.with_target(true)
				.with_thread_ids(true)
				.with_writer(std::io::stdout),
		)
		.with(
			fmt::layer()
				.with_target(true)
				.with_thread_ids(true)
				.with_ansi(false)
				.with_writer(file_appender),
		)
		.try_init()
		.map_err(|e| anyhow!("failed to initialize tracing: {e}"))
}
