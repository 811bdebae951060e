//! Test helper modules for integration tests

#![allow(dead_code)]

pub mod mock_transport;

pub use mock_transport::*;

use spectral_core::{
	config::AppConfig,
	infra::db::DATABASE_FILE,
	service::sync::Transport,
	Core,
};
use sqlx::{sqlite::SqliteConnectOptions, SqlitePool};
use std::{future::Future, path::Path, sync::Arc, time::Duration};

/// Config with timings short enough for tests. Periodic ticks and pruning are
/// pushed out of the way.
pub fn test_config(data_dir: &Path) -> AppConfig {
	let mut config = AppConfig::default_with_dir(data_dir.to_path_buf());
	config.sync.debounce_ms = 20;
	config.sync.cooldown_ms = 10;
	config.sync.tick_interval_secs = 3600;
	config.sync.pruning_interval_secs = 3600;
	config
}

pub async fn open_core(config: AppConfig, transport: Arc<dyn Transport>) -> Core {
	Core::open(config, transport)
		.await
		.expect("failed to open core")
}

/// Separate connection to the engine's database, for interfering with it
/// from outside the engine
pub async fn side_channel(data_dir: &Path) -> SqlitePool {
	SqlitePool::connect_with(SqliteConnectOptions::new().filename(data_dir.join(DATABASE_FILE)))
		.await
		.expect("failed to open side channel")
}

/// Poll `condition` until it holds, panicking after five seconds
pub async fn wait_until<F, Fut>(what: &str, mut condition: F)
where
	F: FnMut() -> Fut,
	Fut: Future<Output = bool>,
{
	let deadline = tokio::time::Instant::now() + Duration::from_secs(5);

	while !condition().await {
		assert!(
			tokio::time::Instant::now() < deadline,
			"timed out waiting until {what}"
		);
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
}
