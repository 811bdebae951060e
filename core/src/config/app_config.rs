//! Application configuration

use super::{default_data_dir, ConfigError};
use serde::{Deserialize, Serialize};
use std::{
	fs,
	path::{Path, PathBuf},
	time::Duration,
};
use tracing::{info, warn};

/// File name of the config inside the data directory
pub const CONFIG_FILE: &str = "spectral.json";

/// Schema version written by this build
pub const CONFIG_VERSION: u32 = 1;

/// Main application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
	/// Config schema version
	pub version: u32,

	/// Data directory path
	pub data_dir: PathBuf,

	/// Logging level
	pub log_level: String,

	/// Base URL of the capture API
	pub api_url: String,

	#[serde(default)]
	pub sync: SyncConfig,
}

/// Tuning for the drain scheduler and the queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
	/// Entries claimed per batch
	pub batch_size: usize,

	/// Parallel sends within a batch
	pub max_concurrency: usize,

	/// Failed attempts before an entry is dead-lettered
	pub max_retries: u32,

	/// Delay between a reconnect and the drain it triggers
	pub debounce_ms: u64,

	/// Pause between batches of one drain
	pub cooldown_ms: u64,

	/// Periodic drain while online
	pub tick_interval_secs: u64,

	/// How long completed entries are kept for auditing
	pub completed_retention_hours: u64,

	pub pruning_interval_secs: u64,

	pub request_timeout_secs: u64,
}

impl Default for SyncConfig {
	fn default() -> Self {
		Self {
			batch_size: 10,
			max_concurrency: 10,
			max_retries: 3,
			debounce_ms: 1000,
			cooldown_ms: 500,
			tick_interval_secs: 30,
			completed_retention_hours: 24,
			pruning_interval_secs: 3600,
			request_timeout_secs: 30,
		}
	}
}

impl SyncConfig {
	pub fn debounce(&self) -> Duration {
		Duration::from_millis(self.debounce_ms)
	}

	pub fn cooldown(&self) -> Duration {
		Duration::from_millis(self.cooldown_ms)
	}

	pub fn tick_interval(&self) -> Duration {
		Duration::from_secs(self.tick_interval_secs.max(1))
	}

	pub fn pruning_interval(&self) -> Duration {
		Duration::from_secs(self.pruning_interval_secs.max(1))
	}

	pub fn request_timeout(&self) -> Duration {
		Duration::from_secs(self.request_timeout_secs)
	}

	pub fn completed_retention(&self) -> chrono::Duration {
		i64::try_from(self.completed_retention_hours)
			.ok()
			.and_then(chrono::Duration::try_hours)
			.unwrap_or(chrono::Duration::MAX)
	}

	pub fn validate(&self) -> Result<(), ConfigError> {
		let positive = [
			("batch_size", self.batch_size == 0),
			("max_concurrency", self.max_concurrency == 0),
			("max_retries", self.max_retries == 0),
			("request_timeout_secs", self.request_timeout_secs == 0),
		];

		match positive.into_iter().find(|(_, is_zero)| *is_zero) {
			Some((field, _)) => Err(ConfigError::Invalid {
				field,
				reason: "must be greater than zero".to_string(),
			}),
			None => Ok(()),
		}
	}
}

impl AppConfig {
	/// Load configuration from the default location
	pub fn load() -> Result<Self, ConfigError> {
		let data_dir = default_data_dir()?;
		Self::load_from(&data_dir)
	}

	/// Load configuration from a specific data directory, creating a default
	/// one if none exists
	pub fn load_from(data_dir: &Path) -> Result<Self, ConfigError> {
		let config_path = data_dir.join(CONFIG_FILE);

		if !config_path.exists() {
			warn!(path = %config_path.display(), "No config found, creating default");
			let config = Self::default_with_dir(data_dir.to_path_buf());
			config.save()?;
			return Ok(config);
		}

		info!(path = %config_path.display(), "Loading config");
		let json = fs::read_to_string(&config_path).map_err(|e| ConfigError::io(&config_path, e))?;
		let config: AppConfig = serde_json::from_str(&json)?;

		if config.version > CONFIG_VERSION {
			return Err(ConfigError::UnknownVersion(config.version));
		}

		config.validate()?;

		Ok(config)
	}

	/// Create default configuration with specific data directory
	pub fn default_with_dir(data_dir: PathBuf) -> Self {
		Self {
			version: CONFIG_VERSION,
			data_dir,
			log_level: "info".to_string(),
			api_url: "http://localhost:3000/api".to_string(),
			sync: SyncConfig::default(),
		}
	}

	/// Save configuration to disk
	pub fn save(&self) -> Result<(), ConfigError> {
		fs::create_dir_all(&self.data_dir).map_err(|e| ConfigError::io(&self.data_dir, e))?;

		let config_path = self.data_dir.join(CONFIG_FILE);
		let json = serde_json::to_string_pretty(self)?;
		fs::write(&config_path, json).map_err(|e| ConfigError::io(&config_path, e))?;

		info!(path = %config_path.display(), "Saved config");

		Ok(())
	}

	pub fn logs_dir(&self) -> PathBuf {
		self.data_dir.join("logs")
	}

	pub fn validate(&self) -> Result<(), ConfigError> {
		if !(self.api_url.starts_with("http://") || self.api_url.starts_with("https://")) {
			return Err(ConfigError::Invalid {
				field: "api_url",
				reason: format!("'{}' is not an http(s) url", self.api_url),
			});
		}

		self.sync.validate()
	}
}
