//! Application configuration management

use std::{fs, path::PathBuf};
use thiserror::Error;

pub mod app_config;

pub use app_config::{AppConfig, SyncConfig, CONFIG_FILE, CONFIG_VERSION};

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("could not determine the platform data directory")]
	NoDataDir,

	#[error("config io error at {path}: {source}")]
	Io {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("malformed config file: {0}")]
	Malformed(#[from] serde_json::Error),

	#[error("unknown config version {0}")]
	UnknownVersion(u32),

	#[error("invalid config value for '{field}': {reason}")]
	Invalid { field: &'static str, reason: String },
}

impl ConfigError {
	pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
		Self::Io {
			path: path.into(),
			source,
		}
	}
}

/// Platform-specific data directory resolution
pub fn default_data_dir() -> Result<PathBuf, ConfigError> {
	#[cfg(target_os = "linux")]
	let dir = dirs::data_local_dir()
		.ok_or(ConfigError::NoDataDir)?
		.join("spectral");

	#[cfg(not(target_os = "linux"))]
	let dir = dirs::data_dir()
		.ok_or(ConfigError::NoDataDir)?
		.join("Spectral");

	fs::create_dir_all(&dir).map_err(|e| ConfigError::io(&dir, e))?;

	Ok(dir)
}
