//! Offline-first sync engine for field capture
//!
//! Records are captured into a local SQLite store together with a durable
//! queue entry, and a background service delivers the queue to the server
//! whenever connectivity allows, reconciling local ids with server ids.

pub mod capture;
pub mod config;
pub mod domain;
pub mod infra;
pub mod service;

use crate::{
	capture::Capture,
	config::{AppConfig, ConfigError},
	infra::{
		db::{Database, StorageError},
		queue::SyncQueue,
		store::LocalStore,
	},
	service::{
		sync::{ConnectivityHandle, HttpTransport, SyncService, SyncStatus, Transport, TransportError},
		Service,
	},
};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum CoreError {
	#[error(transparent)]
	Config(#[from] ConfigError),

	#[error(transparent)]
	Storage(#[from] StorageError),

	#[error(transparent)]
	Transport(#[from] TransportError),
}

/// The engine: local store, sync queue, producer API and sync service, all
/// sharing one database
pub struct Core {
	config: AppConfig,
	db: Arc<Database>,
	store: LocalStore,
	queue: SyncQueue,
	capture: Capture,
	sync: Arc<SyncService>,
}

impl Core {
	/// Open the engine with an explicit transport. The sync service is created
	/// but not started.
	pub async fn open(config: AppConfig, transport: Arc<dyn Transport>) -> Result<Self, CoreError> {
		config.validate()?;

		let db = Database::open_in(&config.data_dir).await?;
		let store = LocalStore::new(Arc::clone(&db));
		let queue = SyncQueue::new(Arc::clone(&db), config.sync.max_retries);
		let capture = Capture::new(Arc::clone(&db));

		let sync = Arc::new(SyncService::new(
			store.clone(),
			queue.clone(),
			transport,
			config.sync.clone(),
		));

		info!(
			data_dir = %config.data_dir.display(),
			api_url = %config.api_url,
			"Core opened"
		);

		Ok(Self {
			config,
			db,
			store,
			queue,
			capture,
			sync,
		})
	}

	/// Open the engine talking to `config.api_url` over HTTP
	pub async fn open_with_http(config: AppConfig) -> Result<Self, CoreError> {
		let transport = HttpTransport::new(config.api_url.clone(), config.sync.request_timeout())?;
		Self::open(config, Arc::new(transport)).await
	}

	pub fn config(&self) -> &AppConfig {
		&self.config
	}

	pub fn store(&self) -> &LocalStore {
		&self.store
	}

	pub fn queue(&self) -> &SyncQueue {
		&self.queue
	}

	pub fn capture(&self) -> &Capture {
		&self.capture
	}

	pub fn sync(&self) -> &Arc<SyncService> {
		&self.sync
	}

	pub fn connectivity(&self) -> ConnectivityHandle {
		self.sync.connectivity()
	}

	pub async fn status(&self) -> Result<SyncStatus, StorageError> {
		self.sync.status().await
	}

	pub async fn start(&self) -> anyhow::Result<()> {
		self.sync.start().await
	}

	/// Stop the sync service and close the database
	pub async fn shutdown(&self) {
		info!("Shutting down core");

		if let Err(e) = self.sync.stop().await {
			error!(?e, "Failed to stop sync service");
		}

		self.db.close().await;
	}
}
