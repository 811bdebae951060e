//! Sync Service - connectivity-aware drain scheduler
//!
//! Background service that delivers the sync queue to the server:
//! - Reacts to connectivity signals, debouncing reconnects
//! - Drains in bounded batches with a cooldown between batches
//! - Settles each result (complete, retry, dead-letter, reconcile ids)
//! - Periodically purges completed entries past the audit window

pub mod connectivity;
mod drain;
pub mod state;
pub mod transport;

pub use connectivity::{ConnectivityHandle, ConnectivitySignal, NetworkStatus};
pub use state::{DispatchOutcome, DrainReport, EngineState, SyncStatus};
pub use transport::{HttpTransport, OutboundRequest, ServerAck, Transport, TransportError};

use crate::{
	config::SyncConfig,
	infra::{
		db::StorageError,
		queue::{QueueError, SyncQueue},
		store::LocalStore,
	},
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use drain::Drainer;
use futures::FutureExt;
use std::{
	pin::Pin,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc,
	},
	time::Duration,
};
use thiserror::Error;
use tokio::{
	sync::{broadcast, mpsc, watch, Mutex, Notify},
	task::JoinHandle,
	time::{interval_at, timeout, Instant, MissedTickBehavior, Sleep},
};
use tracing::{debug, error, info, warn};

/// How long `stop` waits for an in-progress drain before aborting it
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum SyncError {
	#[error(transparent)]
	Storage(#[from] StorageError),

	#[error(transparent)]
	Queue(#[from] QueueError),

	#[error(transparent)]
	Transport(#[from] TransportError),

	#[error("sync service is running, stop it before draining manually")]
	AlreadyRunning,
}

type SignalReceiver = mpsc::UnboundedReceiver<ConnectivitySignal>;

/// Sync service
///
/// Owns the single drain loop of the process. Producers keep writing to the
/// store and the queue while it runs; it only takes the database writer lock
/// for short settle transactions, never across a network call.
pub struct SyncService {
	drainer: Drainer,

	connectivity: ConnectivityHandle,

	/// Handed to the scheduler task while running and given back on stop
	signals: Arc<Mutex<Option<SignalReceiver>>>,

	/// Published engine state
	state_tx: Arc<watch::Sender<EngineState>>,

	/// Whether the service is running
	is_running: Arc<AtomicBool>,

	/// Shutdown signal
	shutdown_tx: Arc<Mutex<Option<broadcast::Sender<()>>>>,

	loop_handle: Mutex<Option<JoinHandle<SignalReceiver>>>,
	pruning_handle: Mutex<Option<JoinHandle<()>>>,
}

impl SyncService {
	pub fn new(
		store: LocalStore,
		queue: SyncQueue,
		transport: Arc<dyn Transport>,
		config: SyncConfig,
	) -> Self {
		let state_tx = Arc::new(watch::Sender::new(EngineState::Idle));
		let network_tx = Arc::new(watch::Sender::new(NetworkStatus::Offline));
		let (connectivity, signals) = ConnectivityHandle::channel(Arc::clone(&network_tx));

		let drainer = Drainer {
			store,
			queue,
			transport,
			config: Arc::new(config),
			state: Arc::clone(&state_tx),
			network: network_tx.subscribe(),
			halted: Arc::new(AtomicBool::new(false)),
			skip_cooldown: Arc::new(Notify::new()),
			active: Arc::new(Mutex::new(())),
		};

		Self {
			drainer,
			connectivity,
			signals: Arc::new(Mutex::new(Some(signals))),
			state_tx,
			is_running: Arc::new(AtomicBool::new(false)),
			shutdown_tx: Arc::new(Mutex::new(None)),
			loop_handle: Mutex::new(None),
			pruning_handle: Mutex::new(None),
		}
	}

	pub fn config(&self) -> &SyncConfig {
		&self.drainer.config
	}

	/// Handle for feeding connectivity signals into the scheduler
	pub fn connectivity(&self) -> ConnectivityHandle {
		self.connectivity.clone()
	}

	pub fn state(&self) -> EngineState {
		*self.state_tx.borrow()
	}

	/// Observe engine state transitions
	pub fn subscribe(&self) -> watch::Receiver<EngineState> {
		self.state_tx.subscribe()
	}

	pub fn network_status(&self) -> NetworkStatus {
		self.connectivity.status()
	}

	pub async fn status(&self) -> Result<SyncStatus, StorageError> {
		Ok(SyncStatus {
			state: self.state(),
			network: self.network_status(),
			counts: self.drainer.queue.counts().await?,
		})
	}

	/// Run a single drain on the calling task.
	///
	/// Meant for one-shot tools; the network must have been reported online.
	/// Entries a crashed process left in flight are picked up again. Fails
	/// while the background scheduler is running.
	pub async fn drain_now(&self) -> Result<DrainReport, SyncError> {
		if self.is_running.load(Ordering::SeqCst) {
			return Err(SyncError::AlreadyRunning);
		}

		Ok(self.drainer.clone().drain().await)
	}

	async fn run_sync_loop(
		drainer: Drainer,
		mut signals: SignalReceiver,
		mut shutdown_rx: broadcast::Receiver<()>,
	) -> SignalReceiver {
		let config = Arc::clone(&drainer.config);
		// Reported online before the loop started: treat it as a fresh reconnect
		let mut online = drainer.network.borrow().is_online();
		let mut debounce: Option<Pin<Box<Sleep>>> =
			online.then(|| Box::pin(tokio::time::sleep(config.debounce())));
		let mut drain_task: Option<JoinHandle<DrainReport>> = None;

		let period = config.tick_interval();
		let mut tick = interval_at(Instant::now() + period, period);
		tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

		info!(
			tick_secs = period.as_secs(),
			debounce_ms = config.debounce_ms,
			"Sync loop started"
		);

		loop {
			if drain_task.as_ref().is_some_and(JoinHandle::is_finished) {
				if let Some(Some(Err(e))) = drain_task.take().map(FutureExt::now_or_never) {
					error!(?e, "Drain task failed");
				}
			}

			tokio::select! {
				_ = shutdown_rx.recv() => {
					info!("Sync loop shutdown signal received");
					break;
				}

				signal = signals.recv() => {
					let Some(signal) = signal else {
						warn!("Connectivity channel closed, stopping sync loop");
						break;
					};

					match signal {
						ConnectivitySignal::Online => {
							if !online {
								online = true;
								info!(debounce_ms = config.debounce_ms, "Back online, scheduling drain");
								debounce = Some(Box::pin(tokio::time::sleep(config.debounce())));
							}
						}

						ConnectivitySignal::Offline => {
							if online {
								online = false;
								info!("Went offline, halting dispatch");
							}
							debounce = None;
						}

						ConnectivitySignal::BecameVisible => {
							if online && debounce.is_none() && !is_draining(&drain_task) {
								debug!("Became visible, scheduling drain");
								debounce = Some(Box::pin(tokio::time::sleep(config.debounce())));
							}
						}

						ConnectivitySignal::ForceSync => {
							if !drainer.network.borrow().is_online() {
								info!("Force sync requested while offline, ignoring");
							} else {
								debounce = None;
								Self::trigger_drain(&drainer, &mut drain_task, "force_sync");
							}
						}
					}
				}

				_ = async {
					if let Some(sleep) = debounce.as_mut() {
						sleep.await;
					}
				}, if debounce.is_some() => {
					debounce = None;
					Self::trigger_drain(&drainer, &mut drain_task, "reconnect");
				}

				_ = tick.tick() => {
					if drainer.network.borrow().is_online() && !is_draining(&drain_task) {
						Self::trigger_drain(&drainer, &mut drain_task, "tick");
					}
				}
			}
		}

		if let Some(handle) = drain_task.take() {
			wait_drain_or_abort(handle).await;
		}

		info!("Sync loop stopped");

		signals
	}

	/// Start a drain unless one is already running. A drain that is cooling
	/// down is told to continue right away.
	fn trigger_drain(
		drainer: &Drainer,
		drain_task: &mut Option<JoinHandle<DrainReport>>,
		reason: &'static str,
	) {
		if is_draining(drain_task) {
			if *drainer.state.borrow() == EngineState::CoolingDown {
				debug!(reason, "Drain cooling down, skipping the rest of the cooldown");
				drainer.skip_cooldown.notify_waiters();
			} else {
				debug!(reason, "Drain already in progress");
			}
			return;
		}

		info!(reason, "Starting drain");
		*drain_task = Some(tokio::spawn(drainer.clone().drain()));
	}

	async fn run_pruning_task(
		store: LocalStore,
		config: Arc<SyncConfig>,
		mut shutdown_rx: broadcast::Receiver<()>,
	) {
		let mut interval = tokio::time::interval(config.pruning_interval());

		info!(
			interval_secs = config.pruning_interval().as_secs(),
			retention_hours = config.completed_retention_hours,
			"Starting pruning task"
		);

		loop {
			tokio::select! {
				_ = shutdown_rx.recv() => break,
				_ = interval.tick() => {
					if let Err(e) = store.purge_completed(config.completed_retention()).await {
						warn!(?e, "Failed to purge completed sync entries");
					}
				}
			}
		}
	}
}

fn is_draining(drain_task: &Option<JoinHandle<DrainReport>>) -> bool {
	drain_task
		.as_ref()
		.is_some_and(|handle| !handle.is_finished())
}

async fn wait_drain_or_abort(handle: JoinHandle<DrainReport>) {
	let abort_handle = handle.abort_handle();

	match timeout(STOP_TIMEOUT, handle).await {
		Ok(Ok(report)) => debug!(completed = report.completed, "Drain finished before stop"),
		Ok(Err(e)) if e.is_panic() => error!(?e, "Drain task panicked"),
		Ok(Err(_)) => {}
		Err(_) => {
			error!("Drain did not stop in time, aborting it");
			abort_handle.abort();
		}
	}
}

#[async_trait]
impl crate::service::Service for SyncService {
	fn name(&self) -> &'static str {
		"sync_service"
	}

	fn is_running(&self) -> bool {
		self.is_running.load(Ordering::SeqCst)
	}

	async fn start(&self) -> Result<()> {
		if self.is_running.load(Ordering::SeqCst) {
			warn!("Sync service already running");
			return Ok(());
		}

		info!("Starting sync service");

		// Anything left in flight by a previous process never got settled
		self.drainer.queue.recover_in_flight().await?;

		let signals = self
			.signals
			.lock()
			.await
			.take()
			.ok_or_else(|| anyhow!("sync service signal channel is held by a previous run"))?;

		let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
		let pruning_shutdown_rx = shutdown_tx.subscribe();
		*self.shutdown_tx.lock().await = Some(shutdown_tx);

		self.drainer.halted.store(false, Ordering::Release);
		self.is_running.store(true, Ordering::SeqCst);

		let drainer = self.drainer.clone();
		*self.loop_handle.lock().await = Some(tokio::spawn(async move {
			Self::run_sync_loop(drainer, signals, shutdown_rx).await
		}));

		let store = self.drainer.store.clone();
		let config = Arc::clone(&self.drainer.config);
		*self.pruning_handle.lock().await = Some(tokio::spawn(async move {
			Self::run_pruning_task(store, config, pruning_shutdown_rx).await;
		}));

		info!("Sync service started (with pruning task)");

		Ok(())
	}

	async fn stop(&self) -> Result<()> {
		if !self.is_running.load(Ordering::SeqCst) {
			return Ok(());
		}

		info!("Stopping sync service");

		// Undispatched entries of the current batch go back to pending
		self.drainer.halted.store(true, Ordering::Release);
		self.drainer.skip_cooldown.notify_waiters();

		if let Some(shutdown_tx) = self.shutdown_tx.lock().await.take() {
			let _ = shutdown_tx.send(());
		}

		if let Some(handle) = self.loop_handle.lock().await.take() {
			match handle.await {
				Ok(signals) => *self.signals.lock().await = Some(signals),
				Err(e) => error!(?e, "Sync loop task failed, the service cannot be restarted"),
			}
		}

		if let Some(handle) = self.pruning_handle.lock().await.take() {
			if let Err(e) = handle.await {
				error!(?e, "Pruning task failed");
			}
		}

		self.state_tx.send_replace(EngineState::Idle);
		self.is_running.store(false, Ordering::SeqCst);

		info!("Sync service stopped");

		Ok(())
	}
}
