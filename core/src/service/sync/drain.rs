//! One drain: claim batches, deliver them, settle the results

use super::{
	connectivity::NetworkStatus,
	state::{DispatchOutcome, DrainReport, EngineState},
	transport::{OutboundRequest, ServerAck, Transport},
	SyncError,
};
use crate::{
	config::SyncConfig,
	domain::RecordRef,
	infra::{
		queue::{CreateSettlement, EntryStatus, SyncAction, SyncQueue, SyncQueueEntry},
		store::LocalStore,
	},
};
use futures::{stream, StreamExt};
use std::{
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc,
	},
	time::Instant,
};
use tokio::sync::{watch, Mutex, Notify};
use tracing::{debug, error, info, warn};

#[derive(Clone)]
pub(super) struct Drainer {
	pub(super) store: LocalStore,
	pub(super) queue: SyncQueue,
	pub(super) transport: Arc<dyn Transport>,
	pub(super) config: Arc<SyncConfig>,
	pub(super) state: Arc<watch::Sender<EngineState>>,
	pub(super) network: watch::Receiver<NetworkStatus>,
	/// Set while the service is stopping
	pub(super) halted: Arc<AtomicBool>,
	/// Cuts the current cooldown short
	pub(super) skip_cooldown: Arc<Notify>,
	/// Held for the whole drain, drains never overlap
	pub(super) active: Arc<Mutex<()>>,
}

impl Drainer {
	fn can_dispatch(&self) -> bool {
		self.network.borrow().is_online() && !self.halted.load(Ordering::Acquire)
	}

	fn set_state(&self, state: EngineState) {
		let previous = self.state.send_replace(state);
		if previous != state {
			debug!(from = %previous, to = %state, "Engine state changed");
		}
	}

	/// Drain until the queue has nothing dispatchable left or dispatch halts
	pub(super) async fn drain(self) -> DrainReport {
		let active = Arc::clone(&self.active);
		let _active = active.lock().await;

		let started = Instant::now();
		let mut report = DrainReport::default();

		self.set_state(EngineState::Draining);

		if let Err(e) = self.prepare().await {
			error!(?e, "Failed to prepare the queue for draining");
			self.set_state(EngineState::Idle);
			return report;
		}

		loop {
			if !self.can_dispatch() {
				debug!("Dispatch halted, ending drain");
				break;
			}

			let batch = match self.queue.next_batch(self.config.batch_size).await {
				Ok(batch) if batch.is_empty() => break,
				Ok(batch) => batch,
				Err(e) => {
					error!(?e, "Failed to claim sync batch");
					break;
				}
			};

			let outcomes = self.dispatch_batch(batch).await;
			report.record(&outcomes);

			self.set_state(EngineState::CoolingDown);
			tokio::select! {
				_ = tokio::time::sleep(self.config.cooldown()) => {}
				_ = self.skip_cooldown.notified() => debug!("Cooldown cut short"),
			}

			match self.queue.has_pending().await {
				Ok(true) => self.set_state(EngineState::Draining),
				Ok(false) => break,
				Err(e) => {
					error!(?e, "Failed to check for pending entries");
					break;
				}
			}
		}

		self.set_state(EngineState::Idle);

		info!(
			batches = report.batches,
			completed = report.completed,
			failed = report.failed,
			dead_lettered = report.dead_lettered,
			released = report.released,
			elapsed_ms = started.elapsed().as_millis() as u64,
			"Drain finished"
		);

		report
	}

	/// Give failed entries another attempt and pick up entries a previous
	/// drain could not settle. No other drain is dispatching at this point.
	async fn prepare(&self) -> Result<(), SyncError> {
		let requeued = self.queue.requeue_failed().await?;
		if requeued > 0 {
			debug!(requeued, "Requeued failed entries for retry");
		}

		self.queue.recover_in_flight().await?;

		Ok(())
	}

	/// Bounded-parallel dispatch. Entries still waiting for a slot when
	/// dispatch halts are released instead of sent.
	async fn dispatch_batch(&self, batch: Vec<SyncQueueEntry>) -> Vec<DispatchOutcome> {
		debug!(size = batch.len(), "Dispatching sync batch");

		stream::iter(batch)
			.map(|entry| self.dispatch(entry))
			.buffer_unordered(self.config.max_concurrency.max(1))
			.collect()
			.await
	}

	async fn dispatch(&self, entry: SyncQueueEntry) -> DispatchOutcome {
		let entry_id = entry.entry_id;

		if !self.can_dispatch() {
			return match self.queue.release(&[entry_id]).await {
				Ok(_) => {
					debug!(%entry_id, "Released undispatched entry");
					DispatchOutcome::Released
				}
				Err(e) => {
					error!(%entry_id, ?e, "Failed to release undispatched entry");
					DispatchOutcome::Errored
				}
			};
		}

		match self.deliver(&entry).await {
			Ok(outcome) => outcome,
			Err(e) => {
				error!(
					%entry_id,
					record_local_id = %entry.record_local_id,
					?e,
					"Failed to settle sync entry"
				);

				// Counts as an attempt against the retry cap
				match self.queue.mark_failed(entry_id, &e.to_string()).await {
					Ok(EntryStatus::DeadLetter) => DispatchOutcome::DeadLettered,
					Ok(_) => DispatchOutcome::Failed,
					Err(e) => {
						warn!(%entry_id, ?e, "Sync entry left in flight until the next drain");
						DispatchOutcome::Errored
					}
				}
			}
		}
	}

	async fn deliver(&self, entry: &SyncQueueEntry) -> Result<DispatchOutcome, SyncError> {
		let Some(record) = self.store.get(entry.record_local_id).await? else {
			self.queue
				.mark_dead_letter(entry.entry_id, "record no longer exists in the local store")
				.await?;
			return Ok(DispatchOutcome::DeadLettered);
		};

		let session_id = match record.parent() {
			Some(parent) => Some(self.resolve(parent).await?),
			None => None,
		};

		let request = OutboundRequest::from_entry(entry, record.server_id.clone(), session_id);

		match self.transport.send(&request).await {
			Ok(ack) => self.settle(entry, ack).await,
			Err(e) => {
				let status = self.queue.mark_failed(entry.entry_id, &e.to_string()).await?;
				Ok(match status {
					EntryStatus::DeadLetter => DispatchOutcome::DeadLettered,
					_ => DispatchOutcome::Failed,
				})
			}
		}
	}

	async fn settle(
		&self,
		entry: &SyncQueueEntry,
		ack: ServerAck,
	) -> Result<DispatchOutcome, SyncError> {
		match (entry.action, ack.server_id) {
			(SyncAction::Create, Some(server_id)) => {
				match self
					.queue
					.complete_create(entry.entry_id, entry.record_local_id, &server_id)
					.await?
				{
					CreateSettlement::Completed(_) => Ok(DispatchOutcome::Completed),
					CreateSettlement::DeadLettered { .. } => Ok(DispatchOutcome::DeadLettered),
				}
			}
			(SyncAction::Create, None) => {
				warn!(entry_id = %entry.entry_id, "Create acknowledged without a server id");
				let status = self
					.queue
					.mark_failed(entry.entry_id, "create acknowledged without a server id")
					.await?;
				Ok(match status {
					EntryStatus::DeadLetter => DispatchOutcome::DeadLettered,
					_ => DispatchOutcome::Failed,
				})
			}
			(SyncAction::Update, _) => {
				self.queue.mark_completed(entry.entry_id).await?;
				Ok(DispatchOutcome::Completed)
			}
		}
	}

	/// Best-known id of a parent at dispatch time
	async fn resolve(&self, parent: &RecordRef) -> Result<String, SyncError> {
		Ok(match parent {
			RecordRef::Server(server_id) => server_id.to_string(),
			RecordRef::Local(local_id) => match self.store.get(*local_id).await? {
				Some(record) => record.best_known_ref().key(),
				None => local_id.to_string(),
			},
		})
	}
}
