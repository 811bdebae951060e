//! Producer API
//!
//! Every write that needs server visibility goes through here so the record
//! and its queue entry land in one transaction. A failed write leaves neither.

use crate::{
	domain::{LocalId, Payload, Record, RecordRef},
	infra::{
		db::{Database, StorageError},
		queue::{EntryId, SyncAction, SyncQueue},
		store::LocalStore,
	},
};
use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum CaptureError {
	#[error("record {0} not found")]
	UnknownRecord(LocalId),

	#[error("record {0} was already captured")]
	AlreadyCaptured(LocalId),

	#[error(transparent)]
	Storage(#[from] StorageError),
}

#[derive(Clone)]
pub struct Capture {
	db: Arc<Database>,
}

impl Capture {
	pub fn new(db: Arc<Database>) -> Self {
		Self { db }
	}

	/// Store a new record and queue its create.
	///
	/// A detection whose session is already known to the server is stored
	/// against the session's server id straight away.
	pub async fn capture(&self, record: Record) -> Result<LocalId, CaptureError> {
		let mut tx = self.db.begin_write().await?;

		if LocalStore::get_in(tx.conn(), record.local_id).await?.is_some() {
			return Err(CaptureError::AlreadyCaptured(record.local_id));
		}

		if let Some(&RecordRef::Local(parent_id)) = record.parent() {
			if LocalStore::get_in(tx.conn(), parent_id).await?.is_none() {
				return Err(CaptureError::UnknownRecord(parent_id));
			}
		}

		LocalStore::put_in(tx.conn(), &record).await?;
		let entry_id = SyncQueue::enqueue_in(
			tx.conn(),
			record.record_type(),
			record.local_id,
			SyncAction::Create,
			&record.payload,
		)
		.await?;

		tx.commit().await?;

		debug!(
			local_id = %record.local_id,
			record_type = %record.record_type(),
			%entry_id,
			"Captured record"
		);

		Ok(record.local_id)
	}

	/// Replace a record's payload and queue an update
	pub async fn update(&self, local_id: LocalId, payload: Payload) -> Result<EntryId, CaptureError> {
		let mut tx = self.db.begin_write().await?;

		let mut record = LocalStore::get_in(tx.conn(), local_id)
			.await?
			.ok_or(CaptureError::UnknownRecord(local_id))?;

		record.payload = payload;
		record.updated_at = Utc::now();

		LocalStore::put_in(tx.conn(), &record).await?;
		let entry_id = SyncQueue::enqueue_in(
			tx.conn(),
			record.record_type(),
			local_id,
			SyncAction::Update,
			&record.payload,
		)
		.await?;

		tx.commit().await?;

		debug!(%local_id, %entry_id, "Queued record update");

		Ok(entry_id)
	}
}
