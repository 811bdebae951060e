//! Durable sync queue
//!
//! An append-only table of mutation descriptors. All status transitions go
//! through the database writer lock, which is what upholds the
//! at-most-one-in-flight-per-record invariant: selecting a batch and marking
//! it `in_flight` happen in one serialized transaction.

mod entry;

pub use entry::{EntryId, EntryStatus, QueueCounts, SyncAction, SyncQueueEntry};

use crate::{
	domain::{LocalId, Payload, RecordType, ServerId},
	infra::{
		db::{from_millis, now_millis, Database, StorageError},
		store::{LocalStore, ReconcileError, Reconciliation},
	},
};
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row, SqliteConnection};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

const TABLE: &str = "sync_queue";

const SELECT_ENTRY: &str = "SELECT entry_id, record_type, record_local_id, action, payload_snapshot,
	created_at, updated_at, completed_at, attempt_count, status, last_error FROM sync_queue";

/// Default number of failed attempts before an entry is dead-lettered
pub const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Debug, Error)]
pub enum QueueError {
	#[error("queue entry {0} not found")]
	NotFound(EntryId),

	#[error("queue entry {entry_id} cannot move from '{from}' to '{to}'")]
	InvalidTransition {
		entry_id: EntryId,
		from: EntryStatus,
		to: EntryStatus,
	},

	#[error("queue entry {entry_id} is '{status}', not a dead letter")]
	NotDeadLetter {
		entry_id: EntryId,
		status: EntryStatus,
	},

	#[error(transparent)]
	Storage(#[from] StorageError),
}

impl From<sqlx::Error> for QueueError {
	fn from(e: sqlx::Error) -> Self {
		Self::Storage(e.into())
	}
}

/// How a successfully acknowledged create was settled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateSettlement {
	Completed(Reconciliation),
	/// The acknowledgement could not be reconciled, the entry is dead-lettered
	DeadLettered { reason: String },
}

#[derive(Clone)]
pub struct SyncQueue {
	db: Arc<Database>,
	max_retries: u32,
}

impl SyncQueue {
	pub fn new(db: Arc<Database>, max_retries: u32) -> Self {
		Self {
			db,
			max_retries: max_retries.max(1),
		}
	}

	pub fn max_retries(&self) -> u32 {
		self.max_retries
	}

	/// Append a `pending` entry on its own.
	///
	/// Records that need server visibility should be enqueued through the
	/// capture API, in the same transaction as the record write.
	pub async fn enqueue(
		&self,
		record_type: RecordType,
		record_local_id: LocalId,
		action: SyncAction,
		payload_snapshot: &Payload,
	) -> Result<EntryId, StorageError> {
		let mut tx = self.db.begin_write().await?;
		let entry_id =
			Self::enqueue_in(tx.conn(), record_type, record_local_id, action, payload_snapshot)
				.await?;
		tx.commit().await?;

		Ok(entry_id)
	}

	pub(crate) async fn enqueue_in(
		conn: &mut SqliteConnection,
		record_type: RecordType,
		record_local_id: LocalId,
		action: SyncAction,
		payload_snapshot: &Payload,
	) -> Result<EntryId, StorageError> {
		let entry_id = EntryId::new();
		let snapshot = rmp_serde::to_vec_named(payload_snapshot)?;
		let now = now_millis();

		sqlx::query(
			"INSERT INTO sync_queue
				(entry_id, record_type, record_local_id, action, payload_snapshot,
				created_at, updated_at, attempt_count, status)
			VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, 0, 'pending')",
		)
		.bind(entry_id.to_string())
		.bind(record_type.as_ref())
		.bind(record_local_id.to_string())
		.bind(action.as_ref())
		.bind(snapshot)
		.bind(now)
		.execute(&mut *conn)
		.await?;

		debug!(
			%entry_id,
			%record_local_id,
			%record_type,
			%action,
			"Enqueued sync entry"
		);

		Ok(entry_id)
	}

	/// Claim up to `max_size` pending entries, oldest first, and mark them
	/// `in_flight`.
	///
	/// An entry is only eligible when no older entry of the same record is
	/// still `pending`, `in_flight` or `failed`, and no entry of that record is
	/// `in_flight`. This yields at most one entry per record per batch and
	/// keeps every record's history in creation order.
	pub async fn next_batch(&self, max_size: usize) -> Result<Vec<SyncQueueEntry>, StorageError> {
		if max_size == 0 {
			return Ok(Vec::new());
		}

		let mut tx = self.db.begin_write().await?;

		let mut batch = sqlx::query(&format!(
			"{SELECT_ENTRY} AS q
			WHERE q.status = 'pending'
				AND NOT EXISTS (
					SELECT 1 FROM sync_queue o
					WHERE o.record_local_id = q.record_local_id
						AND o.status IN ('pending', 'in_flight', 'failed')
						AND (o.created_at < q.created_at
							OR (o.created_at = q.created_at AND o.seq < q.seq))
				)
				AND NOT EXISTS (
					SELECT 1 FROM sync_queue f
					WHERE f.record_local_id = q.record_local_id AND f.status = 'in_flight'
				)
			ORDER BY q.created_at, q.seq
			LIMIT ?1"
		))
		.bind(i64::try_from(max_size).unwrap_or(i64::MAX))
		.fetch_all(tx.conn())
		.await?
		.iter()
		.map(entry_from_row)
		.collect::<Result<Vec<_>, _>>()?;

		let now = now_millis();
		for entry in &mut batch {
			sqlx::query(
				"UPDATE sync_queue SET status = 'in_flight', updated_at = ?1
				WHERE entry_id = ?2 AND status = 'pending'",
			)
			.bind(now)
			.bind(entry.entry_id.to_string())
			.execute(tx.conn())
			.await?;

			entry.status = EntryStatus::InFlight;
		}

		tx.commit().await?;

		if !batch.is_empty() {
			debug!(size = batch.len(), "Claimed sync batch");
		}

		Ok(batch)
	}

	pub async fn mark_completed(&self, entry_id: EntryId) -> Result<(), QueueError> {
		let mut tx = self.db.begin_write().await?;
		Self::complete_in(tx.conn(), entry_id).await?;
		tx.commit().await?;

		debug!(%entry_id, "Sync entry completed");

		Ok(())
	}

	/// Settle a successful create: mark the entry completed and reconcile the
	/// record's id in the same transaction, so nobody can observe a completed
	/// entry whose reconciliation has not landed.
	pub async fn complete_create(
		&self,
		entry_id: EntryId,
		local_id: LocalId,
		server_id: &ServerId,
	) -> Result<CreateSettlement, QueueError> {
		let mut tx = self.db.begin_write().await?;

		require_status(tx.conn(), entry_id, EntryStatus::InFlight, EntryStatus::Completed)
			.await?;

		let settlement = match LocalStore::reconcile_in(tx.conn(), local_id, server_id).await {
			Ok(reconciliation) => {
				Self::complete_in(tx.conn(), entry_id).await?;
				CreateSettlement::Completed(reconciliation)
			}
			Err(e @ (ReconcileError::Conflict { .. } | ReconcileError::NotFound(_))) => {
				let reason = e.to_string();
				Self::dead_letter_in(tx.conn(), entry_id, &reason).await?;
				CreateSettlement::DeadLettered { reason }
			}
			Err(ReconcileError::Storage(e)) => return Err(e.into()),
		};

		tx.commit().await?;

		if let CreateSettlement::DeadLettered { reason } = &settlement {
			warn!(%entry_id, %local_id, %server_id, %reason, "Create could not be reconciled");
		}

		Ok(settlement)
	}

	/// Record a failed attempt. Returns the resulting status: `failed` while
	/// retries remain, `dead_letter` once `max_retries` attempts have failed.
	pub async fn mark_failed(
		&self,
		entry_id: EntryId,
		error: &str,
	) -> Result<EntryStatus, QueueError> {
		let mut tx = self.db.begin_write().await?;

		let row = sqlx::query(
			"SELECT status, attempt_count FROM sync_queue WHERE entry_id = ?1",
		)
		.bind(entry_id.to_string())
		.fetch_optional(tx.conn())
		.await?
		.ok_or(QueueError::NotFound(entry_id))?;

		let status = parse_status(&row.try_get::<String, _>("status")?)?;
		if status != EntryStatus::InFlight {
			return Err(QueueError::InvalidTransition {
				entry_id,
				from: status,
				to: EntryStatus::Failed,
			});
		}

		let attempts = u32::try_from(row.try_get::<i64, _>("attempt_count")?)
			.unwrap_or(u32::MAX)
			.saturating_add(1);

		let next = if attempts >= self.max_retries {
			EntryStatus::DeadLetter
		} else {
			EntryStatus::Failed
		};

		sqlx::query(
			"UPDATE sync_queue SET status = ?1, attempt_count = ?2, last_error = ?3, updated_at = ?4
			WHERE entry_id = ?5",
		)
		.bind(next.as_ref())
		.bind(i64::from(attempts))
		.bind(error)
		.bind(now_millis())
		.bind(entry_id.to_string())
		.execute(tx.conn())
		.await?;

		tx.commit().await?;

		if next == EntryStatus::DeadLetter {
			warn!(%entry_id, attempts, %error, "Sync entry dead-lettered after exhausting retries");
		} else {
			debug!(%entry_id, attempts, %error, "Sync entry failed, will retry");
		}

		Ok(next)
	}

	/// Dead-letter an in-flight entry without consuming a retry
	pub async fn mark_dead_letter(&self, entry_id: EntryId, error: &str) -> Result<(), QueueError> {
		let mut tx = self.db.begin_write().await?;
		require_status(
			tx.conn(),
			entry_id,
			EntryStatus::InFlight,
			EntryStatus::DeadLetter,
		)
		.await?;
		Self::dead_letter_in(tx.conn(), entry_id, error).await?;
		tx.commit().await?;

		warn!(%entry_id, %error, "Sync entry dead-lettered");

		Ok(())
	}

	/// Hand in-flight entries back to `pending` without counting an attempt,
	/// used when an entry was claimed but never reached the transport.
	pub async fn release(&self, entry_ids: &[EntryId]) -> Result<u64, StorageError> {
		let mut tx = self.db.begin_write().await?;
		let now = now_millis();
		let mut released = 0;

		for entry_id in entry_ids {
			released += sqlx::query(
				"UPDATE sync_queue SET status = 'pending', updated_at = ?1
				WHERE entry_id = ?2 AND status = 'in_flight'",
			)
			.bind(now)
			.bind(entry_id.to_string())
			.execute(tx.conn())
			.await?
			.rows_affected();
		}

		tx.commit().await?;

		Ok(released)
	}

	/// Move every `failed` entry back to `pending` for another attempt
	pub async fn requeue_failed(&self) -> Result<u64, StorageError> {
		self.move_all(EntryStatus::Failed, EntryStatus::Pending)
			.await
	}

	/// Entries left `in_flight` by a process that died mid-send, or by a drain
	/// that could not settle them, go back to `pending` without consuming an
	/// attempt. Only call this while no drain is dispatching.
	pub async fn recover_in_flight(&self) -> Result<u64, StorageError> {
		let recovered = self
			.move_all(EntryStatus::InFlight, EntryStatus::Pending)
			.await?;

		if recovered > 0 {
			info!(recovered, "Recovered sync entries left in flight");
		}

		Ok(recovered)
	}

	pub async fn list_dead_letters(&self) -> Result<Vec<SyncQueueEntry>, StorageError> {
		self.list_by_status(EntryStatus::DeadLetter).await
	}

	/// Reset a dead-lettered entry to `pending` with a fresh retry budget
	pub async fn replay(&self, entry_id: EntryId) -> Result<(), QueueError> {
		let mut tx = self.db.begin_write().await?;
		require_status(
			tx.conn(),
			entry_id,
			EntryStatus::DeadLetter,
			EntryStatus::Pending,
		)
		.await?;

		sqlx::query(
			"UPDATE sync_queue SET status = 'pending', attempt_count = 0, updated_at = ?1
			WHERE entry_id = ?2",
		)
		.bind(now_millis())
		.bind(entry_id.to_string())
		.execute(tx.conn())
		.await?;

		tx.commit().await?;

		info!(%entry_id, "Replaying dead-lettered sync entry");

		Ok(())
	}

	/// Operator action: drop every dead letter
	pub async fn clear_dead_letters(&self) -> Result<u64, StorageError> {
		let mut tx = self.db.begin_write().await?;
		let cleared = sqlx::query("DELETE FROM sync_queue WHERE status = 'dead_letter'")
			.execute(tx.conn())
			.await?
			.rows_affected();
		tx.commit().await?;

		info!(cleared, "Cleared dead-lettered sync entries");

		Ok(cleared)
	}

	/// Operator action: drop a single dead letter
	pub async fn clear_dead_letter(&self, entry_id: EntryId) -> Result<(), QueueError> {
		let mut tx = self.db.begin_write().await?;
		let status = status_in(tx.conn(), entry_id)
			.await?
			.ok_or(QueueError::NotFound(entry_id))?;

		if status != EntryStatus::DeadLetter {
			return Err(QueueError::NotDeadLetter { entry_id, status });
		}

		sqlx::query("DELETE FROM sync_queue WHERE entry_id = ?1")
			.bind(entry_id.to_string())
			.execute(tx.conn())
			.await?;
		tx.commit().await?;

		info!(%entry_id, "Cleared dead-lettered sync entry");

		Ok(())
	}

	/// Drop completed entries whose audit window has passed
	pub async fn purge_completed(&self, older_than: chrono::Duration) -> Result<u64, StorageError> {
		let mut tx = self.db.begin_write().await?;
		let purged = Self::purge_completed_in(tx.conn(), purge_cutoff(older_than)).await?;
		tx.commit().await?;

		Ok(purged)
	}

	pub(crate) async fn purge_completed_in(
		conn: &mut SqliteConnection,
		cutoff: DateTime<Utc>,
	) -> Result<u64, StorageError> {
		let purged = sqlx::query(
			"DELETE FROM sync_queue WHERE status = 'completed' AND completed_at < ?1",
		)
		.bind(cutoff.timestamp_millis())
		.execute(&mut *conn)
		.await?
		.rows_affected();

		if purged > 0 {
			info!(purged, cutoff = %cutoff, "Purged completed sync entries");
		}

		Ok(purged)
	}

	pub async fn get(&self, entry_id: EntryId) -> Result<Option<SyncQueueEntry>, StorageError> {
		sqlx::query(&format!("{SELECT_ENTRY} WHERE entry_id = ?1"))
			.bind(entry_id.to_string())
			.fetch_optional(self.db.pool())
			.await?
			.map(|row| entry_from_row(&row))
			.transpose()
	}

	/// Full history of one record, in processing order
	pub async fn entries_for_record(
		&self,
		record_local_id: LocalId,
	) -> Result<Vec<SyncQueueEntry>, StorageError> {
		sqlx::query(&format!(
			"{SELECT_ENTRY} WHERE record_local_id = ?1 ORDER BY created_at, seq"
		))
		.bind(record_local_id.to_string())
		.fetch_all(self.db.pool())
		.await?
		.iter()
		.map(entry_from_row)
		.collect()
	}

	pub async fn list_by_status(
		&self,
		status: EntryStatus,
	) -> Result<Vec<SyncQueueEntry>, StorageError> {
		sqlx::query(&format!(
			"{SELECT_ENTRY} WHERE status = ?1 ORDER BY created_at, seq"
		))
		.bind(status.as_ref())
		.fetch_all(self.db.pool())
		.await?
		.iter()
		.map(entry_from_row)
		.collect()
	}

	pub async fn counts(&self) -> Result<QueueCounts, StorageError> {
		let rows = sqlx::query("SELECT status, COUNT(*) AS total FROM sync_queue GROUP BY status")
			.fetch_all(self.db.pool())
			.await?;

		let mut counts = QueueCounts::default();
		for row in rows {
			let status = parse_status(&row.try_get::<String, _>("status")?)?;
			let total = u64::try_from(row.try_get::<i64, _>("total")?).unwrap_or_default();
			counts.add(status, total);
		}

		Ok(counts)
	}

	pub async fn has_pending(&self) -> Result<bool, StorageError> {
		let found = sqlx::query("SELECT 1 FROM sync_queue WHERE status = 'pending' LIMIT 1")
			.fetch_optional(self.db.pool())
			.await?;

		Ok(found.is_some())
	}

	async fn move_all(&self, from: EntryStatus, to: EntryStatus) -> Result<u64, StorageError> {
		let mut tx = self.db.begin_write().await?;
		let moved = sqlx::query(
			"UPDATE sync_queue SET status = ?1, updated_at = ?2 WHERE status = ?3",
		)
		.bind(to.as_ref())
		.bind(now_millis())
		.bind(from.as_ref())
		.execute(tx.conn())
		.await?
		.rows_affected();
		tx.commit().await?;

		if moved > 0 {
			debug!(moved, %from, %to, "Moved sync entries");
		}

		Ok(moved)
	}

	async fn complete_in(conn: &mut SqliteConnection, entry_id: EntryId) -> Result<(), QueueError> {
		let now = now_millis();
		let updated = sqlx::query(
			"UPDATE sync_queue SET status = 'completed', completed_at = ?1, updated_at = ?1,
				last_error = NULL
			WHERE entry_id = ?2 AND status = 'in_flight'",
		)
		.bind(now)
		.bind(entry_id.to_string())
		.execute(&mut *conn)
		.await?
		.rows_affected();

		if updated == 0 {
			return Err(transition_error(conn, entry_id, EntryStatus::Completed).await);
		}

		Ok(())
	}

	async fn dead_letter_in(
		conn: &mut SqliteConnection,
		entry_id: EntryId,
		error: &str,
	) -> Result<(), StorageError> {
		sqlx::query(
			"UPDATE sync_queue SET status = 'dead_letter', last_error = ?1, updated_at = ?2
			WHERE entry_id = ?3",
		)
		.bind(error)
		.bind(now_millis())
		.bind(entry_id.to_string())
		.execute(&mut *conn)
		.await?;

		Ok(())
	}
}

async fn status_in(
	conn: &mut SqliteConnection,
	entry_id: EntryId,
) -> Result<Option<EntryStatus>, StorageError> {
	sqlx::query("SELECT status FROM sync_queue WHERE entry_id = ?1")
		.bind(entry_id.to_string())
		.fetch_optional(&mut *conn)
		.await?
		.map(|row| parse_status(&row.try_get::<String, _>("status")?))
		.transpose()
}

async fn require_status(
	conn: &mut SqliteConnection,
	entry_id: EntryId,
	expected: EntryStatus,
	to: EntryStatus,
) -> Result<(), QueueError> {
	match status_in(conn, entry_id).await? {
		Some(status) if status == expected => Ok(()),
		Some(from) => Err(QueueError::InvalidTransition { entry_id, from, to }),
		None => Err(QueueError::NotFound(entry_id)),
	}
}

async fn transition_error(
	conn: &mut SqliteConnection,
	entry_id: EntryId,
	to: EntryStatus,
) -> QueueError {
	match status_in(conn, entry_id).await {
		Ok(Some(from)) => QueueError::InvalidTransition { entry_id, from, to },
		Ok(None) => QueueError::NotFound(entry_id),
		Err(e) => e.into(),
	}
}

fn parse_status(status: &str) -> Result<EntryStatus, StorageError> {
	status
		.parse()
		.map_err(|e| StorageError::corrupted(TABLE, format!("status '{status}': {e}")))
}

fn entry_from_row(row: &SqliteRow) -> Result<SyncQueueEntry, StorageError> {
	let entry_id: String = row.try_get("entry_id")?;
	let record_type: String = row.try_get("record_type")?;
	let record_local_id: String = row.try_get("record_local_id")?;
	let action: String = row.try_get("action")?;
	let snapshot: Vec<u8> = row.try_get("payload_snapshot")?;
	let completed_at: Option<i64> = row.try_get("completed_at")?;

	Ok(SyncQueueEntry {
		entry_id: entry_id
			.parse()
			.map_err(|e| StorageError::corrupted(TABLE, e))?,
		record_type: record_type
			.parse()
			.map_err(|e| StorageError::corrupted(TABLE, e))?,
		record_local_id: record_local_id
			.parse()
			.map_err(|e| StorageError::corrupted(TABLE, e))?,
		action: action
			.parse()
			.map_err(|e| StorageError::corrupted(TABLE, e))?,
		payload_snapshot: rmp_serde::from_slice(&snapshot)?,
		created_at: from_millis(TABLE, row.try_get("created_at")?)?,
		updated_at: from_millis(TABLE, row.try_get("updated_at")?)?,
		completed_at: completed_at
			.map(|millis| from_millis(TABLE, millis))
			.transpose()?,
		attempt_count: u32::try_from(row.try_get::<i64, _>("attempt_count")?)
			.map_err(|e| StorageError::corrupted(TABLE, e))?,
		status: parse_status(&row.try_get::<String, _>("status")?)?,
		last_error: row.try_get("last_error")?,
	})
}

/// Completion time before which completed entries may be purged
pub(crate) fn purge_cutoff(older_than: chrono::Duration) -> DateTime<Utc> {
	Utc::now()
		.checked_sub_signed(older_than)
		.unwrap_or(DateTime::<Utc>::MIN_UTC)
}
