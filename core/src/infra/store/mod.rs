//! Durable local store for captured records
//!
//! Records are keyed by their [`LocalId`] with a secondary index on the parent
//! reference. The store never talks to the network; it only learns server ids
//! through [`LocalStore::reconcile_id`].

use crate::{
	domain::{LocalId, Payload, Record, RecordKind, RecordRef, RecordType, ServerId},
	infra::{
		db::{from_millis, now_millis, Database, StorageError},
		queue::{purge_cutoff, SyncQueue},
	},
};
use sqlx::{sqlite::SqliteRow, Row, SqliteConnection};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

const TABLE: &str = "records";

const SELECT_RECORD: &str = "SELECT local_id, record_type, server_id, parent_scope, parent_id,
	payload, created_at, updated_at FROM records";

#[derive(Debug, Error)]
pub enum ReconcileError {
	#[error("record {0} not found")]
	NotFound(LocalId),

	/// The server acknowledged a create, but the local mapping disagrees.
	/// Blind retries cannot fix this.
	#[error("reconciliation conflict for {local_id}: {reason}")]
	Conflict { local_id: LocalId, reason: String },

	#[error(transparent)]
	Storage(#[from] StorageError),
}

impl From<sqlx::Error> for ReconcileError {
	fn from(e: sqlx::Error) -> Self {
		Self::Storage(e.into())
	}
}

/// Result of a successful reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
	/// The server id was assigned now
	Applied { children_moved: u64 },
	/// The same mapping already existed, nothing changed except stragglers
	AlreadyApplied { children_moved: u64 },
}

#[derive(Clone)]
pub struct LocalStore {
	db: Arc<Database>,
}

impl LocalStore {
	pub fn new(db: Arc<Database>) -> Self {
		Self { db }
	}

	/// Insert or update a record.
	///
	/// Prefer the capture API for records that need server visibility: it pairs
	/// the write with its queue entry.
	pub async fn put(&self, record: &Record) -> Result<LocalId, StorageError> {
		let mut tx = self.db.begin_write().await?;
		Self::put_in(tx.conn(), record).await?;
		tx.commit().await?;

		Ok(record.local_id)
	}

	/// Write a record inside an existing transaction.
	///
	/// `server_id` and `record_type` are never touched on update: the former is
	/// only assigned by reconciliation, the latter is immutable. A local parent
	/// reference is stored as the parent's server id once it has one.
	pub(crate) async fn put_in(
		conn: &mut SqliteConnection,
		record: &Record,
	) -> Result<(), StorageError> {
		let payload = rmp_serde::to_vec_named(&record.payload)?;

		let parent = match record.parent() {
			Some(RecordRef::Local(parent_id)) => Some(
				Self::get_in(conn, *parent_id)
					.await?
					.map_or(RecordRef::Local(*parent_id), |parent| parent.best_known_ref()),
			),
			other => other.cloned(),
		};
		let (parent_scope, parent_id) = parent
			.map(|parent| (Some(parent.scope()), Some(parent.key())))
			.unwrap_or_default();

		sqlx::query(
			"INSERT INTO records
				(local_id, record_type, server_id, parent_scope, parent_id, payload, created_at, updated_at)
			VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
			ON CONFLICT (local_id) DO UPDATE SET
				parent_scope = excluded.parent_scope,
				parent_id = excluded.parent_id,
				payload = excluded.payload,
				updated_at = excluded.updated_at",
		)
		.bind(record.local_id.to_string())
		.bind(record.record_type().as_ref())
		.bind(record.server_id.as_ref().map(ServerId::as_str))
		.bind(parent_scope)
		.bind(parent_id)
		.bind(payload)
		.bind(record.created_at.timestamp_millis())
		.bind(record.updated_at.timestamp_millis())
		.execute(&mut *conn)
		.await?;

		debug!(
			local_id = %record.local_id,
			record_type = %record.record_type(),
			"Stored record"
		);

		Ok(())
	}

	pub async fn get(&self, local_id: LocalId) -> Result<Option<Record>, StorageError> {
		sqlx::query(&format!("{SELECT_RECORD} WHERE local_id = ?1"))
			.bind(local_id.to_string())
			.fetch_optional(self.db.pool())
			.await?
			.map(|row| record_from_row(&row))
			.transpose()
	}

	pub(crate) async fn get_in(
		conn: &mut SqliteConnection,
		local_id: LocalId,
	) -> Result<Option<Record>, StorageError> {
		sqlx::query(&format!("{SELECT_RECORD} WHERE local_id = ?1"))
			.bind(local_id.to_string())
			.fetch_optional(&mut *conn)
			.await?
			.map(|row| record_from_row(&row))
			.transpose()
	}

	/// Look a record up by either its local or its server identifier
	pub async fn get_by_any_id(&self, id: &str) -> Result<Option<Record>, StorageError> {
		sqlx::query(&format!(
			"{SELECT_RECORD} WHERE local_id = ?1 OR server_id = ?1 LIMIT 1"
		))
		.bind(id)
		.fetch_optional(self.db.pool())
		.await?
		.map(|row| record_from_row(&row))
		.transpose()
	}

	/// Children of a session, whichever identifier form they (or the caller)
	/// use. Every call runs a fresh query, so the result is a consistent
	/// snapshot rather than a live cursor.
	pub async fn list_by_parent(&self, parent: &RecordRef) -> Result<Vec<Record>, StorageError> {
		// Resolve both identifier forms of the parent, it may be unknown locally
		let keys = match self.get_by_any_id(&parent.key()).await? {
			Some(session) => (
				session.local_id.to_string(),
				session
					.server_id
					.map_or_else(|| session.local_id.to_string(), |id| id.to_string()),
			),
			None => (parent.key(), parent.key()),
		};

		sqlx::query(&format!(
			"{SELECT_RECORD} WHERE parent_id IN (?1, ?2) ORDER BY created_at, local_id"
		))
		.bind(keys.0)
		.bind(keys.1)
		.fetch_all(self.db.pool())
		.await?
		.iter()
		.map(record_from_row)
		.collect()
	}

	/// Assign the authoritative id of a record and move every child reference
	/// from the local id to the server id, atomically.
	///
	/// Calling it again with the same arguments is a no-op.
	pub async fn reconcile_id(
		&self,
		local_id: LocalId,
		server_id: &ServerId,
	) -> Result<Reconciliation, ReconcileError> {
		let mut tx = self.db.begin_write().await?;
		let reconciliation = Self::reconcile_in(tx.conn(), local_id, server_id).await?;
		tx.commit().await?;

		Ok(reconciliation)
	}

	/// Reconcile inside an existing transaction.
	///
	/// All conflict checks run before the first write, so a conflict leaves the
	/// transaction untouched.
	pub(crate) async fn reconcile_in(
		conn: &mut SqliteConnection,
		local_id: LocalId,
		server_id: &ServerId,
	) -> Result<Reconciliation, ReconcileError> {
		let record = Self::get_in(conn, local_id)
			.await?
			.ok_or(ReconcileError::NotFound(local_id))?;

		let already_applied = match &record.server_id {
			Some(existing) if existing == server_id => true,
			Some(existing) => {
				return Err(ReconcileError::Conflict {
					local_id,
					reason: format!("already mapped to server id '{existing}', got '{server_id}'"),
				});
			}
			None => false,
		};

		if !already_applied {
			let owner: Option<String> =
				sqlx::query("SELECT local_id FROM records WHERE server_id = ?1")
					.bind(server_id.as_str())
					.fetch_optional(&mut *conn)
					.await?
					.map(|row| row.try_get("local_id"))
					.transpose()?;

			if let Some(owner) = owner {
				return Err(ReconcileError::Conflict {
					local_id,
					reason: format!("server id '{server_id}' already belongs to record {owner}"),
				});
			}

			sqlx::query(
				"UPDATE records SET server_id = ?1, updated_at = ?2
				WHERE local_id = ?3 AND server_id IS NULL",
			)
			.bind(server_id.as_str())
			.bind(now_millis())
			.bind(local_id.to_string())
			.execute(&mut *conn)
			.await?;
		}

		let children_moved = sqlx::query(
			"UPDATE records SET parent_scope = 'server', parent_id = ?1, updated_at = ?2
			WHERE parent_scope = 'local' AND parent_id = ?3",
		)
		.bind(server_id.as_str())
		.bind(now_millis())
		.bind(local_id.to_string())
		.execute(&mut *conn)
		.await?
		.rows_affected();

		if already_applied {
			debug!(%local_id, %server_id, children_moved, "Reconciliation already applied");
			Ok(Reconciliation::AlreadyApplied { children_moved })
		} else {
			info!(%local_id, %server_id, children_moved, "Reconciled record id");
			Ok(Reconciliation::Applied { children_moved })
		}
	}

	/// Drop completed queue entries older than the audit window
	pub async fn purge_completed(&self, older_than: chrono::Duration) -> Result<u64, StorageError> {
		let mut tx = self.db.begin_write().await?;
		let purged = SyncQueue::purge_completed_in(tx.conn(), purge_cutoff(older_than)).await?;
		tx.commit().await?;

		Ok(purged)
	}

	pub async fn count(&self) -> Result<u64, StorageError> {
		let count: i64 = sqlx::query("SELECT COUNT(*) FROM records")
			.fetch_one(self.db.pool())
			.await?
			.try_get(0)?;

		Ok(u64::try_from(count).unwrap_or_default())
	}
}

fn record_from_row(row: &SqliteRow) -> Result<Record, StorageError> {
	let local_id: String = row.try_get("local_id")?;
	let record_type: String = row.try_get("record_type")?;
	let server_id: Option<String> = row.try_get("server_id")?;
	let parent_scope: Option<String> = row.try_get("parent_scope")?;
	let parent_id: Option<String> = row.try_get("parent_id")?;
	let payload: Vec<u8> = row.try_get("payload")?;

	let local_id: LocalId = local_id
		.parse()
		.map_err(|e| StorageError::corrupted(TABLE, e))?;
	let record_type: RecordType = record_type
		.parse()
		.map_err(|e| StorageError::corrupted(TABLE, e))?;

	let kind = match (record_type.detection_kind(), parent_scope, parent_id) {
		(None, _, _) => RecordKind::Session,
		(Some(kind), Some(scope), Some(id)) => RecordKind::Detection {
			kind,
			parent: RecordRef::from_parts(&scope, &id)
				.map_err(|e| StorageError::corrupted(TABLE, e))?,
		},
		(Some(kind), _, _) => {
			return Err(StorageError::corrupted(
				TABLE,
				format!("{kind} record {local_id} has no parent"),
			));
		}
	};

	Ok(Record {
		local_id,
		server_id: server_id.map(ServerId::new),
		kind,
		payload: rmp_serde::from_slice::<Payload>(&payload)?,
		created_at: from_millis(TABLE, row.try_get("created_at")?)?,
		updated_at: from_millis(TABLE, row.try_get("updated_at")?)?,
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::domain::DetectionKind;
	use pretty_assertions::assert_eq;
	use serde_json::json;
	use tempfile::{tempdir, TempDir};

	async fn store() -> (TempDir, LocalStore) {
		let dir = tempdir().unwrap();
		let db = Database::open_in(dir.path()).await.unwrap();
		(dir, LocalStore::new(db))
	}

	fn session() -> Record {
		Record::session(Payload::new(json!({ "location": "lighthouse" })))
	}

	#[tokio::test]
	async fn put_then_get_roundtrips_payload_and_parent() {
		let (_dir, store) = store().await;

		let session = session();
		store.put(&session).await.unwrap();

		let evp = Record::detection(
			DetectionKind::Evp,
			session.local_id,
			Payload::new(json!({ "db": -42.5 })).with_attachment(
				"audio",
				"clip.wav",
				"audio/wav",
				vec![1, 2, 3, 4],
			),
		);
		store.put(&evp).await.unwrap();

		let loaded = store.get(evp.local_id).await.unwrap().unwrap();
		assert_eq!(loaded.kind, evp.kind);
		assert_eq!(loaded.payload, evp.payload);
		assert_eq!(loaded.server_id, None);

		assert!(store.get(LocalId::new()).await.unwrap().is_none());
	}

	#[tokio::test]
	async fn put_updates_payload_but_not_server_id() {
		let (_dir, store) = store().await;

		let mut session = session();
		store.put(&session).await.unwrap();
		store
			.reconcile_id(session.local_id, &ServerId::new("S1"))
			.await
			.unwrap();

		// Stale in-memory copy without a server id must not clear it
		session.payload = Payload::new(json!({ "location": "cellar" }));
		store.put(&session).await.unwrap();

		let loaded = store.get(session.local_id).await.unwrap().unwrap();
		assert_eq!(loaded.payload.metadata, json!({ "location": "cellar" }));
		assert_eq!(loaded.server_id, Some(ServerId::new("S1")));
	}

	#[tokio::test]
	async fn stale_child_put_keeps_the_reconciled_parent() {
		let (_dir, store) = store().await;

		let session = session();
		store.put(&session).await.unwrap();

		let mut evp = Record::detection(DetectionKind::Evp, session.local_id, Payload::default());
		store.put(&evp).await.unwrap();

		store
			.reconcile_id(session.local_id, &ServerId::new("S1"))
			.await
			.unwrap();

		// In-memory copy still points at the session's local id
		evp.payload = Payload::new(json!({ "db": -30.0 }));
		store.put(&evp).await.unwrap();

		let loaded = store.get(evp.local_id).await.unwrap().unwrap();
		assert_eq!(loaded.parent(), Some(&RecordRef::Server(ServerId::new("S1"))));
		assert_eq!(loaded.payload.metadata, json!({ "db": -30.0 }));

		let children = store
			.list_by_parent(&RecordRef::Server(ServerId::new("S1")))
			.await
			.unwrap();
		assert_eq!(children.len(), 1);
	}

	#[tokio::test]
	async fn reconcile_moves_children_and_is_idempotent() {
		let (_dir, store) = store().await;

		let session = session();
		store.put(&session).await.unwrap();

		let children = [DetectionKind::Radar, DetectionKind::Sls]
			.map(|kind| Record::detection(kind, session.local_id, Payload::default()));
		for child in &children {
			store.put(child).await.unwrap();
		}

		let server_id = ServerId::new("S1");
		assert_eq!(
			store.reconcile_id(session.local_id, &server_id).await.unwrap(),
			Reconciliation::Applied { children_moved: 2 }
		);

		let snapshot = |records: Vec<Record>| {
			records
				.into_iter()
				.map(|r| (r.local_id, r.server_id, r.kind))
				.collect::<Vec<_>>()
		};

		let first = snapshot(
			store
				.list_by_parent(&RecordRef::Server(server_id.clone()))
				.await
				.unwrap(),
		);
		assert_eq!(first.len(), 2);
		for (_, _, kind) in &first {
			assert_eq!(kind.parent(), Some(&RecordRef::Server(server_id.clone())));
		}

		assert_eq!(
			store.reconcile_id(session.local_id, &server_id).await.unwrap(),
			Reconciliation::AlreadyApplied { children_moved: 0 }
		);

		let second = snapshot(
			store
				.list_by_parent(&RecordRef::Server(server_id.clone()))
				.await
				.unwrap(),
		);
		assert_eq!(first, second);
	}

	#[tokio::test]
	async fn list_by_parent_resolves_local_id_after_reconcile() {
		let (_dir, store) = store().await;

		let session = session();
		store.put(&session).await.unwrap();
		let child = Record::detection(DetectionKind::Vox, session.local_id, Payload::default());
		store.put(&child).await.unwrap();

		store
			.reconcile_id(session.local_id, &ServerId::new("S1"))
			.await
			.unwrap();

		let by_local = store
			.list_by_parent(&RecordRef::Local(session.local_id))
			.await
			.unwrap();
		assert_eq!(by_local.len(), 1);
		assert_eq!(by_local[0].local_id, child.local_id);
	}

	#[tokio::test]
	async fn reconcile_rejects_conflicting_mappings() {
		let (_dir, store) = store().await;

		let a = session();
		let b = session();
		store.put(&a).await.unwrap();
		store.put(&b).await.unwrap();

		store
			.reconcile_id(a.local_id, &ServerId::new("S1"))
			.await
			.unwrap();

		// Same record, different server id
		assert!(matches!(
			store.reconcile_id(a.local_id, &ServerId::new("S2")).await,
			Err(ReconcileError::Conflict { .. })
		));

		// Different record, server id already taken
		assert!(matches!(
			store.reconcile_id(b.local_id, &ServerId::new("S1")).await,
			Err(ReconcileError::Conflict { .. })
		));

		assert!(matches!(
			store.reconcile_id(LocalId::new(), &ServerId::new("S3")).await,
			Err(ReconcileError::NotFound(_))
		));

		let b = store.get(b.local_id).await.unwrap().unwrap();
		assert_eq!(b.server_id, None);
	}
}
