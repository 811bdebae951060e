//! Local SQLite database shared by the record store and the sync queue
//!
//! Both tables live in the same file so that the two cross-table atomic units
//! (record put + enqueue, status update + id reconciliation) are plain
//! transactions. Every write goes through [`Database::begin_write`], which
//! serializes writers behind a single async lock. Writers only hold it for
//! short local transactions, never across network I/O.

mod error;
mod schema;

pub use error::StorageError;

use sqlx::{
	sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
	Sqlite, SqliteConnection, SqlitePool, Transaction,
};
use std::{
	path::{Path, PathBuf},
	sync::Arc,
	time::Duration,
};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

/// File name of the database inside the data directory
pub const DATABASE_FILE: &str = "spectral.db";

const MAX_CONNECTIONS: u32 = 4;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Database {
	pool: SqlitePool,
	writer: Mutex<()>,
	path: PathBuf,
}

impl Database {
	/// Open (creating if needed) the database at `path` and run migrations
	pub async fn open(path: impl AsRef<Path>) -> Result<Arc<Self>, StorageError> {
		let path = path.as_ref().to_path_buf();

		if let Some(parent) = path.parent() {
			tokio::fs::create_dir_all(parent).await?;
		}

		let options = SqliteConnectOptions::new()
			.filename(&path)
			.create_if_missing(true)
			.journal_mode(SqliteJournalMode::Wal)
			.synchronous(SqliteSynchronous::Normal)
			.busy_timeout(BUSY_TIMEOUT);

		let pool = SqlitePoolOptions::new()
			.max_connections(MAX_CONNECTIONS)
			.connect_with(options)
			.await?;

		schema::migrate(&pool).await?;

		info!(path = %path.display(), "Opened local database");

		Ok(Arc::new(Self {
			pool,
			writer: Mutex::new(()),
			path,
		}))
	}

	/// Open the database in its default location inside `data_dir`
	pub async fn open_in(data_dir: impl AsRef<Path>) -> Result<Arc<Self>, StorageError> {
		Self::open(data_dir.as_ref().join(DATABASE_FILE)).await
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	/// Pool for read-only queries
	pub fn pool(&self) -> &SqlitePool {
		&self.pool
	}

	/// Start a write transaction under the single-writer lock.
	///
	/// Dropping the returned [`WriteTx`] without committing rolls back.
	pub async fn begin_write(&self) -> Result<WriteTx<'_>, StorageError> {
		let guard = self.writer.lock().await;
		let tx = self.pool.begin().await?;

		Ok(WriteTx { tx, _guard: guard })
	}

	pub async fn close(&self) {
		debug!(path = %self.path.display(), "Closing local database");
		self.pool.close().await;
	}
}

/// A write transaction holding the writer lock.
///
/// Field order matters: the transaction is dropped (rolled back) before the
/// lock is released.
pub struct WriteTx<'a> {
	tx: Transaction<'static, Sqlite>,
	_guard: MutexGuard<'a, ()>,
}

impl WriteTx<'_> {
	pub fn conn(&mut self) -> &mut SqliteConnection {
		&mut self.tx
	}

	pub async fn commit(self) -> Result<(), StorageError> {
		self.tx.commit().await.map_err(Into::into)
	}
}

/// Current time as epoch milliseconds, the on-disk timestamp format
pub(crate) fn now_millis() -> i64 {
	chrono::Utc::now().timestamp_millis()
}

pub(crate) fn from_millis(
	table: &'static str,
	millis: i64,
) -> Result<chrono::DateTime<chrono::Utc>, StorageError> {
	chrono::DateTime::from_timestamp_millis(millis)
		.ok_or_else(|| StorageError::corrupted(table, format!("invalid timestamp {millis}")))
}

#[cfg(test)]
mod tests {
	use super::*;
	use sqlx::Row;
	use tempfile::tempdir;

	#[tokio::test]
	async fn open_runs_migrations_once() {
		let dir = tempdir().unwrap();

		let db = Database::open_in(dir.path()).await.unwrap();
		let version: i64 = sqlx::query("SELECT MAX(version) FROM _sqlx_migrations WHERE success")
			.fetch_one(db.pool())
			.await
			.unwrap()
			.get(0);
		assert_eq!(version, schema::latest_version());
		db.close().await;

		// Reopening must not fail on already applied migrations
		let db = Database::open_in(dir.path()).await.unwrap();
		assert!(db.path().ends_with(DATABASE_FILE));
	}

	#[tokio::test]
	async fn dropped_write_tx_rolls_back() {
		let dir = tempdir().unwrap();
		let db = Database::open_in(dir.path()).await.unwrap();

		{
			let mut tx = db.begin_write().await.unwrap();
			sqlx::query(
				"INSERT INTO records (local_id, record_type, payload, created_at, updated_at)
				VALUES ('x', 'session', x'00', 0, 0)",
			)
			.execute(tx.conn())
			.await
			.unwrap();
		}

		let count: i64 = sqlx::query("SELECT COUNT(*) FROM records")
			.fetch_one(db.pool())
			.await
			.unwrap()
			.get(0);
		assert_eq!(count, 0);
	}
}
