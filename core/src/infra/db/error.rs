use thiserror::Error;

/// Local persistence failure: disk, quota or corruption.
///
/// Never retried automatically. It means the durable medium itself is
/// impaired, so it is surfaced to whoever triggered the write.
#[derive(Debug, Error)]
pub enum StorageError {
	#[error("database error: {0}")]
	Database(#[from] sqlx::Error),

	#[error("database migration failed: {0}")]
	Migration(#[from] sqlx::migrate::MigrateError),

	#[error("failed to encode payload: {0}")]
	Encode(#[from] rmp_serde::encode::Error),

	#[error("failed to decode payload: {0}")]
	Decode(#[from] rmp_serde::decode::Error),

	#[error("corrupted row in '{table}': {reason}")]
	Corrupted { table: &'static str, reason: String },

	#[error("failed to prepare database directory: {0}")]
	Io(#[from] std::io::Error),
}

impl StorageError {
	pub(crate) fn corrupted(table: &'static str, reason: impl ToString) -> Self {
		Self::Corrupted {
			table,
			reason: reason.to_string(),
		}
	}
}
