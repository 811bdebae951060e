//! Schema migrations for the local database
//!
//! Versioned SQL files live in `core/migrations/` and are embedded at compile
//! time. sqlx records applied versions in `_sqlx_migrations`.

use super::StorageError;
use sqlx::{migrate::Migrator, SqlitePool};
use tracing::info;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

pub(super) async fn migrate(pool: &SqlitePool) -> Result<(), StorageError> {
	MIGRATOR.run(pool).await?;

	info!(latest = latest_version(), "Database schema up to date");

	Ok(())
}

pub(super) fn latest_version() -> i64 {
	MIGRATOR.iter().map(|m| m.version).max().unwrap_or(0)
}
