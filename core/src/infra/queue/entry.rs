use crate::domain::{IdParseError, LocalId, Payload, RecordType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(Uuid);

impl EntryId {
	pub fn new() -> Self {
		Self(Uuid::now_v7())
	}
}

impl Default for EntryId {
	fn default() -> Self {
		Self::new()
	}
}

impl fmt::Display for EntryId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0.hyphenated())
	}
}

impl FromStr for EntryId {
	type Err = IdParseError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Uuid::parse_str(s).map(Self).map_err(|e| IdParseError {
			value: s.to_string(),
			reason: e.to_string(),
		})
	}
}

/// Mutation a queue entry delivers
#[derive(
	Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SyncAction {
	Create,
	Update,
}

/// Lifecycle of a queue entry
///
/// ```text
/// pending -> in_flight -> completed
/// pending -> in_flight -> failed -> pending
/// pending -> in_flight -> dead_letter
/// ```
#[derive(
	Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EntryStatus {
	Pending,
	InFlight,
	Completed,
	/// Waiting for the next drain cycle to be retried
	Failed,
	/// Retry budget exhausted or unfixable, needs an operator
	DeadLetter,
}

/// Durable descriptor of one pending mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncQueueEntry {
	pub entry_id: EntryId,
	pub record_type: RecordType,
	pub record_local_id: LocalId,
	pub action: SyncAction,
	/// Copy of the payload taken at enqueue time, later edits do not leak in
	pub payload_snapshot: Payload,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
	pub completed_at: Option<DateTime<Utc>>,
	pub attempt_count: u32,
	pub status: EntryStatus,
	pub last_error: Option<String>,
}

/// Number of entries per status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
	pub pending: u64,
	pub in_flight: u64,
	pub failed: u64,
	pub completed: u64,
	pub dead_letter: u64,
}

impl QueueCounts {
	pub(super) fn add(&mut self, status: EntryStatus, count: u64) {
		match status {
			EntryStatus::Pending => self.pending += count,
			EntryStatus::InFlight => self.in_flight += count,
			EntryStatus::Completed => self.completed += count,
			EntryStatus::Failed => self.failed += count,
			EntryStatus::DeadLetter => self.dead_letter += count,
		}
	}

	/// Entries that still have to reach the server
	pub fn outstanding(&self) -> u64 {
		self.pending + self.in_flight + self.failed
	}
}
