//! Engine state machine and drain bookkeeping

use super::connectivity::NetworkStatus;
use crate::infra::queue::QueueCounts;
use serde::{Deserialize, Serialize};
use strum::Display;

/// Drain scheduler state
///
/// ```text
/// idle -> draining        reconnect (debounced), force sync, tick while online
/// draining -> cooling_down after each batch
/// cooling_down -> draining pending entries remain
/// cooling_down -> idle     nothing left, or offline
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EngineState {
	#[default]
	Idle,
	Draining,
	CoolingDown,
}

impl EngineState {
	pub fn is_idle(&self) -> bool {
		matches!(self, Self::Idle)
	}

	/// Draining or between batches of the same drain
	pub fn is_active(&self) -> bool {
		!self.is_idle()
	}
}

/// Aggregate status exposed to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
	pub state: EngineState,
	pub network: NetworkStatus,
	pub counts: QueueCounts,
}

impl SyncStatus {
	pub fn pending_count(&self) -> u64 {
		self.counts.pending + self.counts.in_flight
	}

	pub fn failed_count(&self) -> u64 {
		self.counts.failed
	}

	pub fn dead_letter_count(&self) -> u64 {
		self.counts.dead_letter
	}
}

/// How a single dispatched entry ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
	Completed,
	/// Transport failure, will be retried on a later drain
	Failed,
	DeadLettered,
	/// Never reached the transport, back to `pending`
	Released,
	/// Local storage failed while settling, the next drain picks the entry up again
	Errored,
}

/// Totals for one drain
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainReport {
	pub batches: u32,
	pub completed: u32,
	pub failed: u32,
	pub dead_lettered: u32,
	pub released: u32,
	pub errored: u32,
}

impl DrainReport {
	pub(super) fn record(&mut self, outcomes: &[DispatchOutcome]) {
		self.batches += 1;

		for outcome in outcomes {
			match outcome {
				DispatchOutcome::Completed => self.completed += 1,
				DispatchOutcome::Failed => self.failed += 1,
				DispatchOutcome::DeadLettered => self.dead_lettered += 1,
				DispatchOutcome::Released => self.released += 1,
				DispatchOutcome::Errored => self.errored += 1,
			}
		}
	}

	pub fn dispatched(&self) -> u32 {
		self.completed + self.failed + self.dead_lettered
	}
}
