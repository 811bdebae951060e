//! Signals fed into the orchestrator by whatever watches the network
//!
//! The engine does not check connectivity itself. Platform glue (or the CLI,
//! or a test) holds a [`ConnectivityHandle`] and reports transitions.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use strum::{AsRefStr, Display};
use tokio::sync::{mpsc, watch};
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum ConnectivitySignal {
	Online,
	Offline,
	/// Process resumed from background, treated like a reconnect hint
	BecameVisible,
	/// Explicit request to drain now
	ForceSync,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NetworkStatus {
	Online,
	#[default]
	Offline,
}

impl NetworkStatus {
	pub fn is_online(&self) -> bool {
		matches!(self, Self::Online)
	}
}

/// Cheap, cloneable sender of connectivity signals.
///
/// `online`/`offline` update the published [`NetworkStatus`] before the signal
/// is queued, so a running drain stops dispatching as soon as `offline`
/// returns, without waiting for the scheduler to pick the signal up.
#[derive(Debug, Clone)]
pub struct ConnectivityHandle {
	tx: mpsc::UnboundedSender<ConnectivitySignal>,
	network: Arc<watch::Sender<NetworkStatus>>,
}

impl ConnectivityHandle {
	pub(super) fn channel(
		network: Arc<watch::Sender<NetworkStatus>>,
	) -> (Self, mpsc::UnboundedReceiver<ConnectivitySignal>) {
		let (tx, rx) = mpsc::unbounded_channel();
		(Self { tx, network }, rx)
	}

	/// Returns false once the engine has been dropped
	pub fn signal(&self, signal: ConnectivitySignal) -> bool {
		trace!(%signal, "Connectivity signal");

		match signal {
			ConnectivitySignal::Online => {
				self.network.send_replace(NetworkStatus::Online);
			}
			ConnectivitySignal::Offline => {
				self.network.send_replace(NetworkStatus::Offline);
			}
			ConnectivitySignal::BecameVisible | ConnectivitySignal::ForceSync => {}
		}

		self.tx.send(signal).is_ok()
	}

	pub fn status(&self) -> NetworkStatus {
		*self.network.borrow()
	}

	pub fn online(&self) -> bool {
		self.signal(ConnectivitySignal::Online)
	}

	pub fn offline(&self) -> bool {
		self.signal(ConnectivitySignal::Offline)
	}

	pub fn became_visible(&self) -> bool {
		self.signal(ConnectivitySignal::BecameVisible)
	}

	pub fn force_sync(&self) -> bool {
		self.signal(ConnectivitySignal::ForceSync)
	}
}
