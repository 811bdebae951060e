//! Scriptable in-memory transport

use async_trait::async_trait;
use spectral_core::{
	domain::ServerId,
	infra::queue::SyncAction,
	service::sync::{OutboundRequest, ServerAck, Transport, TransportError},
};
use std::{
	sync::{
		atomic::{AtomicBool, AtomicU64, Ordering},
		Arc, Mutex,
	},
	time::Duration,
};

type AfterSend = Box<dyn FnMut(usize) + Send>;

/// Records every request. Creates are acknowledged with `S1`, `S2`, ... in
/// send order unless the transport is set to fail.
#[derive(Default)]
pub struct MockTransport {
	failing: AtomicBool,
	next_id: AtomicU64,
	delay: Option<Duration>,
	sent: Mutex<Vec<OutboundRequest>>,
	after_send: Mutex<Option<AfterSend>>,
}

impl MockTransport {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	/// Every send fails with HTTP 503
	pub fn failing() -> Arc<Self> {
		let transport = Self::default();
		transport.failing.store(true, Ordering::SeqCst);
		Arc::new(transport)
	}

	pub fn with_delay(delay: Duration) -> Arc<Self> {
		Arc::new(Self {
			delay: Some(delay),
			..Default::default()
		})
	}

	pub fn set_failing(&self, failing: bool) {
		self.failing.store(failing, Ordering::SeqCst);
	}

	/// Run `hook` with the number of sends so far, before each send returns
	pub fn after_send(&self, hook: impl FnMut(usize) + Send + 'static) {
		*self.after_send.lock().unwrap() = Some(Box::new(hook));
	}

	pub fn sent(&self) -> Vec<OutboundRequest> {
		self.sent.lock().unwrap().clone()
	}

	pub fn send_count(&self) -> usize {
		self.sent.lock().unwrap().len()
	}
}

#[async_trait]
impl Transport for MockTransport {
	async fn send(&self, request: &OutboundRequest) -> Result<ServerAck, TransportError> {
		if let Some(delay) = self.delay {
			tokio::time::sleep(delay).await;
		}

		let count = {
			let mut sent = self.sent.lock().unwrap();
			sent.push(request.clone());
			sent.len()
		};

		let result = if self.failing.load(Ordering::SeqCst) {
			Err(TransportError::Status {
				status: 503,
				body: "service unavailable".to_string(),
			})
		} else {
			let server_id = match request.action {
				SyncAction::Create => {
					let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
					Some(ServerId::new(format!("S{n}")))
				}
				SyncAction::Update => request.server_id.clone(),
			};
			Ok(ServerAck { server_id })
		};

		if let Some(hook) = self.after_send.lock().unwrap().as_mut() {
			hook(count);
		}

		result
	}
}
