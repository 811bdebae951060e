//! Transport abstraction between the drain loop and the server
//!
//! The orchestrator only depends on [`Transport`]; [`HttpTransport`] is the
//! production implementation and tests inject scripted fakes.

mod http;

pub use http::HttpTransport;

use crate::{
	domain::{LocalId, Payload, RecordType, ServerId},
	infra::queue::{EntryId, SyncAction, SyncQueueEntry},
};
use async_trait::async_trait;
use thiserror::Error;

/// A recoverable delivery failure. Retried by the queue up to its retry cap.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
	#[error("network error: {0}")]
	Network(String),

	#[error("server responded with HTTP {status}: {body}")]
	Status { status: u16, body: String },

	#[error("invalid server response: {0}")]
	InvalidResponse(String),

	/// The request could not be built from the entry
	#[error("cannot build request: {0}")]
	Request(String),
}

/// Queue entry plus the identifiers resolved at dispatch time
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRequest {
	pub entry_id: EntryId,
	pub record_type: RecordType,
	pub action: SyncAction,
	pub local_id: LocalId,
	/// Server id of the record itself, needed by updates
	pub server_id: Option<ServerId>,
	/// Best-known id of the parent session, needed by detections
	pub session_id: Option<String>,
	pub payload: Payload,
}

impl OutboundRequest {
	pub fn from_entry(
		entry: &SyncQueueEntry,
		server_id: Option<ServerId>,
		session_id: Option<String>,
	) -> Self {
		Self {
			entry_id: entry.entry_id,
			record_type: entry.record_type,
			action: entry.action,
			local_id: entry.record_local_id,
			server_id,
			session_id,
			payload: entry.payload_snapshot.clone(),
		}
	}

	/// Binary payloads are only sent as multipart on create
	pub fn is_multipart(&self) -> bool {
		self.action == SyncAction::Create && self.payload.is_binary()
	}
}

/// Successful server acknowledgement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAck {
	/// Authoritative id, always present for creates
	pub server_id: Option<ServerId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
	Post,
	Patch,
}

/// HTTP method and path a request is delivered to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
	pub method: Method,
	/// Unencoded path segments below the API base url
	pub segments: Vec<String>,
}

impl Route {
	/// Map a request to its endpoint.
	///
	/// ```text
	/// create session    POST  /sessions
	/// update session    PATCH /sessions/{server_id}
	/// create detection  POST  /sessions/{session_id}/{segment}
	/// update detection  PATCH /sessions/{session_id}/{segment}/{server_id}
	/// ```
	pub fn for_request(request: &OutboundRequest) -> Result<Self, TransportError> {
		let mut segments = vec!["sessions".to_string()];

		if request.record_type.is_detection() {
			let session_id = request.session_id.as_deref().ok_or_else(|| {
				TransportError::Request(format!(
					"{} {} has no parent session id",
					request.record_type, request.local_id
				))
			})?;

			segments.push(session_id.to_string());
			segments.push(request.record_type.endpoint_segment().to_string());
		}

		match request.action {
			SyncAction::Create => Ok(Self {
				method: Method::Post,
				segments,
			}),
			SyncAction::Update => {
				let server_id = request.server_id.as_ref().ok_or_else(|| {
					TransportError::Request(format!(
						"cannot update {} {} before it has a server id",
						request.record_type, request.local_id
					))
				})?;

				segments.push(server_id.to_string());

				Ok(Self {
					method: Method::Patch,
					segments,
				})
			}
		}
	}
}

#[async_trait]
pub trait Transport: Send + Sync {
	async fn send(&self, request: &OutboundRequest) -> Result<ServerAck, TransportError>;
}
