//! Captured records and their identifiers

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use strum::{AsRefStr, Display, EnumString};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
#[error("invalid identifier '{value}': {reason}")]
pub struct IdParseError {
	pub value: String,
	pub reason: String,
}

/// Client-generated identifier, stable for the record's whole local lifetime.
///
/// Uses UUIDv7 so that ids sort roughly by creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalId(Uuid);

impl LocalId {
	pub fn new() -> Self {
		Self(Uuid::now_v7())
	}
}

impl Default for LocalId {
	fn default() -> Self {
		Self::new()
	}
}

impl fmt::Display for LocalId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0.hyphenated())
	}
}

impl FromStr for LocalId {
	type Err = IdParseError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Uuid::parse_str(s).map(Self).map_err(|e| IdParseError {
			value: s.to_string(),
			reason: e.to_string(),
		})
	}
}

/// Authoritative identifier assigned by the remote authority.
///
/// Opaque to the client; we never try to interpret its format.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerId(String);

impl ServerId {
	pub fn new(id: impl Into<String>) -> Self {
		Self(id.into())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for ServerId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// A reference to another record, in whichever identifier form was the
/// best known one when the reference was written.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", content = "id", rename_all = "snake_case")]
pub enum RecordRef {
	Local(LocalId),
	Server(ServerId),
}

impl RecordRef {
	/// The raw identifier, as used in endpoint paths and the parent index
	pub fn key(&self) -> String {
		match self {
			Self::Local(id) => id.to_string(),
			Self::Server(id) => id.to_string(),
		}
	}

	pub fn scope(&self) -> &'static str {
		match self {
			Self::Local(_) => "local",
			Self::Server(_) => "server",
		}
	}

	/// Rebuilds a reference from its persisted `(scope, key)` pair
	pub fn from_parts(scope: &str, key: &str) -> Result<Self, IdParseError> {
		match scope {
			"local" => key.parse().map(Self::Local),
			"server" => Ok(Self::Server(ServerId::new(key))),
			other => Err(IdParseError {
				value: key.to_string(),
				reason: format!("unknown reference scope '{other}'"),
			}),
		}
	}
}

impl From<LocalId> for RecordRef {
	fn from(id: LocalId) -> Self {
		Self::Local(id)
	}
}

impl From<ServerId> for RecordRef {
	fn from(id: ServerId) -> Self {
		Self::Server(id)
	}
}

/// Kinds of detection event a producer can emit
#[derive(
	Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DetectionKind {
	/// Electronic voice phenomenon, carries an audio clip
	Evp,
	/// Voice-activated recording, carries an audio clip
	Vox,
	Radar,
	/// Structured-light sensor figure detection
	Sls,
	Interaction,
}

/// Flat discriminant of a record, persisted in both the record and queue tables
#[derive(
	Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RecordType {
	Session,
	Evp,
	Vox,
	Radar,
	Sls,
	Interaction,
}

impl RecordType {
	pub fn detection_kind(&self) -> Option<DetectionKind> {
		match self {
			Self::Session => None,
			Self::Evp => Some(DetectionKind::Evp),
			Self::Vox => Some(DetectionKind::Vox),
			Self::Radar => Some(DetectionKind::Radar),
			Self::Sls => Some(DetectionKind::Sls),
			Self::Interaction => Some(DetectionKind::Interaction),
		}
	}

	pub fn is_detection(&self) -> bool {
		self.detection_kind().is_some()
	}

	/// Collection segment used under `/sessions/{sessionId}/`
	pub fn endpoint_segment(&self) -> &'static str {
		match self {
			Self::Session => "sessions",
			Self::Evp => "evp",
			Self::Vox => "vox",
			Self::Radar => "radar",
			Self::Sls => "sls",
			Self::Interaction => "interactions",
		}
	}
}

impl From<DetectionKind> for RecordType {
	fn from(kind: DetectionKind) -> Self {
		match kind {
			DetectionKind::Evp => Self::Evp,
			DetectionKind::Vox => Self::Vox,
			DetectionKind::Radar => Self::Radar,
			DetectionKind::Sls => Self::Sls,
			DetectionKind::Interaction => Self::Interaction,
		}
	}
}

/// A named binary part of a payload (audio clip, snapshot frame, ...)
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
	/// Multipart field name the server expects for this part
	pub field: String,
	pub file_name: String,
	pub content_type: String,
	pub data: Vec<u8>,
}

impl fmt::Debug for Attachment {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Attachment")
			.field("field", &self.field)
			.field("file_name", &self.file_name)
			.field("content_type", &self.content_type)
			.field("len", &self.data.len())
			.finish()
	}
}

/// Record content. Opaque to the sync engine apart from whether it carries
/// binary attachments, which decides the wire encoding.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Payload {
	pub metadata: serde_json::Value,
	#[serde(default)]
	pub attachments: Vec<Attachment>,
}

impl Payload {
	pub fn new(metadata: serde_json::Value) -> Self {
		Self {
			metadata,
			attachments: Vec::new(),
		}
	}

	pub fn with_attachment(
		mut self,
		field: impl Into<String>,
		file_name: impl Into<String>,
		content_type: impl Into<String>,
		data: Vec<u8>,
	) -> Self {
		self.attachments.push(Attachment {
			field: field.into(),
			file_name: file_name.into(),
			content_type: content_type.into(),
			data,
		});
		self
	}

	pub fn is_binary(&self) -> bool {
		!self.attachments.is_empty()
	}
}

/// Session or detection event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecordKind {
	Session,
	Detection {
		kind: DetectionKind,
		/// The owning session, by its best-known identifier
		parent: RecordRef,
	},
}

impl RecordKind {
	pub fn record_type(&self) -> RecordType {
		match self {
			Self::Session => RecordType::Session,
			Self::Detection { kind, .. } => (*kind).into(),
		}
	}

	pub fn parent(&self) -> Option<&RecordRef> {
		match self {
			Self::Session => None,
			Self::Detection { parent, .. } => Some(parent),
		}
	}
}

/// A domain entity subject to synchronization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
	pub local_id: LocalId,
	/// Set exactly once, after the first successful create
	pub server_id: Option<ServerId>,
	pub kind: RecordKind,
	pub payload: Payload,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
}

impl Record {
	pub fn session(payload: Payload) -> Self {
		Self::new(RecordKind::Session, payload)
	}

	pub fn detection(kind: DetectionKind, parent: impl Into<RecordRef>, payload: Payload) -> Self {
		Self::new(
			RecordKind::Detection {
				kind,
				parent: parent.into(),
			},
			payload,
		)
	}

	fn new(kind: RecordKind, payload: Payload) -> Self {
		let now = Utc::now();
		Self {
			local_id: LocalId::new(),
			server_id: None,
			kind,
			payload,
			created_at: now,
			updated_at: now,
		}
	}

	pub fn record_type(&self) -> RecordType {
		self.kind.record_type()
	}

	pub fn parent(&self) -> Option<&RecordRef> {
		self.kind.parent()
	}

	/// Best-known identifier for this record: server id once reconciled
	pub fn best_known_ref(&self) -> RecordRef {
		match &self.server_id {
			Some(server_id) => RecordRef::Server(server_id.clone()),
			None => RecordRef::Local(self.local_id),
		}
	}
}
