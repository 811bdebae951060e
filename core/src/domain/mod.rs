//! Core domain models
//!
//! Everything the field client captures is a [`Record`]: either an
//! investigation session or a detection event hanging off a session. Records
//! are identified locally until the remote authority assigns a server id.

pub mod record;

pub use record::{
	Attachment, DetectionKind, IdParseError, LocalId, Payload, Record, RecordKind, RecordRef,
	RecordType, ServerId,
};
