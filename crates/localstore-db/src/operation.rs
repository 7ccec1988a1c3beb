//! Storage operations derived from records.
//!
//! Operations are a closed set. Each one is routed by its record type to the
//! single capability that owns the stores it touches.

use localstore::prelude::*;
use serde_json::{Map, Value};

use crate::pending_queue::SentBundleInfo;
use crate::record::RecordType;

#[derive(Clone, Debug, PartialEq)]
pub enum Operation {
	/// Inserts a new row (`is_new`) or patches an existing one
	UpdateRecord {
		record_type: RecordType,
		store: &'static str,
		key: Key,
		modifications: Map<String, Value>,
		is_new: bool,
		nullable: &'static [&'static str],
	},
	DeleteRecord {
		record_type: RecordType,
		store: &'static str,
		key: Key,
	},
	/// Appends a chunk of commands to a document, or to its staging area
	AppendCommands {
		doc_id: Box<str>,
		part_id: Box<str>,
		revision: i64,
		chunk_index: i64,
		commands: Vec<Value>,
		staged: bool,
	},
	/// Promotes every staged command chunk of a document into its live commands
	CommitStagedCommands {
		doc_id: Box<str>,
	},
	/// Acquires (`expiration` set) or releases (`None`) a document lock
	DocumentLock {
		doc_id: Box<str>,
		session_id: Box<str>,
		expiration: Option<Timestamp>,
	},
	/// Writes commands into consecutive slots starting at `start_index`
	PendingQueueWriteCommands {
		doc_id: Box<str>,
		start_index: i64,
		commands: Vec<Value>,
	},
	PendingQueueMarkSentBundle {
		doc_id: Box<str>,
		first_entry_index: i64,
		bundles: Vec<SentBundleInfo>,
		waiting_for_ack: bool,
	},
	/// Removes the slots `from_index..=to_index`
	PendingQueueDeleteCommands {
		doc_id: Box<str>,
		from_index: i64,
		to_index: i64,
	},
	PendingQueueClear {
		doc_id: Box<str>,
	},
	PendingQueueClearSent {
		doc_id: Box<str>,
	},
	/// Drops the oldest sent bundle after the server acknowledged it
	PendingQueueClearSentBundle {
		doc_id: Box<str>,
	},
	/// Removes the impressions of a document recorded up to `up_to`
	DeleteImpressions {
		doc_id: Box<str>,
		up_to: Timestamp,
	},
}

impl Operation {
	/// Record type of the capability that applies this operation
	pub fn record_type(&self) -> RecordType {
		match self {
			Operation::UpdateRecord { record_type, .. } | Operation::DeleteRecord { record_type, .. } => *record_type,
			Operation::AppendCommands { .. }
			| Operation::CommitStagedCommands { .. }
			| Operation::DocumentLock { .. } => RecordType::Document,
			Operation::PendingQueueWriteCommands { .. }
			| Operation::PendingQueueMarkSentBundle { .. }
			| Operation::PendingQueueDeleteCommands { .. }
			| Operation::PendingQueueClear { .. }
			| Operation::PendingQueueClearSent { .. }
			| Operation::PendingQueueClearSentBundle { .. } => RecordType::PendingQueue,
			Operation::DeleteImpressions { .. } => RecordType::Impression,
		}
	}

	pub fn name(&self) -> &'static str {
		match self {
			Operation::UpdateRecord { .. } => "UpdateRecord",
			Operation::DeleteRecord { .. } => "DeleteRecord",
			Operation::AppendCommands { .. } => "AppendCommands",
			Operation::CommitStagedCommands { .. } => "CommitStagedCommands",
			Operation::DocumentLock { .. } => "DocumentLock",
			Operation::PendingQueueWriteCommands { .. } => "PendingQueueWriteCommands",
			Operation::PendingQueueMarkSentBundle { .. } => "PendingQueueMarkSentBundle",
			Operation::PendingQueueDeleteCommands { .. } => "PendingQueueDeleteCommands",
			Operation::PendingQueueClear { .. } => "PendingQueueClear",
			Operation::PendingQueueClearSent { .. } => "PendingQueueClearSent",
			Operation::PendingQueueClearSentBundle { .. } => "PendingQueueClearSentBundle",
			Operation::DeleteImpressions { .. } => "DeleteImpressions",
		}
	}
}

// vim: ts=4
