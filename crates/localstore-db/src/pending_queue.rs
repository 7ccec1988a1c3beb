//! The pending queue of a document: edit commands not yet acknowledged by
//! the server.
//!
//! Commands occupy consecutive slots `firstEntryIndex..=lastEntryIndex`.
//! Sent bundles come first, oldest first, followed by the unsent commands.
//! An empty queue has `firstEntryIndex > lastEntryIndex`.

use localstore::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;

use crate::capability::pending_queue::PENDING_QUEUES_STORE;
use crate::operation::Operation;
use crate::record::{self, Record, RecordBase, RecordType};

/// What the next flush of a queue does to its stored slots
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum QueueOperation {
	#[default]
	None,
	Replace,
	Append,
	MarkSent,
	Clear,
	ClearSent,
	ClearSentBundle,
}

impl QueueOperation {
	pub fn as_str(&self) -> &'static str {
		match self {
			QueueOperation::None => "NONE",
			QueueOperation::Replace => "REPLACE",
			QueueOperation::Append => "APPEND",
			QueueOperation::MarkSent => "MARK_SENT",
			QueueOperation::Clear => "CLEAR",
			QueueOperation::ClearSent => "CLEAR_SENT",
			QueueOperation::ClearSentBundle => "CLEAR_SENT_BUNDLE",
		}
	}
}

impl FromStr for QueueOperation {
	type Err = Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"NONE" => Ok(QueueOperation::None),
			"REPLACE" => Ok(QueueOperation::Replace),
			"APPEND" => Ok(QueueOperation::Append),
			"MARK_SENT" => Ok(QueueOperation::MarkSent),
			"CLEAR" => Ok(QueueOperation::Clear),
			"CLEAR_SENT" => Ok(QueueOperation::ClearSent),
			"CLEAR_SENT_BUNDLE" => Ok(QueueOperation::ClearSentBundle),
			other => Err(Error::UnknownQueueOperation(other.into())),
		}
	}
}

/// Persisted description of one sent bundle
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SentBundleInfo {
	pub first_index: i64,
	pub count: i64,
	pub request_id: Box<str>,
}

/// Commands transmitted together, awaiting the server's acknowledgement
#[derive(Clone, Debug, PartialEq)]
pub struct SentBundle {
	pub request_id: Box<str>,
	pub commands: Vec<Value>,
}

/// Persisted `PendingQueues` row
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingQueueRow {
	pub doc_id: Box<str>,
	pub document_type: DocumentType,
	pub first_entry_index: i64,
	pub last_entry_index: i64,
	#[serde(default)]
	pub sent_bundles: Vec<SentBundleInfo>,
	#[serde(default)]
	pub waiting_for_ack: bool,
}

#[derive(Clone, Debug, PartialEq)]
struct LockRequest {
	session_id: Box<str>,
	expiration: Option<Timestamp>,
}

#[derive(Debug)]
pub struct PendingQueue {
	base: RecordBase,
	doc_id: Box<str>,
	document_type: DocumentType,
	first_entry_index: i64,
	last_entry_index: i64,
	sent_bundles: Vec<SentBundle>,
	unsent_commands: Vec<Value>,
	waiting_for_ack: bool,
	operation: QueueOperation,
	/// Commands added by `append_commands` since the last flush
	appended: Vec<Value>,
	/// Slots released by a clear operation since the last flush
	cleared_slots: i64,
	lock: Option<LockRequest>,
	/// Slot bounds once the last generated operations commit
	committed_indices: Option<(i64, i64)>,
}

impl PendingQueue {
	pub fn new(doc_id: &str, document_type: DocumentType) -> Self {
		Self {
			base: RecordBase::new(RecordType::PendingQueue, true),
			doc_id: doc_id.into(),
			document_type,
			first_entry_index: 0,
			last_entry_index: -1,
			sent_bundles: Vec::new(),
			unsent_commands: Vec::new(),
			waiting_for_ack: false,
			operation: QueueOperation::None,
			appended: Vec::new(),
			cleared_slots: 0,
			lock: None,
			committed_indices: None,
		}
	}

	pub(crate) fn from_stored(row: PendingQueueRow, sent_bundles: Vec<SentBundle>, unsent_commands: Vec<Value>) -> Self {
		Self {
			base: RecordBase::new(RecordType::PendingQueue, false),
			doc_id: row.doc_id,
			document_type: row.document_type,
			first_entry_index: row.first_entry_index,
			last_entry_index: row.last_entry_index,
			sent_bundles,
			unsent_commands,
			waiting_for_ack: row.waiting_for_ack,
			operation: QueueOperation::None,
			appended: Vec::new(),
			cleared_slots: 0,
			lock: None,
			committed_indices: None,
		}
	}

	pub fn doc_id(&self) -> &str {
		&self.doc_id
	}

	pub fn document_type(&self) -> DocumentType {
		self.document_type
	}

	pub fn first_entry_index(&self) -> i64 {
		self.first_entry_index
	}

	/// Index of the last occupied slot, -1 for a queue that never held commands
	pub fn last_entry_index(&self) -> i64 {
		self.last_entry_index
	}

	pub fn sent_bundles(&self) -> &[SentBundle] {
		&self.sent_bundles
	}

	pub fn unsent_commands(&self) -> &[Value] {
		&self.unsent_commands
	}

	pub fn is_empty(&self) -> bool {
		self.sent_bundles.iter().all(|b| b.commands.is_empty()) && self.unsent_commands.is_empty()
	}

	pub fn operation(&self) -> QueueOperation {
		self.operation
	}

	pub fn is_waiting_for_ack(&self) -> bool {
		self.waiting_for_ack
	}

	/// A new send may only start while no earlier one awaits its acknowledgement
	pub fn can_send(&self) -> bool {
		!self.waiting_for_ack && !self.unsent_commands.is_empty()
	}

	fn set_operation(&mut self, operation: QueueOperation) -> LsResult<()> {
		if self.operation != QueueOperation::None && self.operation != operation {
			return Err(Error::InvalidState(format!(
				"pending queue {} already has a {} operation",
				self.doc_id,
				self.operation.as_str()
			)));
		}
		self.operation = operation;
		Ok(())
	}

	/// Appends unsent commands
	pub fn append_commands(&mut self, commands: Vec<Value>) -> LsResult<()> {
		if self.operation == QueueOperation::Replace {
			self.unsent_commands.extend(commands);
			return Ok(());
		}
		self.set_operation(QueueOperation::Append)?;
		self.appended.extend(commands.iter().cloned());
		self.unsent_commands.extend(commands);
		Ok(())
	}

	/// Replaces the whole queue content
	pub fn replace(&mut self, sent_bundles: Vec<SentBundle>, unsent_commands: Vec<Value>) -> LsResult<()> {
		if self.operation == QueueOperation::Append {
			// The appended commands are part of what gets replaced
			self.operation = QueueOperation::None;
			self.appended.clear();
		}
		self.set_operation(QueueOperation::Replace)?;
		// Nothing left in flight means no ack to wait for
		if sent_bundles.is_empty() {
			self.waiting_for_ack = false;
		}
		self.sent_bundles = sent_bundles;
		self.unsent_commands = unsent_commands;
		Ok(())
	}

	/// Moves the first `count` unsent commands into a new sent bundle
	pub fn mark_sent(&mut self, request_id: &str, count: usize) -> LsResult<()> {
		if self.waiting_for_ack {
			return Err(Error::InvalidState(format!("pending queue {} is waiting for an ack", self.doc_id)));
		}
		if count > self.unsent_commands.len() {
			return Err(Error::InvalidState(format!(
				"cannot send {} commands, pending queue {} holds {}",
				count,
				self.doc_id,
				self.unsent_commands.len()
			)));
		}
		self.set_operation(QueueOperation::MarkSent)?;
		let commands: Vec<Value> = self.unsent_commands.drain(..count).collect();
		self.sent_bundles.push(SentBundle { request_id: request_id.into(), commands });
		self.waiting_for_ack = true;
		Ok(())
	}

	pub fn clear(&mut self) -> LsResult<()> {
		self.set_operation(QueueOperation::Clear)?;
		self.sent_bundles.clear();
		self.unsent_commands.clear();
		self.waiting_for_ack = false;
		Ok(())
	}

	pub fn clear_sent(&mut self) -> LsResult<()> {
		self.set_operation(QueueOperation::ClearSent)?;
		self.cleared_slots = self.sent_bundles.drain(..).map(|b| b.commands.len() as i64).sum();
		self.waiting_for_ack = false;
		Ok(())
	}

	/// Drops the oldest sent bundle, on acknowledgement by the server
	pub fn clear_sent_bundle(&mut self) -> LsResult<()> {
		if self.sent_bundles.is_empty() {
			return Err(Error::InvalidState(format!("pending queue {} has no sent bundle", self.doc_id)));
		}
		self.set_operation(QueueOperation::ClearSentBundle)?;
		let bundle = self.sent_bundles.remove(0);
		self.cleared_slots = bundle.commands.len() as i64;
		self.waiting_for_ack = false;
		Ok(())
	}

	pub fn set_waiting_for_ack(&mut self, waiting: bool) {
		self.waiting_for_ack = waiting;
		self.base.set_property("waitingForAck", Value::Bool(waiting));
	}

	/// Acquires the document lock in the same transaction as the queue change
	pub fn acquire_lock(&mut self, session_id: &str, expiration: Timestamp) {
		self.lock = Some(LockRequest { session_id: session_id.into(), expiration: Some(expiration) });
	}

	pub fn release_lock(&mut self, session_id: &str) {
		self.lock = Some(LockRequest { session_id: session_id.into(), expiration: None });
	}

	fn key(&self) -> Key {
		Key::from(self.doc_id.as_ref())
	}

	fn to_row(&self) -> LsResult<Value> {
		// Sent bundles are written by MarkSentBundle
		let row = PendingQueueRow {
			doc_id: self.doc_id.clone(),
			document_type: self.document_type,
			first_entry_index: self.first_entry_index,
			last_entry_index: self.last_entry_index,
			sent_bundles: Vec::new(),
			waiting_for_ack: self.waiting_for_ack,
		};
		Ok(serde_json::to_value(row)?)
	}

	/// Slot layout of the sent bundles when they start at `first_index`
	fn bundle_infos(&self, first_index: i64) -> Vec<SentBundleInfo> {
		let mut next = first_index;
		self.sent_bundles
			.iter()
			.map(|bundle| {
				let count = bundle.commands.len() as i64;
				let info = SentBundleInfo { first_index: next, count, request_id: bundle.request_id.clone() };
				next += count;
				info
			})
			.collect()
	}

	/// WriteCommands for `commands`, or nothing for an empty list unless
	/// `allow_empty` (an empty sent bundle still takes part in the layout)
	fn write_commands_operation(&self, start_index: i64, commands: Vec<Value>, allow_empty: bool) -> Option<Operation> {
		if commands.is_empty() && !allow_empty {
			return None;
		}
		Some(Operation::PendingQueueWriteCommands { doc_id: self.doc_id.clone(), start_index, commands })
	}

	/// Writes the new content after the old one, points the queue at it,
	/// then prunes the old slots. A crash at any step leaves either the old
	/// or the new content reachable.
	fn replace_operations(&self, ops: &mut Vec<Operation>) -> (i64, i64) {
		let old_first = self.first_entry_index;
		let old_last = self.last_entry_index;
		let new_first = old_last + 1;

		let mut next = new_first;
		for bundle in &self.sent_bundles {
			if let Some(op) = self.write_commands_operation(next, bundle.commands.clone(), true) {
				ops.push(op);
			}
			next += bundle.commands.len() as i64;
		}
		ops.push(Operation::PendingQueueMarkSentBundle {
			doc_id: self.doc_id.clone(),
			first_entry_index: new_first,
			bundles: self.bundle_infos(new_first),
			waiting_for_ack: self.waiting_for_ack,
		});
		if let Some(op) = self.write_commands_operation(next, self.unsent_commands.clone(), false) {
			ops.push(op);
		}
		next += self.unsent_commands.len() as i64;

		if old_last >= old_first {
			ops.push(Operation::PendingQueueDeleteCommands {
				doc_id: self.doc_id.clone(),
				from_index: old_first,
				to_index: old_last,
			});
		}
		(new_first, next - 1)
	}
}

impl Record for PendingQueue {
	fn base(&self) -> &RecordBase {
		&self.base
	}

	fn base_mut(&mut self) -> &mut RecordBase {
		&mut self.base
	}

	fn create_operations(&mut self) -> LsResult<Vec<Operation>> {
		if self.base.is_to_be_deleted() {
			return Err(Error::UnsupportedOperation(format!(
				"pending queue {} cannot be deleted",
				self.doc_id
			)));
		}

		let mut ops = Vec::new();
		// At most one UpdateRecord per flush
		if let Some(op) =
			record::update_operation(&self.base, PENDING_QUEUES_STORE, self.key(), || self.to_row(), &[])?
		{
			ops.push(op);
		}

		let (first, last) = (self.first_entry_index, self.last_entry_index);
		let indices = match self.operation {
			QueueOperation::None => (first, last),
			QueueOperation::Append => {
				if let Some(op) = self.write_commands_operation(last + 1, self.appended.clone(), false) {
					ops.push(op);
				}
				(first, last + self.appended.len() as i64)
			}
			QueueOperation::Replace => self.replace_operations(&mut ops),
			QueueOperation::MarkSent => {
				ops.push(Operation::PendingQueueMarkSentBundle {
					doc_id: self.doc_id.clone(),
					first_entry_index: first,
					bundles: self.bundle_infos(first),
					waiting_for_ack: true,
				});
				(first, last)
			}
			QueueOperation::Clear => {
				ops.push(Operation::PendingQueueClear { doc_id: self.doc_id.clone() });
				(last + 1, last)
			}
			QueueOperation::ClearSent => {
				ops.push(Operation::PendingQueueClearSent { doc_id: self.doc_id.clone() });
				(first + self.cleared_slots, last)
			}
			QueueOperation::ClearSentBundle => {
				ops.push(Operation::PendingQueueClearSentBundle { doc_id: self.doc_id.clone() });
				(first + self.cleared_slots, last)
			}
		};
		self.committed_indices = Some(indices);

		if let Some(lock) = &self.lock {
			ops.push(Operation::DocumentLock {
				doc_id: self.doc_id.clone(),
				session_id: lock.session_id.clone(),
				expiration: lock.expiration,
			});
		}
		Ok(ops)
	}

	fn on_committed(&mut self) {
		if let Some((first, last)) = self.committed_indices.take() {
			self.first_entry_index = first;
			self.last_entry_index = last;
		}
		self.operation = QueueOperation::None;
		self.appended.clear();
		self.cleared_slots = 0;
		self.lock = None;
		self.base.mark_committed();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	fn create_test_queue(last_entry_index: i64) -> PendingQueue {
		let row = PendingQueueRow {
			doc_id: "d1".into(),
			document_type: DocumentType::Kix,
			first_entry_index: 0,
			last_entry_index,
			sent_bundles: Vec::new(),
			waiting_for_ack: false,
		};
		let unsent = (0..=last_entry_index).map(|i| json!({ "c": i })).collect();
		PendingQueue::from_stored(row, Vec::new(), unsent)
	}

	#[test]
	fn test_append_writes_after_last_entry() {
		let mut queue = create_test_queue(2);
		queue.append_commands(vec![json!({ "c": 3 }), json!({ "c": 4 })]).unwrap();
		let ops = queue.create_operations().unwrap();
		assert_eq!(
			ops,
			vec![Operation::PendingQueueWriteCommands {
				doc_id: "d1".into(),
				start_index: 3,
				commands: vec![json!({ "c": 3 }), json!({ "c": 4 })],
			}]
		);
		queue.on_committed();
		assert_eq!(queue.last_entry_index(), 4);
	}

	#[test]
	fn test_append_emits_at_most_one_update() {
		let mut queue = create_test_queue(0);
		queue.set_waiting_for_ack(true);
		queue.append_commands(vec![json!({ "c": 1 })]).unwrap();
		let ops = queue.create_operations().unwrap();
		assert_eq!(ops.iter().filter(|op| matches!(op, Operation::UpdateRecord { .. })).count(), 1);
		assert!(matches!(ops[1], Operation::PendingQueueWriteCommands { start_index: 1, .. }));
	}

	#[test]
	fn test_replace_writes_before_pruning() {
		let mut queue = create_test_queue(2);
		queue
			.replace(
				vec![SentBundle { request_id: "r1".into(), commands: vec![json!("a"), json!("b")] }],
				vec![json!("c")],
			)
			.unwrap();
		let ops = queue.create_operations().unwrap();
		let names: Vec<&str> = ops.iter().map(Operation::name).collect();
		assert_eq!(
			names,
			[
				"PendingQueueWriteCommands",
				"PendingQueueMarkSentBundle",
				"PendingQueueWriteCommands",
				"PendingQueueDeleteCommands"
			]
		);
		assert!(matches!(ops[0], Operation::PendingQueueWriteCommands { start_index: 3, .. }));
		assert!(matches!(ops[2], Operation::PendingQueueWriteCommands { start_index: 5, .. }));
		assert!(matches!(ops[3], Operation::PendingQueueDeleteCommands { from_index: 0, to_index: 2, .. }));
		match &ops[1] {
			Operation::PendingQueueMarkSentBundle { first_entry_index, bundles, .. } => {
				assert_eq!(*first_entry_index, 3);
				assert_eq!(bundles, &[SentBundleInfo { first_index: 3, count: 2, request_id: "r1".into() }]);
			}
			_ => unreachable!(),
		}
		queue.on_committed();
		assert_eq!((queue.first_entry_index(), queue.last_entry_index()), (3, 5));
	}

	#[test]
	fn test_replace_of_empty_queue_prunes_nothing() {
		let mut queue = PendingQueue::new("d1", DocumentType::Ritz);
		queue.replace(vec![SentBundle { request_id: "r0".into(), commands: vec![] }], vec![]).unwrap();
		let ops = queue.create_operations().unwrap();
		// Insert, empty bundle write, mark sent
		assert_eq!(ops.len(), 3);
		assert!(matches!(ops[0], Operation::UpdateRecord { is_new: true, .. }));
		assert!(matches!(&ops[1], Operation::PendingQueueWriteCommands { commands, .. } if commands.is_empty()));
	}

	#[test]
	fn test_lock_is_appended_last() {
		let mut queue = create_test_queue(-1);
		queue.append_commands(vec![json!(1)]).unwrap();
		queue.acquire_lock("s1", Timestamp::from_millis(1000));
		let ops = queue.create_operations().unwrap();
		assert!(matches!(ops.last(), Some(Operation::DocumentLock { expiration: Some(_), .. })));
	}

	#[test]
	fn test_misuse_is_rejected() {
		let mut queue = create_test_queue(1);
		queue.base_mut().mark_to_be_deleted();
		assert!(matches!(queue.create_operations(), Err(Error::UnsupportedOperation(_))));

		let mut queue = create_test_queue(1);
		queue.clear().unwrap();
		assert!(matches!(queue.append_commands(vec![json!(1)]), Err(Error::InvalidState(_))));

		assert!(matches!("SHUFFLE".parse::<QueueOperation>(), Err(Error::UnknownQueueOperation(_))));
	}

	#[test]
	fn test_mark_sent_requires_no_outstanding_ack() {
		let mut queue = create_test_queue(2);
		queue.mark_sent("r1", 2).unwrap();
		assert!(!queue.can_send());
		let ops = queue.create_operations().unwrap();
		assert!(matches!(&ops[0], Operation::PendingQueueMarkSentBundle { bundles, .. } if bundles[0].count == 2));
		queue.on_committed();
		assert!(matches!(queue.mark_sent("r2", 1), Err(Error::InvalidState(_))));
	}

	#[test]
	fn test_replace_without_sent_bundles_drops_ack_wait() {
		let mut queue = create_test_queue(1);
		queue.mark_sent("r1", 2).unwrap();
		queue.create_operations().unwrap();
		queue.on_committed();
		assert!(queue.is_waiting_for_ack());

		queue.replace(Vec::new(), vec![json!("x")]).unwrap();
		assert!(!queue.is_waiting_for_ack());
		assert!(queue.can_send());
		let ops = queue.create_operations().unwrap();
		assert!(ops.iter().any(|op| matches!(
			op,
			Operation::PendingQueueMarkSentBundle { waiting_for_ack: false, bundles, .. } if bundles.is_empty()
		)));
		queue.on_committed();
		queue.mark_sent("r2", 1).unwrap();
	}
}

// vim: ts=4
