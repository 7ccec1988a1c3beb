//! In-memory records and the bookkeeping they share.

use localstore::prelude::*;
use serde_json::{Map, Value};

use crate::operation::Operation;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordType {
	Document,
	PendingQueue,
	Comment,
	DocumentEntity,
	SyncStats,
	Impression,
}

impl RecordType {
	pub fn as_str(&self) -> &'static str {
		match self {
			RecordType::Document => "document",
			RecordType::PendingQueue => "pendingQueue",
			RecordType::Comment => "comment",
			RecordType::DocumentEntity => "documentEntity",
			RecordType::SyncStats => "syncStats",
			RecordType::Impression => "impression",
		}
	}
}

impl std::fmt::Display for RecordType {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

/// State every record carries: its type, whether it was ever written,
/// whether it is to be deleted, and the properties changed since the last
/// successful write.
#[derive(Clone, Debug, PartialEq)]
pub struct RecordBase {
	record_type: RecordType,
	is_new: bool,
	to_be_deleted: bool,
	modifications: Map<String, Value>,
}

impl RecordBase {
	pub fn new(record_type: RecordType, is_new: bool) -> Self {
		Self { record_type, is_new, to_be_deleted: false, modifications: Map::new() }
	}

	pub fn record_type(&self) -> RecordType {
		self.record_type
	}

	pub fn is_new(&self) -> bool {
		self.is_new
	}

	pub fn is_to_be_deleted(&self) -> bool {
		self.to_be_deleted
	}

	pub fn mark_to_be_deleted(&mut self) {
		self.to_be_deleted = true;
	}

	/// Records a property change to be written with the next flush
	pub fn set_property(&mut self, property: &str, value: Value) {
		self.modifications.insert(property.into(), value);
	}

	pub fn modifications(&self) -> &Map<String, Value> {
		&self.modifications
	}

	pub fn has_modifications(&self) -> bool {
		!self.modifications.is_empty()
	}

	/// Called once the record's operations committed
	pub fn mark_committed(&mut self) {
		self.is_new = false;
		self.modifications.clear();
	}
}

pub trait Record: Send {
	fn base(&self) -> &RecordBase;

	fn base_mut(&mut self) -> &mut RecordBase;

	fn record_type(&self) -> RecordType {
		self.base().record_type()
	}

	/// Storage operations that persist the record's pending changes
	fn create_operations(&mut self) -> LsResult<Vec<Operation>>;

	fn on_committed(&mut self) {
		self.base_mut().mark_committed();
	}
}

/// Builds the insert-or-patch operation of a record, if it needs one.
///
/// New records are inserted whole from `row`; existing ones are patched
/// with their modifications only.
pub fn update_operation(
	base: &RecordBase,
	store: &'static str,
	key: Key,
	row: impl FnOnce() -> LsResult<Value>,
	nullable: &'static [&'static str],
) -> LsResult<Option<Operation>> {
	if base.is_new() {
		let Value::Object(row) = row()? else {
			return Err(Error::Serialization(format!("{} row is not an object", base.record_type())));
		};
		return Ok(Some(Operation::UpdateRecord {
			record_type: base.record_type(),
			store,
			key,
			modifications: row,
			is_new: true,
			nullable,
		}));
	}
	if !base.has_modifications() {
		return Ok(None);
	}
	Ok(Some(Operation::UpdateRecord {
		record_type: base.record_type(),
		store,
		key,
		modifications: base.modifications().clone(),
		is_new: false,
		nullable,
	}))
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn test_new_record_inserts_whole_row() {
		let base = RecordBase::new(RecordType::Comment, true);
		let op = update_operation(&base, "Comments", Key::from("c1"), || Ok(json!({ "id": "c1" })), &[])
			.unwrap()
			.unwrap();
		assert!(matches!(op, Operation::UpdateRecord { is_new: true, .. }));
	}

	#[test]
	fn test_existing_record_patches_modifications_once() {
		let mut base = RecordBase::new(RecordType::Comment, false);
		let none = update_operation(&base, "Comments", Key::from("c1"), || Ok(json!({})), &[]).unwrap();
		assert!(none.is_none());

		base.set_property("state", json!("RESOLVED"));
		let op = update_operation(&base, "Comments", Key::from("c1"), || Ok(json!({})), &[])
			.unwrap()
			.unwrap();
		match op {
			Operation::UpdateRecord { is_new, modifications, .. } => {
				assert!(!is_new);
				assert_eq!(modifications.get("state"), Some(&json!("RESOLVED")));
			}
			_ => unreachable!(),
		}

		base.mark_committed();
		assert!(!base.is_new());
		assert!(!base.has_modifications());
	}
}

// vim: ts=4
