//! Profile-wide sync bookkeeping, stored as a singleton row in `ProfileData`.

use async_trait::async_trait;
use localstore::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use super::{StorageCapability, apply_update, parse_row, unsupported};
use crate::operation::Operation;
use crate::reader_writer::PROFILE_DATA_STORE;
use crate::record::{self, Record, RecordBase, RecordType};
use crate::transaction::Transaction;

pub const SYNC_STATS_DATA_TYPE: &str = "syncStats";

const NULLABLE_PROPERTIES: &[&str] = &["lastSyncTimestamp", "lastSuccessfulSyncTimestamp", "quotaBytes"];

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct SyncStatsRow {
	data_type: Box<str>,
	failure_counts: BTreeMap<String, u32>,
	last_sync_timestamp: Option<Timestamp>,
	last_successful_sync_timestamp: Option<Timestamp>,
	relevant_document_ids: Vec<String>,
	quota_bytes: Option<u64>,
}

#[derive(Debug)]
pub struct SyncStats {
	base: RecordBase,
	row: SyncStatsRow,
}

impl Default for SyncStats {
	fn default() -> Self {
		Self::new()
	}
}

impl SyncStats {
	pub fn new() -> Self {
		Self {
			base: RecordBase::new(RecordType::SyncStats, true),
			row: SyncStatsRow { data_type: SYNC_STATS_DATA_TYPE.into(), ..SyncStatsRow::default() },
		}
	}

	pub fn failure_count(&self, doc_id: &str) -> u32 {
		self.row.failure_counts.get(doc_id).copied().unwrap_or(0)
	}

	pub fn last_sync_timestamp(&self) -> Option<Timestamp> {
		self.row.last_sync_timestamp
	}

	pub fn last_successful_sync_timestamp(&self) -> Option<Timestamp> {
		self.row.last_successful_sync_timestamp
	}

	pub fn relevant_document_ids(&self) -> &[String] {
		&self.row.relevant_document_ids
	}

	pub fn quota_bytes(&self) -> Option<u64> {
		self.row.quota_bytes
	}

	fn failure_counts_changed(&mut self) {
		let counts = self.row.failure_counts.iter().map(|(k, v)| (k.clone(), Value::from(*v))).collect();
		self.base.set_property("failureCounts", Value::Object(counts));
	}

	pub fn increment_failure_count(&mut self, doc_id: &str) -> u32 {
		let count = self.row.failure_counts.entry(doc_id.into()).or_insert(0);
		*count += 1;
		let count = *count;
		self.failure_counts_changed();
		count
	}

	pub fn reset_failure_count(&mut self, doc_id: &str) {
		if self.row.failure_counts.remove(doc_id).is_some() {
			self.failure_counts_changed();
		}
	}

	pub fn set_last_sync_timestamp(&mut self, ts: Option<Timestamp>) {
		self.row.last_sync_timestamp = ts;
		self.base.set_property("lastSyncTimestamp", ts.map_or(Value::Null, Value::from));
	}

	pub fn set_last_successful_sync_timestamp(&mut self, ts: Option<Timestamp>) {
		self.row.last_successful_sync_timestamp = ts;
		self.base.set_property("lastSuccessfulSyncTimestamp", ts.map_or(Value::Null, Value::from));
	}

	pub fn set_relevant_document_ids(&mut self, ids: Vec<String>) {
		self.base.set_property("relevantDocumentIds", Value::from(ids.clone()));
		self.row.relevant_document_ids = ids;
	}

	pub fn set_quota_bytes(&mut self, quota: Option<u64>) {
		self.row.quota_bytes = quota;
		self.base.set_property("quotaBytes", quota.map_or(Value::Null, Value::from));
	}
}

impl Record for SyncStats {
	fn base(&self) -> &RecordBase {
		&self.base
	}

	fn base_mut(&mut self) -> &mut RecordBase {
		&mut self.base
	}

	fn create_operations(&mut self) -> LsResult<Vec<Operation>> {
		let key = Key::from(SYNC_STATS_DATA_TYPE);
		if self.base.is_to_be_deleted() {
			return Ok(vec![Operation::DeleteRecord { record_type: RecordType::SyncStats, store: PROFILE_DATA_STORE, key }]);
		}
		let row = &self.row;
		let op = record::update_operation(
			&self.base,
			PROFILE_DATA_STORE,
			key,
			|| Ok(serde_json::to_value(row)?),
			NULLABLE_PROPERTIES,
		)?;
		Ok(op.into_iter().collect())
	}
}

#[derive(Debug, Default)]
pub struct SyncStatsCapability;

impl SyncStatsCapability {
	/// Reads the stored stats, or a new empty record if none were stored yet
	pub async fn read_sync_stats(&self, tx: &mut Transaction) -> LsResult<SyncStats> {
		match tx.get(PROFILE_DATA_STORE, &Key::from(SYNC_STATS_DATA_TYPE)).await? {
			Some(row) => Ok(SyncStats {
				base: RecordBase::new(RecordType::SyncStats, false),
				row: parse_row(PROFILE_DATA_STORE, row)?,
			}),
			None => Ok(SyncStats::new()),
		}
	}
}

#[async_trait]
impl StorageCapability for SyncStatsCapability {
	fn name(&self) -> &'static str {
		"SyncStatsCapability"
	}

	fn supported_record_types(&self) -> &'static [RecordType] {
		&[RecordType::SyncStats]
	}

	fn object_store_names(&self) -> &'static [&'static str] {
		&[PROFILE_DATA_STORE]
	}

	async fn perform(&self, tx: &mut Transaction, op: &Operation) -> LsResult<()> {
		match op {
			Operation::UpdateRecord { store, key, modifications, is_new, nullable, .. } => {
				apply_update(tx, store, key, modifications, *is_new, nullable).await
			}
			Operation::DeleteRecord { key, .. } => {
				tx.delete(PROFILE_DATA_STORE, key).await?;
				Ok(())
			}
			other => Err(unsupported(self.name(), other)),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_failure_counts_are_tracked_as_one_property() {
		let mut stats = SyncStats::new();
		stats.base_mut().mark_committed();
		assert_eq!(stats.increment_failure_count("d1"), 1);
		assert_eq!(stats.increment_failure_count("d1"), 2);
		stats.reset_failure_count("d2");
		let ops = stats.create_operations().unwrap();
		match &ops[0] {
			Operation::UpdateRecord { modifications, is_new: false, .. } => {
				assert_eq!(modifications.len(), 1);
				assert_eq!(modifications["failureCounts"]["d1"], 2);
			}
			_ => unreachable!(),
		}
	}
}

// vim: ts=4
