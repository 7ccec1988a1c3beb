//! Document impressions: immutable, timestamped usage events.

use async_trait::async_trait;
use localstore::key;
use localstore::prelude::*;
use serde::{Deserialize, Serialize};

use super::{StorageCapability, parse_row, unsupported};
use crate::operation::Operation;
use crate::record::{self, Record, RecordBase, RecordType};
use crate::transaction::Transaction;

pub const IMPRESSIONS_STORE: &str = "Impressions";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImpressionRow {
	doc_id: Box<str>,
	timestamp: Timestamp,
	impression_type: i64,
}

#[derive(Debug)]
pub struct Impression {
	base: RecordBase,
	row: ImpressionRow,
}

impl Impression {
	pub fn new(doc_id: &str, timestamp: Timestamp, impression_type: i64) -> Self {
		Self {
			base: RecordBase::new(RecordType::Impression, true),
			row: ImpressionRow { doc_id: doc_id.into(), timestamp, impression_type },
		}
	}

	pub fn doc_id(&self) -> &str {
		&self.row.doc_id
	}

	pub fn timestamp(&self) -> Timestamp {
		self.row.timestamp
	}

	pub fn impression_type(&self) -> i64 {
		self.row.impression_type
	}

	fn key(&self) -> Key {
		key![self.row.doc_id.as_ref(), self.row.timestamp.0, self.row.impression_type]
	}
}

impl Record for Impression {
	fn base(&self) -> &RecordBase {
		&self.base
	}

	fn base_mut(&mut self) -> &mut RecordBase {
		&mut self.base
	}

	fn create_operations(&mut self) -> LsResult<Vec<Operation>> {
		if self.base.is_to_be_deleted() {
			return Ok(vec![Operation::DeleteRecord {
				record_type: RecordType::Impression,
				store: IMPRESSIONS_STORE,
				key: self.key(),
			}]);
		}
		let row = &self.row;
		let op =
			record::update_operation(&self.base, IMPRESSIONS_STORE, self.key(), || Ok(serde_json::to_value(row)?), &[])?;
		Ok(op.into_iter().collect())
	}
}

#[derive(Debug, Default)]
pub struct ImpressionCapability;

impl ImpressionCapability {
	/// Impressions of a document, oldest first
	pub async fn read_impressions(&self, tx: &mut Transaction, doc_id: &str) -> LsResult<Vec<Impression>> {
		let rows = tx.get_all(IMPRESSIONS_STORE, &KeyRange::prefix(vec![Key::from(doc_id)]), None).await?;
		rows.into_iter()
			.map(|row| {
				Ok(Impression {
					base: RecordBase::new(RecordType::Impression, false),
					row: parse_row(IMPRESSIONS_STORE, row)?,
				})
			})
			.collect()
	}
}

#[async_trait]
impl StorageCapability for ImpressionCapability {
	fn name(&self) -> &'static str {
		"ImpressionCapability"
	}

	fn supported_record_types(&self) -> &'static [RecordType] {
		&[RecordType::Impression]
	}

	fn object_store_names(&self) -> &'static [&'static str] {
		&[IMPRESSIONS_STORE]
	}

	async fn perform(&self, tx: &mut Transaction, op: &Operation) -> LsResult<()> {
		match op {
			Operation::UpdateRecord { key, modifications, is_new: true, .. } => {
				tx.add(IMPRESSIONS_STORE, key, &serde_json::Value::Object(modifications.clone())).await
			}
			Operation::UpdateRecord { is_new: false, .. } => {
				Err(Error::UnsupportedOperation("impressions cannot be modified".into()))
			}
			Operation::DeleteRecord { key, .. } => {
				tx.delete(IMPRESSIONS_STORE, key).await?;
				Ok(())
			}
			Operation::DeleteImpressions { doc_id, up_to } => {
				// Keys are [docId, timestamp, type]; timestamps are whole milliseconds
				let range = match up_to.0.checked_add(1) {
					Some(next) => KeyRange::bound(key![doc_id.as_ref()], key![doc_id.as_ref(), next], false, true),
					None => KeyRange::prefix(vec![Key::from(doc_id.as_ref())]),
				};
				let removed = tx.delete_range(IMPRESSIONS_STORE, &range).await?;
				debug!("Removed {} impressions of {} up to {}", removed, doc_id, up_to);
				Ok(())
			}
			other => Err(unsupported(self.name(), other)),
		}
	}
}

// vim: ts=4
