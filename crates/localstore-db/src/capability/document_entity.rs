//! Opaque per-document entities keyed by type and id.

use async_trait::async_trait;
use localstore::key;
use localstore::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{StorageCapability, apply_update, parse_row, unsupported};
use crate::operation::Operation;
use crate::record::{self, Record, RecordBase, RecordType};
use crate::transaction::Transaction;

pub const DOCUMENT_ENTITIES_STORE: &str = "DocumentEntities";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DocumentEntityRow {
	document_id: Box<str>,
	entity_type: Box<str>,
	entity_id: Box<str>,
	#[serde(default)]
	data: Value,
}

#[derive(Debug)]
pub struct DocumentEntity {
	base: RecordBase,
	row: DocumentEntityRow,
}

impl DocumentEntity {
	pub fn new(document_id: &str, entity_type: &str, entity_id: &str, data: Value) -> Self {
		Self {
			base: RecordBase::new(RecordType::DocumentEntity, true),
			row: DocumentEntityRow {
				document_id: document_id.into(),
				entity_type: entity_type.into(),
				entity_id: entity_id.into(),
				data,
			},
		}
	}

	pub fn document_id(&self) -> &str {
		&self.row.document_id
	}

	pub fn entity_type(&self) -> &str {
		&self.row.entity_type
	}

	pub fn entity_id(&self) -> &str {
		&self.row.entity_id
	}

	pub fn data(&self) -> &Value {
		&self.row.data
	}

	pub fn set_data(&mut self, data: Value) {
		self.base.set_property("data", data.clone());
		self.row.data = data;
	}

	fn key(&self) -> Key {
		key![self.row.document_id.as_ref(), self.row.entity_type.as_ref(), self.row.entity_id.as_ref()]
	}
}

impl Record for DocumentEntity {
	fn base(&self) -> &RecordBase {
		&self.base
	}

	fn base_mut(&mut self) -> &mut RecordBase {
		&mut self.base
	}

	fn create_operations(&mut self) -> LsResult<Vec<Operation>> {
		if self.base.is_to_be_deleted() {
			return Ok(vec![Operation::DeleteRecord {
				record_type: RecordType::DocumentEntity,
				store: DOCUMENT_ENTITIES_STORE,
				key: self.key(),
			}]);
		}
		let row = &self.row;
		let op = record::update_operation(
			&self.base,
			DOCUMENT_ENTITIES_STORE,
			self.key(),
			|| Ok(serde_json::to_value(row)?),
			&[],
		)?;
		Ok(op.into_iter().collect())
	}
}

#[derive(Debug, Default)]
pub struct DocumentEntityCapability;

impl DocumentEntityCapability {
	pub async fn read_entity(
		&self,
		tx: &mut Transaction,
		document_id: &str,
		entity_type: &str,
		entity_id: &str,
	) -> LsResult<Option<DocumentEntity>> {
		let row = tx.get(DOCUMENT_ENTITIES_STORE, &key![document_id, entity_type, entity_id]).await?;
		row.map(from_row).transpose()
	}

	/// Entities of a document, optionally only those of one type
	pub async fn read_entities(
		&self,
		tx: &mut Transaction,
		document_id: &str,
		entity_type: Option<&str>,
	) -> LsResult<Vec<DocumentEntity>> {
		let mut prefix = vec![Key::from(document_id)];
		prefix.extend(entity_type.map(Key::from));
		let rows = tx.get_all(DOCUMENT_ENTITIES_STORE, &KeyRange::prefix(prefix), None).await?;
		rows.into_iter().map(from_row).collect()
	}
}

fn from_row(row: Value) -> LsResult<DocumentEntity> {
	Ok(DocumentEntity {
		base: RecordBase::new(RecordType::DocumentEntity, false),
		row: parse_row(DOCUMENT_ENTITIES_STORE, row)?,
	})
}

#[async_trait]
impl StorageCapability for DocumentEntityCapability {
	fn name(&self) -> &'static str {
		"DocumentEntityCapability"
	}

	fn supported_record_types(&self) -> &'static [RecordType] {
		&[RecordType::DocumentEntity]
	}

	fn object_store_names(&self) -> &'static [&'static str] {
		&[DOCUMENT_ENTITIES_STORE]
	}

	async fn perform(&self, tx: &mut Transaction, op: &Operation) -> LsResult<()> {
		match op {
			Operation::UpdateRecord { store, key, modifications, is_new, nullable, .. } => {
				apply_update(tx, store, key, modifications, *is_new, nullable).await
			}
			Operation::DeleteRecord { key, .. } => {
				tx.delete(DOCUMENT_ENTITIES_STORE, key).await?;
				Ok(())
			}
			other => Err(unsupported(self.name(), other)),
		}
	}
}

// vim: ts=4
