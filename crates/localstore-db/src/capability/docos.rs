//! Comments ("docos") with a secondary index on their state.
//!
//! Each row carries `stateIndex = [state, docId]` next to `state`. Any write
//! that changes the state rewrites the index field with it.

use async_trait::async_trait;
use localstore::key;
use localstore::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{StorageCapability, apply_update, parse_row, unsupported};
use crate::connection::UpgradeTransaction;
use crate::operation::Operation;
use crate::record::{self, Record, RecordBase, RecordType};
use crate::transaction::Transaction;

pub const COMMENTS_STORE: &str = "Comments";
pub const STATE_INDEX: &str = "StateIndex";
const STATE_INDEX_KEY_PATH: &str = "stateIndex";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommentRow {
	doc_id: Box<str>,
	id: Box<str>,
	state: Box<str>,
	#[serde(default)]
	data: Value,
	state_index: (Box<str>, Box<str>),
}

/// Query shapes for reading comments. Filtering by state and by comment id
/// at once is not supported.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommentQuery {
	ById { doc_id: Box<str>, id: Box<str> },
	ByDocument { doc_id: Box<str> },
	ByState { state: Box<str>, doc_id: Option<Box<str>> },
}

#[derive(Debug)]
pub struct Comment {
	base: RecordBase,
	doc_id: Box<str>,
	id: Box<str>,
	state: Box<str>,
	data: Value,
}

impl Comment {
	pub fn new(doc_id: &str, id: &str, state: &str, data: Value) -> Self {
		Self {
			base: RecordBase::new(RecordType::Comment, true),
			doc_id: doc_id.into(),
			id: id.into(),
			state: state.into(),
			data,
		}
	}

	fn from_row(row: CommentRow) -> Self {
		Self {
			base: RecordBase::new(RecordType::Comment, false),
			doc_id: row.doc_id,
			id: row.id,
			state: row.state,
			data: row.data,
		}
	}

	pub fn doc_id(&self) -> &str {
		&self.doc_id
	}

	pub fn id(&self) -> &str {
		&self.id
	}

	pub fn state(&self) -> &str {
		&self.state
	}

	pub fn data(&self) -> &Value {
		&self.data
	}

	pub fn set_state(&mut self, state: &str) {
		self.state = state.into();
		self.base.set_property("state", Value::String(state.into()));
	}

	pub fn set_data(&mut self, data: Value) {
		self.base.set_property("data", data.clone());
		self.data = data;
	}

	fn key(&self) -> Key {
		key![self.doc_id.as_ref(), self.id.as_ref()]
	}

	fn to_row(&self) -> CommentRow {
		CommentRow {
			doc_id: self.doc_id.clone(),
			id: self.id.clone(),
			state: self.state.clone(),
			data: self.data.clone(),
			state_index: (self.state.clone(), self.doc_id.clone()),
		}
	}
}

impl Record for Comment {
	fn base(&self) -> &RecordBase {
		&self.base
	}

	fn base_mut(&mut self) -> &mut RecordBase {
		&mut self.base
	}

	fn create_operations(&mut self) -> LsResult<Vec<Operation>> {
		if self.base.is_to_be_deleted() {
			return Ok(vec![Operation::DeleteRecord {
				record_type: RecordType::Comment,
				store: COMMENTS_STORE,
				key: self.key(),
			}]);
		}
		let op = record::update_operation(
			&self.base,
			COMMENTS_STORE,
			self.key(),
			|| Ok(serde_json::to_value(self.to_row())?),
			&[],
		)?;
		Ok(op.into_iter().collect())
	}
}

/// Substitutes the index tuple for a plain state change
fn with_state_index(key: &Key, modifications: &Map<String, Value>) -> LsResult<Map<String, Value>> {
	let mut modifications = modifications.clone();
	if let Some(state) = modifications.get("state").cloned() {
		let doc_id = key
			.as_array()
			.and_then(|parts| parts.first())
			.and_then(Key::as_str)
			.ok_or_else(|| Error::InvalidKey(format!("not a comment key: {}", key.to_value())))?;
		modifications.insert(STATE_INDEX_KEY_PATH.into(), Value::Array(vec![state, Value::String(doc_id.into())]));
	}
	Ok(modifications)
}

#[derive(Debug, Default)]
pub struct DocosCapability;

impl DocosCapability {
	pub async fn read_comments(&self, tx: &mut Transaction, query: &CommentQuery) -> LsResult<Vec<Comment>> {
		let rows = match query {
			CommentQuery::ById { doc_id, id } => {
				tx.get(COMMENTS_STORE, &key![doc_id.as_ref(), id.as_ref()]).await?.into_iter().collect()
			}
			CommentQuery::ByDocument { doc_id } => {
				tx.get_all(COMMENTS_STORE, &KeyRange::prefix(vec![Key::from(doc_id.as_ref())]), None).await?
			}
			CommentQuery::ByState { state, doc_id } => {
				let range = match doc_id {
					Some(doc_id) => KeyRange::only(key![state.as_ref(), doc_id.as_ref()]),
					None => KeyRange::prefix(vec![Key::from(state.as_ref())]),
				};
				tx.get_all_by_index(COMMENTS_STORE, STATE_INDEX, &range).await?
			}
		};
		rows.into_iter().map(|row| Ok(Comment::from_row(parse_row(COMMENTS_STORE, row)?))).collect()
	}
}

#[async_trait]
impl StorageCapability for DocosCapability {
	fn name(&self) -> &'static str {
		"DocosCapability"
	}

	fn supported_record_types(&self) -> &'static [RecordType] {
		&[RecordType::Comment]
	}

	fn object_store_names(&self) -> &'static [&'static str] {
		&[COMMENTS_STORE]
	}

	fn initialize(&self, upgrade: &mut UpgradeTransaction<'_>) -> LsResult<()> {
		upgrade.create_object_store(COMMENTS_STORE)?;
		upgrade.create_index(COMMENTS_STORE, STATE_INDEX, STATE_INDEX_KEY_PATH)
	}

	async fn perform(&self, tx: &mut Transaction, op: &Operation) -> LsResult<()> {
		match op {
			Operation::UpdateRecord { store, key, modifications, is_new, nullable, .. } => {
				if *is_new {
					apply_update(tx, store, key, modifications, true, nullable).await
				} else {
					let modifications = with_state_index(key, modifications)?;
					apply_update(tx, store, key, &modifications, false, nullable).await
				}
			}
			Operation::DeleteRecord { key, .. } => {
				tx.delete(COMMENTS_STORE, key).await?;
				Ok(())
			}
			other => Err(unsupported(self.name(), other)),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn test_state_change_rewrites_index() {
		let mut mods = Map::new();
		mods.insert("state".into(), json!("RESOLVED"));
		let mods = with_state_index(&key!["d1", "c1"], &mods).unwrap();
		assert_eq!(mods.get("stateIndex"), Some(&json!(["RESOLVED", "d1"])));

		let mut mods = Map::new();
		mods.insert("data".into(), json!({ "text": "hi" }));
		assert!(with_state_index(&key!["d1", "c1"], &mods).unwrap().get("stateIndex").is_none());
	}

	#[test]
	fn test_new_comment_row_carries_index() {
		let mut comment = Comment::new("d1", "c1", "OPEN", json!({ "text": "hi" }));
		let ops = comment.create_operations().unwrap();
		match &ops[0] {
			Operation::UpdateRecord { modifications, is_new: true, .. } => {
				assert_eq!(modifications.get("stateIndex"), Some(&json!(["OPEN", "d1"])));
			}
			_ => unreachable!(),
		}
	}
}

// vim: ts=4
