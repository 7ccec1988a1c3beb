//! Documents, their command chunks, and staged commands.

use async_trait::async_trait;
use localstore::key;
use localstore::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{StorageCapability, apply_update, parse_row, unsupported};
use crate::operation::Operation;
use crate::reader_writer;
use crate::record::{self, Record, RecordBase, RecordType};
use crate::transaction::Transaction;

pub const DOCUMENTS_STORE: &str = "Documents";
pub const DOCUMENT_COMMANDS_STORE: &str = "DocumentCommands";
pub const DOCUMENT_COMMANDS_STAGING_STORE: &str = "DocumentCommandsStaging";

/// Document properties that may be written as null
pub const NULLABLE_PROPERTIES: &[&str] = &["lockSessionId", "lockExpiration", "initialCommands", "title"];

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentRow {
	pub id: Box<str>,
	pub document_type: DocumentType,
	#[serde(default)]
	pub title: Option<String>,
	#[serde(default)]
	pub last_modified_client: Option<Timestamp>,
	#[serde(default)]
	pub last_modified_server: Option<Timestamp>,
	#[serde(default)]
	pub lock_session_id: Option<Box<str>>,
	#[serde(default)]
	pub lock_expiration: Option<Timestamp>,
	#[serde(default)]
	pub initial_commands: Option<Vec<Value>>,
	/// Only part of the model was stored; the rest still has to be fetched
	#[serde(default)]
	pub partial_model_data_only: bool,
	#[serde(default)]
	pub needs_snapshot: bool,
}

/// One chunk of commands of a document part at one revision
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandChunk {
	pub doc_id: Box<str>,
	pub part_id: Box<str>,
	pub revision: i64,
	pub chunk_index: i64,
	pub commands: Vec<Value>,
}

impl CommandChunk {
	fn key(&self) -> Key {
		key![self.doc_id.as_ref(), self.part_id.as_ref(), self.revision, self.chunk_index]
	}
}

#[derive(Clone, Debug, PartialEq)]
struct PendingChunk {
	chunk: CommandChunk,
	staged: bool,
}

#[derive(Debug)]
pub struct Document {
	base: RecordBase,
	row: DocumentRow,
	chunks: Vec<PendingChunk>,
	commit_staged: bool,
	lock: Option<(Box<str>, Option<Timestamp>)>,
}

impl Document {
	pub fn new(id: &str, document_type: DocumentType) -> Self {
		Self {
			base: RecordBase::new(RecordType::Document, true),
			row: DocumentRow {
				id: id.into(),
				document_type,
				title: None,
				last_modified_client: None,
				last_modified_server: None,
				lock_session_id: None,
				lock_expiration: None,
				initial_commands: None,
				partial_model_data_only: false,
				needs_snapshot: false,
			},
			chunks: Vec::new(),
			commit_staged: false,
			lock: None,
		}
	}

	fn from_row(row: DocumentRow) -> Self {
		Self {
			base: RecordBase::new(RecordType::Document, false),
			row,
			chunks: Vec::new(),
			commit_staged: false,
			lock: None,
		}
	}

	pub fn id(&self) -> &str {
		&self.row.id
	}

	pub fn document_type(&self) -> DocumentType {
		self.row.document_type
	}

	pub fn row(&self) -> &DocumentRow {
		&self.row
	}

	pub fn title(&self) -> Option<&str> {
		self.row.title.as_deref()
	}

	pub fn initial_commands(&self) -> Option<&[Value]> {
		self.row.initial_commands.as_deref()
	}

	pub fn is_partial_model_data_only(&self) -> bool {
		self.row.partial_model_data_only
	}

	pub fn needs_snapshot(&self) -> bool {
		self.row.needs_snapshot
	}

	pub fn set_title(&mut self, title: Option<String>) {
		self.base.set_property("title", title.clone().map_or(Value::Null, Value::String));
		self.row.title = title;
	}

	pub fn set_last_modified_client(&mut self, ts: Timestamp) {
		self.row.last_modified_client = Some(ts);
		self.base.set_property("lastModifiedClient", ts.into());
	}

	pub fn set_last_modified_server(&mut self, ts: Timestamp) {
		self.row.last_modified_server = Some(ts);
		self.base.set_property("lastModifiedServer", ts.into());
	}

	pub fn set_initial_commands(&mut self, commands: Option<Vec<Value>>) {
		self.base.set_property("initialCommands", commands.clone().map_or(Value::Null, Value::Array));
		self.row.initial_commands = commands;
	}

	pub fn set_partial_model_data_only(&mut self, partial: bool) {
		self.row.partial_model_data_only = partial;
		self.base.set_property("partialModelDataOnly", Value::Bool(partial));
	}

	pub fn set_needs_snapshot(&mut self, needs_snapshot: bool) {
		self.row.needs_snapshot = needs_snapshot;
		self.base.set_property("needsSnapshot", Value::Bool(needs_snapshot));
	}

	/// Queues a chunk of commands for the live command store
	pub fn add_commands(&mut self, part_id: &str, revision: i64, chunk_index: i64, commands: Vec<Value>) {
		self.push_chunk(part_id, revision, chunk_index, commands, false);
	}

	/// Queues a chunk of commands for the staging area
	pub fn add_staged_commands(&mut self, part_id: &str, revision: i64, chunk_index: i64, commands: Vec<Value>) {
		self.push_chunk(part_id, revision, chunk_index, commands, true);
	}

	fn push_chunk(&mut self, part_id: &str, revision: i64, chunk_index: i64, commands: Vec<Value>, staged: bool) {
		let chunk = CommandChunk { doc_id: self.row.id.clone(), part_id: part_id.into(), revision, chunk_index, commands };
		self.chunks.push(PendingChunk { chunk, staged });
	}

	/// Promotes all staged commands with the next flush
	pub fn commit_staged_commands(&mut self) {
		self.commit_staged = true;
	}

	pub fn acquire_lock(&mut self, session_id: &str, expiration: Timestamp) {
		self.lock = Some((session_id.into(), Some(expiration)));
	}

	pub fn release_lock(&mut self, session_id: &str) {
		self.lock = Some((session_id.into(), None));
	}

	fn key(&self) -> Key {
		Key::from(self.row.id.as_ref())
	}
}

impl Record for Document {
	fn base(&self) -> &RecordBase {
		&self.base
	}

	fn base_mut(&mut self) -> &mut RecordBase {
		&mut self.base
	}

	fn create_operations(&mut self) -> LsResult<Vec<Operation>> {
		if self.base.is_to_be_deleted() {
			return Ok(vec![Operation::DeleteRecord {
				record_type: RecordType::Document,
				store: DOCUMENTS_STORE,
				key: self.key(),
			}]);
		}

		let mut ops = Vec::new();
		let row = &self.row;
		if let Some(op) = record::update_operation(
			&self.base,
			DOCUMENTS_STORE,
			self.key(),
			|| Ok(serde_json::to_value(row)?),
			NULLABLE_PROPERTIES,
		)? {
			ops.push(op);
		}
		for PendingChunk { chunk, staged } in &self.chunks {
			ops.push(Operation::AppendCommands {
				doc_id: chunk.doc_id.clone(),
				part_id: chunk.part_id.clone(),
				revision: chunk.revision,
				chunk_index: chunk.chunk_index,
				commands: chunk.commands.clone(),
				staged: *staged,
			});
		}
		if self.commit_staged {
			ops.push(Operation::CommitStagedCommands { doc_id: self.row.id.clone() });
		}
		if let Some((session_id, expiration)) = &self.lock {
			ops.push(Operation::DocumentLock {
				doc_id: self.row.id.clone(),
				session_id: session_id.clone(),
				expiration: *expiration,
			});
		}
		Ok(ops)
	}

	fn on_committed(&mut self) {
		self.chunks.clear();
		self.commit_staged = false;
		if let Some((session_id, expiration)) = self.lock.take() {
			if expiration.is_some() {
				self.row.lock_session_id = Some(session_id);
				self.row.lock_expiration = expiration;
			} else if self.row.lock_session_id.as_deref() == Some(session_id.as_ref()) {
				self.row.lock_session_id = None;
				self.row.lock_expiration = None;
			}
		}
		self.base.mark_committed();
	}
}

#[derive(Debug, Default)]
pub struct DocumentCapability;

impl DocumentCapability {
	pub async fn read_document(&self, tx: &mut Transaction, id: &str) -> LsResult<Option<Document>> {
		match tx.get(DOCUMENTS_STORE, &Key::from(id)).await? {
			Some(row) => Ok(Some(Document::from_row(parse_row(DOCUMENTS_STORE, row)?))),
			None => Ok(None),
		}
	}

	/// Command chunks of a document ordered by part, revision and chunk index
	pub async fn read_document_commands(&self, tx: &mut Transaction, id: &str) -> LsResult<Vec<CommandChunk>> {
		read_chunks(tx, DOCUMENT_COMMANDS_STORE, id).await
	}

	pub async fn read_staged_commands(&self, tx: &mut Transaction, id: &str) -> LsResult<Vec<CommandChunk>> {
		read_chunks(tx, DOCUMENT_COMMANDS_STAGING_STORE, id).await
	}

	pub async fn read_all_document_ids(&self, tx: &mut Transaction) -> LsResult<Vec<Box<str>>> {
		let entries = tx.get_all_entries(DOCUMENTS_STORE, &KeyRange::All, None).await?;
		Ok(entries.into_iter().filter_map(|(key, _)| key.as_str().map(Into::into)).collect())
	}

	async fn lock(
		&self,
		tx: &mut Transaction,
		doc_id: &str,
		session_id: &str,
		expiration: Option<Timestamp>,
	) -> LsResult<()> {
		let key = Key::from(doc_id);
		let Some(row) = tx.get(DOCUMENTS_STORE, &key).await? else {
			return Err(Error::NotFound(format!("document {} to lock", doc_id)));
		};
		let row: DocumentRow = parse_row(DOCUMENTS_STORE, row)?;
		let held_by_other = row.lock_session_id.as_deref().is_some_and(|holder| holder != session_id);

		let mut modifications = Map::new();
		match expiration {
			Some(expiration) => {
				if held_by_other && row.lock_expiration.is_some_and(|exp| exp > Timestamp::now()) {
					return Err(Error::ConstraintError(format!("document {} is locked by another session", doc_id)));
				}
				modifications.insert("lockSessionId".into(), Value::String(session_id.into()));
				modifications.insert("lockExpiration".into(), expiration.into());
			}
			None => {
				if row.lock_session_id.is_none() || held_by_other {
					debug!("Document {} not locked by session {}, nothing to release", doc_id, session_id);
					return Ok(());
				}
				modifications.insert("lockSessionId".into(), Value::Null);
				modifications.insert("lockExpiration".into(), Value::Null);
			}
		}
		reader_writer::save_modifications(tx, DOCUMENTS_STORE, &key, &modifications, NULLABLE_PROPERTIES).await
	}
}

async fn read_chunks(tx: &mut Transaction, store: &str, doc_id: &str) -> LsResult<Vec<CommandChunk>> {
	let rows = tx.get_all(store, &KeyRange::prefix(vec![Key::from(doc_id)]), None).await?;
	rows.into_iter().map(|row| parse_row(store, row)).collect()
}

#[async_trait]
impl StorageCapability for DocumentCapability {
	fn name(&self) -> &'static str {
		"DocumentCapability"
	}

	fn supported_record_types(&self) -> &'static [RecordType] {
		&[RecordType::Document]
	}

	fn object_store_names(&self) -> &'static [&'static str] {
		&[DOCUMENTS_STORE, DOCUMENT_COMMANDS_STORE, DOCUMENT_COMMANDS_STAGING_STORE]
	}

	async fn perform(&self, tx: &mut Transaction, op: &Operation) -> LsResult<()> {
		match op {
			Operation::UpdateRecord { store, key, modifications, is_new, nullable, .. } => {
				apply_update(tx, store, key, modifications, *is_new, nullable).await
			}
			Operation::DeleteRecord { key, .. } => {
				tx.delete(DOCUMENTS_STORE, key).await?;
				let commands = KeyRange::prefix(vec![key.clone()]);
				tx.delete_range(DOCUMENT_COMMANDS_STORE, &commands).await?;
				tx.delete_range(DOCUMENT_COMMANDS_STAGING_STORE, &commands).await?;
				Ok(())
			}
			Operation::AppendCommands { doc_id, part_id, revision, chunk_index, commands, staged } => {
				let chunk = CommandChunk {
					doc_id: doc_id.clone(),
					part_id: part_id.clone(),
					revision: *revision,
					chunk_index: *chunk_index,
					commands: commands.clone(),
				};
				let store = if *staged { DOCUMENT_COMMANDS_STAGING_STORE } else { DOCUMENT_COMMANDS_STORE };
				// Command chunks are append-only
				tx.add(store, &chunk.key(), &serde_json::to_value(&chunk)?).await
			}
			Operation::CommitStagedCommands { doc_id } => {
				let staged = KeyRange::prefix(vec![Key::from(doc_id.as_ref())]);
				let entries = tx.get_all_entries(DOCUMENT_COMMANDS_STAGING_STORE, &staged, None).await?;
				for (key, row) in &entries {
					tx.put(DOCUMENT_COMMANDS_STORE, key, row).await?;
				}
				tx.delete_range(DOCUMENT_COMMANDS_STAGING_STORE, &staged).await?;
				debug!("Committed {} staged command chunks of {}", entries.len(), doc_id);
				Ok(())
			}
			Operation::DocumentLock { doc_id, session_id, expiration } => {
				self.lock(tx, doc_id, session_id, *expiration).await
			}
			other => Err(unsupported(self.name(), other)),
		}
	}
}

// vim: ts=4
