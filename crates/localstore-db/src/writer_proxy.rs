//! Writer proxy for documents that are not in local storage yet.
//!
//! While the proxy is staging, commands are buffered in a transient
//! [`CommandQueue`]. Once the pending queue has caught up with the model
//! (anachronism resolution), the proxy hands its buffer over to local
//! storage and never buffers again. Alternatively the document is discarded
//! and every later update is ignored. Each proxy takes exactly one of these
//! two paths.

use localstore::error_reporter::ErrorReporter;
use localstore::file_storage_adapter::SnapshotScheduler;
use localstore::prelude::*;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::watch;

use crate::adapter::V3StorageAdapter;
use crate::capability::Document;
use crate::command_queue::{CommandBatch, CommandQueue};
use crate::operation::Operation;
use crate::pending_queue::PendingQueue;
use crate::record::Record;

// DocumentAdapter //
//*****************//
/// Per-document-type hooks keeping the storage core agnostic of editor
/// command formats.
pub trait DocumentAdapter: Debug + Send + Sync {
	fn document_type(&self) -> DocumentType;

	fn create_document(&self, id: &str) -> Document {
		Document::new(id, self.document_type())
	}

	/// Converts an editor command into its stored form
	fn create_command_object(&self, command: Value) -> LsResult<Value> {
		Ok(command)
	}

	fn create_operations(&self, document: &mut Document) -> LsResult<Vec<Operation>> {
		document.create_operations()
	}
}

#[derive(Debug, Default)]
pub struct DocumentAdapterRegistry {
	adapters: HashMap<DocumentType, Arc<dyn DocumentAdapter>>,
}

impl DocumentAdapterRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn register(&mut self, adapter: Arc<dyn DocumentAdapter>) {
		self.adapters.insert(adapter.document_type(), adapter);
	}

	pub fn get(&self, document_type: DocumentType) -> LsResult<Arc<dyn DocumentAdapter>> {
		self.adapters
			.get(&document_type)
			.cloned()
			.ok_or_else(|| Error::MissingDocumentAdapter(document_type.to_string()))
	}
}

// Writer proxy //
//**************//
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProxyState {
	Staging,
	SwitchedToLocalStorage,
	Discarded,
}

/// Extra effects of a replacing `add_commands`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Replacement {
	pub last_modified_server: Timestamp,
	/// Ask for a client-side snapshot once the document is stored
	pub request_snapshot: bool,
}

#[derive(Debug)]
pub struct CommandBasedDocumentWriterProxy {
	doc_id: Box<str>,
	adapter: Arc<dyn DocumentAdapter>,
	reporter: Arc<dyn ErrorReporter>,
	snapshot_scheduler: Option<Arc<dyn SnapshotScheduler>>,
	state: ProxyState,
	queue: Option<CommandQueue>,
	initial_commands: Option<Vec<Value>>,
	last_modified_server: Option<Timestamp>,
	needs_snapshot: bool,
	commit_staged: bool,
	anachronism_resolved: watch::Sender<bool>,
}

impl CommandBasedDocumentWriterProxy {
	pub fn new(
		doc_id: &str,
		document_type: DocumentType,
		adapters: &DocumentAdapterRegistry,
		reporter: Arc<dyn ErrorReporter>,
	) -> LsResult<Self> {
		let adapter = adapters.get(document_type)?;
		let (anachronism_resolved, _) = watch::channel(false);
		Ok(Self {
			doc_id: doc_id.into(),
			adapter,
			reporter,
			snapshot_scheduler: None,
			state: ProxyState::Staging,
			queue: Some(CommandQueue::new(doc_id)),
			initial_commands: None,
			last_modified_server: None,
			needs_snapshot: false,
			commit_staged: false,
			anachronism_resolved,
		})
	}

	pub fn with_snapshot_scheduler(mut self, scheduler: Arc<dyn SnapshotScheduler>) -> Self {
		self.snapshot_scheduler = Some(scheduler);
		self
	}

	pub fn doc_id(&self) -> &str {
		&self.doc_id
	}

	pub fn state(&self) -> ProxyState {
		self.state
	}

	/// The transient buffer, while staging
	pub fn command_queue(&self) -> Option<&CommandQueue> {
		self.queue.as_ref()
	}

	pub fn needs_snapshot(&self) -> bool {
		self.needs_snapshot
	}

	/// Returns the live buffer, or None if updates are being ignored
	fn staging_queue(&mut self) -> LsResult<Option<&mut CommandQueue>> {
		match self.state {
			ProxyState::Staging => Ok(self.queue.as_mut()),
			ProxyState::Discarded => {
				self.reporter.assert(
					self.queue.is_none(),
					Error::InvalidState(format!("discarded proxy {} still holds a queue", self.doc_id)),
				);
				Ok(None)
			}
			ProxyState::SwitchedToLocalStorage => Err(Error::InvalidState(format!(
				"document {} is already in local storage",
				self.doc_id
			))),
		}
	}

	/// Buffers commands. With a `replacement` the buffer is replaced by
	/// these commands.
	pub fn add_commands(&mut self, commands: Vec<Value>, replacement: Option<Replacement>) -> LsResult<()> {
		let adapter = Arc::clone(&self.adapter);
		let Some(queue) = self.staging_queue()? else {
			return Ok(());
		};
		let commands = commands.into_iter().map(|c| adapter.create_command_object(c)).collect::<LsResult<Vec<_>>>()?;
		let batch = CommandBatch::new(0, commands);

		match replacement {
			None => queue.append(batch),
			Some(replacement) => {
				queue.replace(vec![batch])?;
				self.last_modified_server = Some(replacement.last_modified_server);
				if replacement.request_snapshot {
					self.needs_snapshot = true;
				}
				Ok(())
			}
		}
	}

	pub fn add_batch(&mut self, mut batch: CommandBatch) -> LsResult<()> {
		let adapter = Arc::clone(&self.adapter);
		let Some(queue) = self.staging_queue()? else {
			return Ok(());
		};
		batch.commands =
			batch.commands.into_iter().map(|c| adapter.create_command_object(c)).collect::<LsResult<Vec<_>>>()?;
		queue.append(batch)
	}

	/// Commands a new document record starts from
	pub fn set_initial_commands(&mut self, commands: Vec<Value>) -> LsResult<()> {
		if self.staging_queue()?.is_some() {
			self.initial_commands = Some(commands);
		}
		Ok(())
	}

	/// Promote the document's staged commands on the switch to local storage
	pub fn mark_staged_commands_for_commit(&mut self) {
		if self.state == ProxyState::Staging {
			self.commit_staged = true;
		}
	}

	/// Opens the gate in front of the switch to local storage. Returns false
	/// if it was already open.
	pub fn set_anachronism_resolved(&self) -> bool {
		self.anachronism_resolved.send_if_modified(|resolved| !std::mem::replace(resolved, true))
	}

	pub fn is_anachronism_resolved(&self) -> bool {
		*self.anachronism_resolved.borrow()
	}

	/// Waits until `set_anachronism_resolved` was called
	pub async fn wait_for_anachronism_resolution(&self) {
		let mut rx = self.anachronism_resolved.subscribe();
		// The sender lives in self, so the channel cannot close while waiting
		let _ = rx.wait_for(|resolved| *resolved).await;
	}

	/// Switches to local storage as soon as anachronisms are resolved
	pub async fn switch_to_local_storage(&mut self, storage: &V3StorageAdapter) -> LsResult<()> {
		self.wait_for_anachronism_resolution().await;
		self.switch_to_local_storage_internal(storage).await
	}

	/// Stores the document with its buffered commands and ends staging
	pub async fn switch_to_local_storage_internal(&mut self, storage: &V3StorageAdapter) -> LsResult<()> {
		match self.state {
			ProxyState::Staging => {}
			ProxyState::SwitchedToLocalStorage => return Ok(()),
			ProxyState::Discarded => {
				return Err(Error::InvalidState(format!("document {} was discarded", self.doc_id)));
			}
		}

		let (document, pending_queue) = self.read_stored(storage).await?;
		let mut document = document.unwrap_or_else(|| self.adapter.create_document(&self.doc_id));
		let mut pending_queue =
			pending_queue.unwrap_or_else(|| PendingQueue::new(&self.doc_id, self.adapter.document_type()));

		if document.base().is_new()
			&& let Some(commands) = self.initial_commands.clone()
		{
			document.set_initial_commands(Some(commands));
		}
		self.apply_document_state(&mut document);

		// Keep the buffer until the commit succeeded
		let mut moved = self.queue.clone().ok_or_else(|| {
			Error::InvalidState(format!("staging proxy {} has no command queue", self.doc_id))
		})?;
		moved.move_commands_to(&mut pending_queue)?;

		if self.commit_staged {
			document.commit_staged_commands();
			document.set_partial_model_data_only(false);
		}

		let mut ops = self.adapter.create_operations(&mut document)?;
		ops.extend(pending_queue.create_operations()?);
		storage.apply_operations(&ops).await?;
		document.on_committed();
		pending_queue.on_committed();

		moved.dispose();
		if let Some(mut queue) = self.queue.take() {
			queue.dispose();
		}
		self.initial_commands = None;
		self.commit_staged = false;
		self.state = ProxyState::SwitchedToLocalStorage;
		info!("Document {} switched to local storage", self.doc_id);

		if let Some(scheduler) = &self.snapshot_scheduler {
			scheduler.register_document(&self.doc_id);
		}
		Ok(())
	}

	/// Writes the document record ahead of the switch, without commands
	pub async fn flush_early_without_commands(&mut self, storage: &V3StorageAdapter) -> LsResult<()> {
		match self.state {
			ProxyState::Staging => {}
			ProxyState::Discarded => return Ok(()),
			ProxyState::SwitchedToLocalStorage => {
				return Err(Error::InvalidState(format!(
					"early flush of {} after the switch to local storage",
					self.doc_id
				)));
			}
		}

		let (document, _) = self.read_stored(storage).await?;
		let mut document = match document {
			Some(document) => document,
			None => {
				let mut document = self.adapter.create_document(&self.doc_id);
				document.set_partial_model_data_only(true);
				document
			}
		};
		self.apply_document_state(&mut document);

		let ops = self.adapter.create_operations(&mut document)?;
		storage.apply_operations(&ops).await?;
		document.on_committed();
		debug!("Flushed document {} early", self.doc_id);
		Ok(())
	}

	/// Drops everything buffered; later updates are ignored
	pub fn discard_and_ignore_all_updates(&mut self) -> LsResult<()> {
		if self.state == ProxyState::SwitchedToLocalStorage {
			return Err(Error::InvalidState(format!("document {} is already in local storage", self.doc_id)));
		}
		if let Some(mut queue) = self.queue.take() {
			queue.dispose();
		}
		self.initial_commands = None;
		self.commit_staged = false;
		self.state = ProxyState::Discarded;
		debug!("Discarded staged updates of {}", self.doc_id);
		Ok(())
	}

	fn apply_document_state(&self, document: &mut Document) {
		if let Some(ts) = self.last_modified_server {
			document.set_last_modified_server(ts);
		}
		if self.needs_snapshot {
			document.set_needs_snapshot(true);
		}
	}

	async fn read_stored(&self, storage: &V3StorageAdapter) -> LsResult<(Option<Document>, Option<PendingQueue>)> {
		use crate::capability::document::DOCUMENTS_STORE;
		use crate::capability::pending_queue::{PENDING_QUEUE_COMMANDS_STORE, PENDING_QUEUES_STORE};

		let mut tx =
			storage.read_transaction(&[DOCUMENTS_STORE, PENDING_QUEUES_STORE, PENDING_QUEUE_COMMANDS_STORE]).await?;
		let document = storage.document().read_document(&mut tx, &self.doc_id).await?;
		let pending_queue = storage.pending_queue().read_pending_queue(&mut tx, &self.doc_id).await?;
		tx.commit().await?;
		Ok((document, pending_queue))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use localstore::error_reporter::TracingErrorReporter;
	use serde_json::json;

	#[derive(Debug)]
	struct KixAdapter;

	impl DocumentAdapter for KixAdapter {
		fn document_type(&self) -> DocumentType {
			DocumentType::Kix
		}
	}

	fn create_test_proxy() -> CommandBasedDocumentWriterProxy {
		let mut adapters = DocumentAdapterRegistry::new();
		adapters.register(Arc::new(KixAdapter));
		CommandBasedDocumentWriterProxy::new("d1", DocumentType::Kix, &adapters, Arc::new(TracingErrorReporter))
			.unwrap()
	}

	#[test]
	fn test_missing_adapter() {
		let adapters = DocumentAdapterRegistry::new();
		let err = CommandBasedDocumentWriterProxy::new(
			"d1",
			DocumentType::Ritz,
			&adapters,
			Arc::new(TracingErrorReporter),
		)
		.unwrap_err();
		assert!(matches!(err, Error::MissingDocumentAdapter(t) if t == "ritz"));
	}

	#[test]
	fn test_replace_drops_buffer() {
		let mut proxy = create_test_proxy();
		proxy.add_commands(vec![json!("a")], None).unwrap();
		proxy
			.add_commands(
				vec![json!("b")],
				Some(Replacement { last_modified_server: Timestamp(10), request_snapshot: true }),
			)
			.unwrap();
		let queue = proxy.command_queue().unwrap();
		assert!(queue.is_replaced());
		assert_eq!(queue.command_count(), 1);
		assert!(proxy.needs_snapshot());
	}

	#[test]
	fn test_updates_after_discard_are_ignored() {
		let mut proxy = create_test_proxy();
		proxy.add_commands(vec![json!("a")], None).unwrap();
		proxy.discard_and_ignore_all_updates().unwrap();

		proxy.add_commands(vec![json!("b")], None).unwrap();
		proxy.add_batch(CommandBatch::new(1, vec![json!("c")])).unwrap();
		proxy.set_initial_commands(vec![json!("init")]).unwrap();
		assert_eq!(proxy.state(), ProxyState::Discarded);
		assert!(proxy.command_queue().is_none());
	}

	#[test]
	fn test_anachronism_gate_fires_once() {
		let proxy = create_test_proxy();
		assert!(!proxy.is_anachronism_resolved());
		assert!(proxy.set_anachronism_resolved());
		assert!(!proxy.set_anachronism_resolved());
		assert!(proxy.is_anachronism_resolved());
	}
}

// vim: ts=4
