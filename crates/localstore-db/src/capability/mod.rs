//! Storage capabilities.
//!
//! A capability owns a fixed set of object stores, creates them when the
//! schema is initialized, applies the operations of the record types it
//! declares, and rebuilds records from stored rows.

use async_trait::async_trait;
use localstore::prelude::*;
use serde_json::Value;
use std::fmt::Debug;

use crate::connection::UpgradeTransaction;
use crate::operation::Operation;
use crate::reader_writer;
use crate::record::RecordType;
use crate::transaction::Transaction;

pub mod docos;
pub mod document;
pub mod document_entity;
pub mod impression;
pub mod pending_queue;
pub mod sync_stats;

pub use docos::{Comment, CommentQuery, DocosCapability};
pub use document::{CommandChunk, Document, DocumentCapability};
pub use document_entity::{DocumentEntity, DocumentEntityCapability};
pub use impression::{Impression, ImpressionCapability};
pub use pending_queue::PendingQueueCapability;
pub use sync_stats::{SyncStats, SyncStatsCapability};

#[async_trait]
pub trait StorageCapability: Debug + Send + Sync {
	fn name(&self) -> &'static str;

	/// Record types whose operations this capability applies
	fn supported_record_types(&self) -> &'static [RecordType];

	/// Object stores owned by this capability
	fn object_store_names(&self) -> &'static [&'static str];

	fn is_operation_supported(&self, op: &Operation) -> bool {
		self.supported_record_types().contains(&op.record_type())
	}

	/// Creates the capability's object stores and indexes
	fn initialize(&self, upgrade: &mut UpgradeTransaction<'_>) -> LsResult<()> {
		for store in self.object_store_names() {
			upgrade.create_object_store(store)?;
		}
		Ok(())
	}

	/// Applies one operation inside `tx`
	async fn perform(&self, tx: &mut Transaction, op: &Operation) -> LsResult<()>;
}

pub(crate) fn unsupported(capability: &str, op: &Operation) -> Error {
	Error::UnsupportedOperation(format!("{} does not apply {}", capability, op.name()))
}

/// Inserts a new row or patches an existing one; never both
pub(crate) async fn apply_update(
	tx: &mut Transaction,
	store: &str,
	key: &Key,
	modifications: &serde_json::Map<String, Value>,
	is_new: bool,
	nullable: &[&str],
) -> LsResult<()> {
	if is_new {
		tx.put(store, key, &Value::Object(modifications.clone())).await
	} else {
		reader_writer::save_modifications(tx, store, key, modifications, nullable).await
	}
}

/// Deserializes a stored row, naming the store on failure
pub(crate) fn parse_row<T: serde::de::DeserializeOwned>(store: &str, row: Value) -> LsResult<T> {
	serde_json::from_value(row).map_err(|e| Error::Serialization(format!("malformed {} row: {}", store, e)))
}

// vim: ts=4
