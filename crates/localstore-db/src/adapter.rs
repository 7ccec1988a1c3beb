//! The version 3 storage adapter.
//!
//! Opens the documents database, brings fresh or outdated databases to
//! schema version 3, and routes record operations to the capability that
//! owns their record type. All operations of one write go through a single
//! transaction spanning every object store.

use localstore::error_reporter::ErrorReporter;
use localstore::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;

use crate::capability::{
	DocosCapability, DocumentCapability, DocumentEntityCapability, ImpressionCapability, PendingQueueCapability,
	StorageCapability, SyncStatsCapability,
};
use crate::config::StoreConfig;
use crate::connection::{DatabaseFactory, UpgradeTransaction};
use crate::database::DocsDatabase;
use crate::operation::Operation;
use crate::record::{Record, RecordType};
use crate::transaction::{Transaction, TransactionOptions};

pub const SCHEMA_VERSION: u64 = 3;

/// Every object store of the version 3 schema, sorted
pub const OBJECT_STORE_NAMES: &[&str] = &[
	"Comments",
	"DocumentCommands",
	"DocumentCommandsStaging",
	"DocumentEntities",
	"Documents",
	"Impressions",
	"PendingQueueCommands",
	"PendingQueues",
	"ProfileData",
];

// CapabilityRegistry //
//********************//
/// Maps each record type to the one capability applying its operations
#[derive(Debug, Default)]
pub struct CapabilityRegistry {
	capabilities: Vec<Arc<dyn StorageCapability>>,
	routes: HashMap<RecordType, usize>,
}

impl CapabilityRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Registers a capability. Fails without registering anything if one of
	/// its record types is already claimed.
	pub fn register(&mut self, capability: Arc<dyn StorageCapability>) -> LsResult<()> {
		for record_type in capability.supported_record_types() {
			if let Some(idx) = self.routes.get(record_type) {
				return Err(Error::ConstraintError(format!(
					"record type {} is claimed by both {} and {}",
					record_type,
					self.capabilities[*idx].name(),
					capability.name()
				)));
			}
		}

		let idx = self.capabilities.len();
		for record_type in capability.supported_record_types() {
			self.routes.insert(*record_type, idx);
		}
		debug!("Registered capability {}", capability.name());
		self.capabilities.push(capability);
		Ok(())
	}

	pub fn capabilities(&self) -> &[Arc<dyn StorageCapability>] {
		&self.capabilities
	}

	pub fn capability_for(&self, op: &Operation) -> LsResult<&Arc<dyn StorageCapability>> {
		self.routes
			.get(&op.record_type())
			.and_then(|idx| self.capabilities.get(*idx))
			.filter(|capability| capability.is_operation_supported(op))
			.ok_or_else(|| Error::MissingCapability(format!("{} ({})", op.name(), op.record_type())))
	}
}

// V3StorageAdapter //
//******************//
#[derive(Debug)]
pub struct V3StorageAdapter {
	database: DocsDatabase,
	registry: CapabilityRegistry,
	document: Arc<DocumentCapability>,
	docos: Arc<DocosCapability>,
	pending_queue: Arc<PendingQueueCapability>,
	document_entity: Arc<DocumentEntityCapability>,
	sync_stats: Arc<SyncStatsCapability>,
	impression: Arc<ImpressionCapability>,
}

impl V3StorageAdapter {
	/// Opens the storage directory named by `config`, creating it if allowed
	pub async fn open_with_config(config: &StoreConfig, reporter: Arc<dyn ErrorReporter>) -> LsResult<Self> {
		if !config.create_dir && !tokio::fs::try_exists(&config.storage_dir).await? {
			return Err(Error::NotFound(format!("storage directory {:?}", config.storage_dir)));
		}
		let factory = Arc::new(DatabaseFactory::new(&config.storage_dir).await?);
		Self::open(factory, config, reporter).await
	}

	/// Opens the documents database, upgrading it to version 3 if needed
	pub async fn open(
		factory: Arc<DatabaseFactory>,
		config: &StoreConfig,
		reporter: Arc<dyn ErrorReporter>,
	) -> LsResult<Self> {
		let document = Arc::new(DocumentCapability);
		let docos = Arc::new(DocosCapability);
		let pending_queue = Arc::new(PendingQueueCapability);
		let document_entity = Arc::new(DocumentEntityCapability);
		let sync_stats = Arc::new(SyncStatsCapability);
		let impression = Arc::new(ImpressionCapability);

		let mut registry = CapabilityRegistry::new();
		registry.register(document.clone())?;
		registry.register(docos.clone())?;
		registry.register(pending_queue.clone())?;
		registry.register(document_entity.clone())?;
		registry.register(sync_stats.clone())?;
		registry.register(impression.clone())?;

		let mut database = DocsDatabase::new(factory, &config.database_name, reporter)
			.with_default_timeout(config.request_timeout());
		database.open().await?;

		let version = database.version();
		if version > SCHEMA_VERSION {
			database.close();
			return Err(Error::InvalidVersion { current: version, requested: SCHEMA_VERSION });
		}
		if version < SCHEMA_VERSION {
			let capabilities = registry.capabilities();
			database.set_version(SCHEMA_VERSION, |upgrade| do_initialize(upgrade, capabilities)).await?;
		}
		info!("Opened {} at schema version {}", config.database_name, database.version());

		Ok(Self { database, registry, document, docos, pending_queue, document_entity, sync_stats, impression })
	}

	/// Data written by older schemas is not migrated
	pub fn can_upgrade(&self) -> bool {
		false
	}

	pub fn database(&self) -> &DocsDatabase {
		&self.database
	}

	pub fn database_mut(&mut self) -> &mut DocsDatabase {
		&mut self.database
	}

	pub fn registry(&self) -> &CapabilityRegistry {
		&self.registry
	}

	pub fn document(&self) -> &DocumentCapability {
		&self.document
	}

	pub fn docos(&self) -> &DocosCapability {
		&self.docos
	}

	pub fn pending_queue(&self) -> &PendingQueueCapability {
		&self.pending_queue
	}

	pub fn document_entity(&self) -> &DocumentEntityCapability {
		&self.document_entity
	}

	pub fn sync_stats(&self) -> &SyncStatsCapability {
		&self.sync_stats
	}

	pub fn impression(&self) -> &ImpressionCapability {
		&self.impression
	}

	/// Read-only transaction over `store_names`
	pub async fn read_transaction(&self, store_names: &[&str]) -> LsResult<Transaction> {
		self.database.open_transaction(store_names, TransactionOptions::new("Error reading records")).await
	}

	/// Persists the pending changes of `records` in one transaction. Records
	/// learn about the commit only once all of them are durable.
	pub async fn write_records(&self, records: &mut [&mut dyn Record]) -> LsResult<()> {
		let mut ops = Vec::new();
		for record in records.iter_mut() {
			ops.extend(record.create_operations()?);
		}
		self.apply_operations(&ops).await?;
		for record in records.iter_mut() {
			record.on_committed();
		}
		Ok(())
	}

	/// Applies `ops` in order within one write transaction
	pub async fn apply_operations(&self, ops: &[Operation]) -> LsResult<()> {
		if ops.is_empty() {
			return Ok(());
		}
		let routed = ops
			.iter()
			.map(|op| Ok((self.registry.capability_for(op)?, op)))
			.collect::<LsResult<Vec<_>>>()?;

		let mut tx = self
			.database
			.open_transaction(OBJECT_STORE_NAMES, TransactionOptions::new("Error writing records").writable())
			.await?;
		for (capability, op) in routed {
			trace!("{} applies {}", capability.name(), op.name());
			// Dropping the transaction rolls back what was applied so far
			capability.perform(&mut tx, op).await?;
		}
		tx.commit().await?;
		debug!("Committed {} operations", ops.len());
		Ok(())
	}

	pub fn close(&mut self) {
		self.database.close();
	}
}

/// Lays out the version 3 schema. Stores of earlier versions are dropped.
fn do_initialize(upgrade: &mut UpgradeTransaction<'_>, capabilities: &[Arc<dyn StorageCapability>]) -> LsResult<()> {
	for store in upgrade.object_store_names() {
		upgrade.delete_object_store(&store)?;
	}
	for capability in capabilities {
		capability.initialize(upgrade)?;
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[derive(Debug)]
	struct DuplicateDocumentCapability;

	#[async_trait::async_trait]
	impl StorageCapability for DuplicateDocumentCapability {
		fn name(&self) -> &'static str {
			"DuplicateDocumentCapability"
		}

		fn supported_record_types(&self) -> &'static [RecordType] {
			&[RecordType::Impression, RecordType::Document]
		}

		fn object_store_names(&self) -> &'static [&'static str] {
			&[]
		}

		async fn perform(&self, _tx: &mut Transaction, _op: &Operation) -> LsResult<()> {
			Ok(())
		}
	}

	#[test]
	fn test_registry_rejects_duplicate_record_types() {
		let mut registry = CapabilityRegistry::new();
		registry.register(Arc::new(DocumentCapability)).unwrap();
		let err = registry.register(Arc::new(DuplicateDocumentCapability)).unwrap_err();
		assert!(matches!(err, Error::ConstraintError(_)));

		// Nothing of the rejected capability was registered
		let op = Operation::DeleteImpressions { doc_id: "d1".into(), up_to: Timestamp(1) };
		assert!(matches!(registry.capability_for(&op), Err(Error::MissingCapability(_))));
	}

	#[test]
	fn test_store_names_are_sorted() {
		let mut sorted = OBJECT_STORE_NAMES.to_vec();
		sorted.sort_unstable();
		assert_eq!(sorted, OBJECT_STORE_NAMES);
	}
}

// vim: ts=4
