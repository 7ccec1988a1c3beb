//! Named databases and their connections.
//!
//! A `DatabaseFactory` hosts every database file of one storage directory and
//! keeps track of the connections it handed out. Upgrading a database to a
//! new schema version closes every other live connection to it and tells
//! their owners through a `DatabaseEvent::VersionChange`.

use localstore::prelude::*;
use redb::{ReadableDatabase, ReadableTable};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock, broadcast};

use crate::error::from_redb_error;
use crate::schema::{self, IndexSchema, Schema, StoreSchema, TABLE_META};

/// Out-of-band notifications about a connection
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DatabaseEvent {
	/// Another owner upgraded the schema. The connection is closed and every
	/// operation on it fails from now on.
	VersionChange { old_version: u64, new_version: u64 },
	/// The connection was closed for another reason (database deleted,
	/// factory shut down). The owning application has to reload.
	Closed,
}

/// One open database file. redb allows a single write transaction at a
/// time and blocks the thread on `begin_write`, so writers queue on the
/// async gate first.
#[derive(Clone, Debug)]
struct DbFile {
	db: Arc<redb::Database>,
	write_gate: Arc<Mutex<()>>,
}

/// A live connection to one database at one schema version
#[derive(Debug)]
pub struct Connection {
	name: Box<str>,
	pub(crate) db: Arc<redb::Database>,
	write_gate: Arc<Mutex<()>>,
	version: u64,
	schema: Schema,
	closed: AtomicBool,
	/// Set while a `DocsDatabase` manages this connection
	instrumented: AtomicBool,
	events: broadcast::Sender<DatabaseEvent>,
}

impl Connection {
	fn new(name: &str, file: DbFile, version: u64, schema: Schema) -> Self {
		let (events, _) = broadcast::channel(16);
		Self {
			name: name.into(),
			db: file.db,
			write_gate: file.write_gate,
			version,
			schema,
			closed: AtomicBool::new(false),
			instrumented: AtomicBool::new(false),
			events,
		}
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn version(&self) -> u64 {
		self.version
	}

	pub fn schema(&self) -> &Schema {
		&self.schema
	}

	pub fn object_store_names(&self) -> Vec<String> {
		self.schema.store_names()
	}

	pub fn is_closed(&self) -> bool {
		self.closed.load(Ordering::Acquire)
	}

	/// Closes the connection. Closing twice is a no-op.
	pub fn close(&self) {
		if !self.closed.swap(true, Ordering::AcqRel) {
			debug!("Closed connection to {} (version {})", self.name, self.version);
		}
	}

	pub fn subscribe(&self) -> broadcast::Receiver<DatabaseEvent> {
		self.events.subscribe()
	}

	/// Waits until no other write transaction is open on the database file
	pub(crate) async fn lock_writes(&self) -> OwnedMutexGuard<()> {
		Arc::clone(&self.write_gate).lock_owned().await
	}

	/// Claims the connection for one owner. Fails if already claimed.
	pub(crate) fn claim(&self) -> bool {
		self.instrumented
			.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
			.is_ok()
	}

	pub(crate) fn release(&self) {
		self.instrumented.store(false, Ordering::Release);
	}

	pub fn is_instrumented(&self) -> bool {
		self.instrumented.load(Ordering::Acquire)
	}

	/// Closes the connection and tells the owner why
	fn raise(&self, event: DatabaseEvent) {
		if self.closed.swap(true, Ordering::AcqRel) {
			return;
		}
		info!("Connection to {} closed out of band: {:?}", self.name, event);
		let _ = self.events.send(event);
	}
}

/// Schema changes allowed while upgrading a database
pub struct UpgradeTransaction<'a> {
	tx: &'a redb::WriteTransaction,
	schema: Schema,
	old_version: u64,
	new_version: u64,
}

impl UpgradeTransaction<'_> {
	pub fn old_version(&self) -> u64 {
		self.old_version
	}

	pub fn new_version(&self) -> u64 {
		self.new_version
	}

	/// Store names in sorted order
	pub fn object_store_names(&self) -> Vec<String> {
		self.schema.store_names()
	}

	pub fn create_object_store(&mut self, store: &str) -> LsResult<()> {
		if self.schema.has_store(store) {
			return Err(Error::ConstraintError(format!("object store {} already exists", store)));
		}
		let table_name = schema::store_table_name(store);
		self.tx.open_table(schema::store_table(&table_name)).map_err(from_redb_error)?;
		self.schema.stores.insert(store.into(), StoreSchema::default());
		debug!("Created object store {}", store);
		Ok(())
	}

	pub fn delete_object_store(&mut self, store: &str) -> LsResult<()> {
		let Some(store_schema) = self.schema.stores.remove(store) else {
			return Err(Error::NotFound(format!("object store {}", store)));
		};
		for index in store_schema.indexes.keys() {
			let index_name = schema::index_table_name(store, index);
			self.tx.delete_table(schema::index_table(&index_name)).map_err(from_redb_error)?;
		}
		let table_name = schema::store_table_name(store);
		self.tx.delete_table(schema::store_table(&table_name)).map_err(from_redb_error)?;
		debug!("Deleted object store {}", store);
		Ok(())
	}

	/// Creates an index over `key_path` and fills it from the existing rows.
	pub fn create_index(&mut self, store: &str, index: &str, key_path: &str) -> LsResult<()> {
		let Some(store_schema) = self.schema.stores.get_mut(store) else {
			return Err(Error::NotFound(format!("object store {}", store)));
		};
		if store_schema.indexes.contains_key(index) {
			return Err(Error::ConstraintError(format!("index {} already exists on {}", index, store)));
		}

		let table_name = schema::store_table_name(store);
		let index_name = schema::index_table_name(store, index);
		let rows = self.tx.open_table(schema::store_table(&table_name)).map_err(from_redb_error)?;
		let mut entries = self.tx.open_table(schema::index_table(&index_name)).map_err(from_redb_error)?;

		for item in rows.iter().map_err(from_redb_error)? {
			let (key, value) = item.map_err(from_redb_error)?;
			let row: serde_json::Value = serde_json::from_str(value.value())?;
			if let Some(index_key) = schema::index_key_for(&row, key_path) {
				let primary = Key::decode(key.value())?;
				let entry = schema::index_entry(&index_key, &primary);
				entries.insert(entry.as_slice(), key.value()).map_err(from_redb_error)?;
			}
		}

		store_schema.indexes.insert(index.into(), IndexSchema { key_path: key_path.into() });
		debug!("Created index {} on {}({})", index, store, key_path);
		Ok(())
	}
}

/// Hosts the databases of one storage directory
#[derive(Debug)]
pub struct DatabaseFactory {
	storage_dir: PathBuf,
	/// Cache of redb::Database by file path to avoid multiple handles per file
	file_databases: RwLock<HashMap<PathBuf, DbFile>>,
	connections: RwLock<HashMap<Box<str>, Vec<Weak<Connection>>>>,
}

impl DatabaseFactory {
	pub async fn new(storage_dir: impl AsRef<Path>) -> LsResult<Self> {
		let storage_dir = storage_dir.as_ref().to_path_buf();
		tokio::fs::create_dir_all(&storage_dir).await?;
		debug!("Initializing database factory at {:?}", storage_dir);

		Ok(Self {
			storage_dir,
			file_databases: RwLock::new(HashMap::new()),
			connections: RwLock::new(HashMap::new()),
		})
	}

	fn db_file_path(&self, name: &str) -> PathBuf {
		self.storage_dir.join(format!("{}.redb", name))
	}

	/// Get or open a redb Database instance by file path
	async fn get_or_open_db_file(&self, db_path: PathBuf) -> LsResult<DbFile> {
		{
			let cache = self.file_databases.read().await;
			if let Some(file) = cache.get(&db_path) {
				return Ok(file.clone());
			}
		}

		let mut cache = self.file_databases.write().await;
		if let Some(file) = cache.get(&db_path) {
			return Ok(file.clone());
		}

		let db = redb::Database::create(&db_path).map_err(from_redb_error)?;

		// Make sure the metadata table exists so read transactions can open it
		{
			let tx = db.begin_write().map_err(from_redb_error)?;
			tx.open_table(TABLE_META).map_err(from_redb_error)?;
			tx.commit().map_err(from_redb_error)?;
		}

		let file = DbFile { db: Arc::new(db), write_gate: Arc::new(Mutex::new(())) };
		cache.insert(db_path, file.clone());
		Ok(file)
	}

	async fn register(&self, connection: &Arc<Connection>) {
		let mut connections = self.connections.write().await;
		let live = connections.entry(connection.name.clone()).or_default();
		live.retain(|c| c.upgrade().is_some_and(|c| !c.is_closed()));
		live.push(Arc::downgrade(connection));
	}

	/// Closes every live connection to `name` with the given event
	async fn raise_all(&self, name: &str, event: &DatabaseEvent) {
		let mut connections = self.connections.write().await;
		if let Some(live) = connections.get_mut(name) {
			for conn in live.drain(..).filter_map(|c| c.upgrade()) {
				conn.raise(event.clone());
			}
		}
	}

	/// Opens a connection at the currently stored version (0 for a fresh database)
	pub async fn open(&self, name: &str) -> LsResult<Arc<Connection>> {
		let file = self.get_or_open_db_file(self.db_file_path(name)).await?;

		let (version, schema) = {
			let tx = file.db.begin_read().map_err(from_redb_error)?;
			let table = tx.open_table(TABLE_META).map_err(from_redb_error)?;
			schema::load_meta(&table)?
		};

		let connection = Arc::new(Connection::new(name, file, version, schema));
		self.register(&connection).await;
		debug!("Opened database {} at version {}", name, version);
		Ok(connection)
	}

	/// Upgrades `name` to `new_version`, running `upgrade` inside the upgrade
	/// transaction. Schema changes and the new version commit atomically.
	pub async fn upgrade<F>(&self, name: &str, new_version: u64, upgrade: F) -> LsResult<Arc<Connection>>
	where
		F: FnOnce(&mut UpgradeTransaction<'_>) -> LsResult<()>,
	{
		let file = self.get_or_open_db_file(self.db_file_path(name)).await?;

		let stored_version = {
			let tx = file.db.begin_read().map_err(from_redb_error)?;
			let table = tx.open_table(TABLE_META).map_err(from_redb_error)?;
			schema::load_meta(&table)?.0
		};
		if new_version <= stored_version {
			return Err(Error::InvalidVersion { current: stored_version, requested: new_version });
		}

		// Other owners must let go before the schema changes under them
		self.raise_all(
			name,
			&DatabaseEvent::VersionChange { old_version: stored_version, new_version },
		)
		.await;

		let _write_guard = Arc::clone(&file.write_gate).lock_owned().await;
		let tx = file.db.begin_write().map_err(from_redb_error)?;
		let (old_version, schema) = {
			let table = tx.open_table(TABLE_META).map_err(from_redb_error)?;
			schema::load_meta(&table)?
		};
		if new_version <= old_version {
			return Err(Error::InvalidVersion { current: old_version, requested: new_version });
		}

		let schema = {
			let mut up = UpgradeTransaction { tx: &tx, schema, old_version, new_version };
			upgrade(&mut up)?;
			up.schema
		};
		schema::store_meta(&tx, new_version, &schema)?;
		tx.commit().map_err(from_redb_error)?;

		info!("Upgraded database {} from version {} to {}", name, old_version, new_version);
		let connection = Arc::new(Connection::new(name, file.clone(), new_version, schema));
		self.register(&connection).await;
		Ok(connection)
	}

	/// Closes every connection to `name` and removes its file
	pub async fn delete_database(&self, name: &str) -> LsResult<()> {
		self.raise_all(name, &DatabaseEvent::Closed).await;

		let db_path = self.db_file_path(name);
		self.file_databases.write().await.remove(&db_path);
		match tokio::fs::remove_file(&db_path).await {
			Ok(()) => {}
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
			Err(e) => return Err(e.into()),
		}
		info!("Deleted database {}", name);
		Ok(())
	}
}

// vim: ts=4
