//! DocsDatabase: the single owner of the documents database connection.

use localstore::error_reporter::ErrorReporter;
use localstore::prelude::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::connection::{Connection, DatabaseEvent, DatabaseFactory, UpgradeTransaction};
use crate::transaction::{Transaction, TransactionOptions};

#[derive(Debug)]
pub struct DocsDatabase {
	factory: Arc<DatabaseFactory>,
	name: Box<str>,
	connection: Option<Arc<Connection>>,
	reporter: Arc<dyn ErrorReporter>,
	/// Whether the editor is composing text; reported with request timeouts
	composing: Arc<AtomicBool>,
	default_timeout: Option<Duration>,
}

impl DocsDatabase {
	pub fn new(factory: Arc<DatabaseFactory>, name: &str, reporter: Arc<dyn ErrorReporter>) -> Self {
		Self {
			factory,
			name: name.into(),
			connection: None,
			reporter,
			composing: Arc::new(AtomicBool::new(false)),
			default_timeout: None,
		}
	}

	/// Timeout applied to transactions that don't set their own
	pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
		self.default_timeout = timeout;
		self
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn reporter(&self) -> &Arc<dyn ErrorReporter> {
		&self.reporter
	}

	/// Binds a connection. Fails if this database already manages one, or if
	/// another owner already manages `connection`.
	pub fn initialize(&mut self, connection: Arc<Connection>) -> LsResult<()> {
		if self.connection.is_some() {
			return Err(Error::AlreadyInitialized);
		}
		if !connection.claim() {
			return Err(Error::ConnectionAlreadyOwned);
		}
		debug!("Database {} initialized at version {}", self.name, connection.version());
		self.connection = Some(connection);
		Ok(())
	}

	/// Opens the database at its stored version and binds the connection
	pub async fn open(&mut self) -> LsResult<()> {
		if self.connection.is_some() {
			return Err(Error::AlreadyInitialized);
		}
		let connection = self.factory.open(&self.name).await?;
		self.initialize(connection)
	}

	pub fn is_initialized(&self) -> bool {
		self.connection.is_some()
	}

	pub fn connection(&self) -> Option<&Arc<Connection>> {
		self.connection.as_ref()
	}

	/// Schema version of the bound connection, 0 when not initialized
	pub fn version(&self) -> u64 {
		self.connection.as_ref().map_or(0, |c| c.version())
	}

	pub fn object_store_names(&self) -> Vec<String> {
		self.connection.as_ref().map(|c| c.object_store_names()).unwrap_or_default()
	}

	/// Upgrades the schema to `new_version`, running `upgrade` inside the
	/// upgrade transaction. Requires `new_version` to exceed the current one.
	///
	/// On failure the error is reported and the database is bound again at
	/// its previous version, if it can still be opened.
	pub async fn set_version<F>(&mut self, new_version: u64, upgrade: F) -> LsResult<()>
	where
		F: FnOnce(&mut UpgradeTransaction<'_>) -> LsResult<()>,
	{
		let current = self.version();
		if new_version <= current {
			return Err(Error::InvalidVersion { current, requested: new_version });
		}

		self.close();
		info!("Upgrading database {} from version {} to {}", self.name, current, new_version);

		match self.factory.upgrade(&self.name, new_version, upgrade).await {
			Ok(connection) => self.initialize(connection),
			Err(err) => {
				self.reporter.info(&err, "schema upgrade failed");
				match self.factory.open(&self.name).await {
					Ok(connection) => {
						if let Err(reopen_err) = self.initialize(connection) {
							self.reporter.log(&reopen_err);
						}
					}
					Err(reopen_err) => self.reporter.log(&reopen_err),
				}
				Err(err)
			}
		}
	}

	/// Opens a transaction over `store_names`
	///
	/// Write transactions wait for the previous write transaction on the
	/// same database to finish.
	pub async fn open_transaction(
		&self,
		store_names: &[&str],
		mut options: TransactionOptions,
	) -> LsResult<Transaction> {
		let Some(connection) = &self.connection else {
			return Err(Error::NotInitialized);
		};
		if options.timeout.is_none() {
			options.timeout = self.default_timeout;
		}
		Transaction::begin(Arc::clone(connection), store_names, options, &self.reporter, Arc::clone(&self.composing))
			.await
	}

	/// Receives out-of-band connection events (version change, close)
	pub fn subscribe(&self) -> LsResult<broadcast::Receiver<DatabaseEvent>> {
		self.connection.as_ref().map(|c| c.subscribe()).ok_or(Error::NotInitialized)
	}

	/// Calls `handler` for every out-of-band event of the current connection
	pub fn on_version_change<F>(&self, handler: F) -> LsResult<JoinHandle<()>>
	where
		F: Fn(DatabaseEvent) + Send + 'static,
	{
		let mut events = self.subscribe()?;
		let name = self.name.clone();
		Ok(tokio::spawn(async move {
			loop {
				match events.recv().await {
					Ok(event) => handler(event),
					Err(broadcast::error::RecvError::Lagged(n)) => {
						warn!("Database {} event listener lagged by {} events", name, n);
					}
					Err(broadcast::error::RecvError::Closed) => break,
				}
			}
		}))
	}

	/// Closes the connection. Closing twice is a no-op.
	pub fn close(&mut self) {
		if let Some(connection) = self.connection.take() {
			connection.release();
			connection.close();
		}
	}

	pub fn is_closed(&self) -> bool {
		self.connection.as_ref().is_none_or(|c| c.is_closed())
	}

	pub fn set_composing(&self, composing: bool) {
		self.composing.store(composing, Ordering::Release);
	}
}

impl Drop for DocsDatabase {
	fn drop(&mut self) {
		self.close();
	}
}

// vim: ts=4
