//! Logical transactions over the object stores of one connection.
//!
//! A `Transaction` wraps one redb read or write transaction. Every operation
//! runs as a [`Request`] sharing the transaction's abort token, so aborting
//! (explicitly, through `abandon`, or because a request timed out) suppresses
//! callback delivery for everything still in flight. Dropping a write
//! transaction without committing rolls it back.

use localstore::error_reporter::ErrorReporter;
use localstore::key::ByteBounds;
use localstore::prelude::*;
use redb::ReadableTable;
use serde_json::Value;
use std::ops::Bound;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::{Duration, Instant};
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;

use crate::connection::Connection;
use crate::db_util::{self, Cursor, CursorDirection};
use crate::error::from_redb_error;
use crate::request::Request;
use crate::schema::{self, Schema};

pub type ErrorCallback = Arc<dyn Fn(&Error) + Send + Sync>;
pub type TimeoutCallback = Arc<dyn Fn() + Send + Sync>;

/// Options for [`crate::database::DocsDatabase::open_transaction`]
#[derive(Clone, Default)]
pub struct TransactionOptions {
	pub(crate) error_message: Box<str>,
	pub(crate) allow_write: bool,
	pub(crate) timeout: Option<Duration>,
	pub(crate) on_error: Option<ErrorCallback>,
	pub(crate) on_timeout: Option<TimeoutCallback>,
	pub(crate) latency_label: Option<&'static str>,
}

impl TransactionOptions {
	/// `error_message` prefixes every error reported by the transaction
	pub fn new(error_message: impl Into<Box<str>>) -> Self {
		Self { error_message: error_message.into(), ..Self::default() }
	}

	pub fn writable(mut self) -> Self {
		self.allow_write = true;
		self
	}

	pub fn timeout(mut self, timeout: Duration) -> Self {
		self.timeout = Some(timeout);
		self
	}

	pub fn on_error(mut self, f: impl Fn(&Error) + Send + Sync + 'static) -> Self {
		self.on_error = Some(Arc::new(f));
		self
	}

	pub fn on_timeout(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
		self.on_timeout = Some(Arc::new(f));
		self
	}

	/// Emit latency events for this transaction's requests under `label`
	pub fn latency_label(mut self, label: &'static str) -> Self {
		self.latency_label = Some(label);
		self
	}
}

impl std::fmt::Debug for TransactionOptions {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("TransactionOptions")
			.field("error_message", &self.error_message)
			.field("allow_write", &self.allow_write)
			.field("timeout", &self.timeout)
			.field("latency_label", &self.latency_label)
			.finish_non_exhaustive()
	}
}

enum TxInner {
	Read(redb::ReadTransaction),
	Write(redb::WriteTransaction),
}

/// Opens `$def` on whichever kind of redb transaction `$tx` is and
/// evaluates `$body` with the table bound to `$table`.
macro_rules! with_readable {
	($tx:expr, $def:expr, |$table:ident| $body:expr) => {
		match $tx {
			TxInner::Read(tx) => {
				let $table = tx.open_table($def).map_err(from_redb_error)?;
				$body
			}
			TxInner::Write(tx) => {
				let $table = tx.open_table($def).map_err(from_redb_error)?;
				$body
			}
		}
	};
}

pub struct Transaction {
	tx: Option<TxInner>,
	connection: Arc<Connection>,
	store_names: Vec<Box<str>>,
	error_message: Box<str>,
	abort: CancellationToken,
	deadline: Option<(Instant, Duration)>,
	on_error: ErrorCallback,
	on_timeout: Option<TimeoutCallback>,
	latency_label: Option<&'static str>,
	composing: Arc<AtomicBool>,
	/// Held by write transactions until they finish
	_write_guard: Option<OwnedMutexGuard<()>>,
}

impl Transaction {
	pub(crate) async fn begin(
		connection: Arc<Connection>,
		store_names: &[&str],
		options: TransactionOptions,
		reporter: &Arc<dyn ErrorReporter>,
		composing: Arc<AtomicBool>,
	) -> LsResult<Self> {
		if connection.is_closed() {
			return Err(Error::ConnectionClosed);
		}
		for store in store_names {
			if !connection.schema().has_store(store) {
				return Err(Error::NotFound(format!("object store {}", store)));
			}
		}

		let (tx, write_guard) = if options.allow_write {
			let guard = connection.lock_writes().await;
			if connection.is_closed() {
				return Err(Error::ConnectionClosed);
			}
			(TxInner::Write(connection.db.begin_write().map_err(from_redb_error)?), Some(guard))
		} else {
			use redb::ReadableDatabase;
			(TxInner::Read(connection.db.begin_read().map_err(from_redb_error)?), None)
		};

		let on_error = options.on_error.unwrap_or_else(|| {
			let reporter = Arc::clone(reporter);
			Arc::new(move |err: &Error| reporter.log(err))
		});
		let started = Instant::now();

		Ok(Self {
			tx: Some(tx),
			connection,
			store_names: store_names.iter().map(|s| (*s).into()).collect(),
			error_message: options.error_message,
			abort: CancellationToken::new(),
			deadline: options.timeout.filter(|t| !t.is_zero()).map(|t| (started, t)),
			on_error,
			on_timeout: options.on_timeout,
			latency_label: options.latency_label,
			composing,
			_write_guard: write_guard,
		})
	}

	pub fn is_writable(&self) -> bool {
		matches!(self.tx, Some(TxInner::Write(_)))
	}

	pub fn connection(&self) -> &Arc<Connection> {
		&self.connection
	}

	/// Token cancelled when the transaction aborts
	pub fn abort_token(&self) -> CancellationToken {
		self.abort.clone()
	}

	pub fn is_aborted(&self) -> bool {
		self.abort.is_cancelled()
	}

	fn request<T>(&self, description: String) -> Request<T> {
		let on_error = Arc::clone(&self.on_error);
		let req = Request::new(format!("{}: {}", self.error_message, description), self.abort.clone())
			.with_latency_label(self.latency_label)
			.with_composing_state(Arc::clone(&self.composing))
			.with_error_callback(move |err| on_error(err));
		match &self.on_timeout {
			Some(on_timeout) => {
				let on_timeout = Arc::clone(on_timeout);
				req.with_timeout_callback(move || on_timeout())
			}
			None => req,
		}
	}

	/// Runs one storage operation as a request on this transaction
	async fn run<T, F>(&mut self, description: String, store: &str, f: F) -> LsResult<T>
	where
		F: FnOnce(&TxInner, &Schema) -> LsResult<T>,
	{
		let req = self.request(description);

		let result = if self.abort.is_cancelled() {
			Some(Err(Error::Aborted))
		} else if self.connection.is_closed() {
			Some(Err(Error::ConnectionClosed))
		} else if !self.store_names.iter().any(|s| s.as_ref() == store) {
			Some(Err(Error::NotFound(format!("object store {} is not part of this transaction", store))))
		} else {
			match (&self.tx, self.deadline) {
				(None, _) => Some(Err(Error::InvalidState("transaction already finished".into()))),
				(Some(_), Some((started, limit))) if started.elapsed() >= limit => None,
				(Some(tx), _) => Some(f(tx, self.connection.schema())),
			}
		};

		match result {
			Some(result) => {
				let remaining = self.deadline.map(|(started, limit)| limit.saturating_sub(started.elapsed()));
				req.with_timeout(remaining).run(std::future::ready(result)).await
			}
			// Past the transaction deadline: the request can only time out
			None => {
				req.with_timeout(Some(Duration::from_millis(1)))
					.run(std::future::pending::<LsResult<T>>())
					.await
			}
		}
	}

	pub async fn get(&mut self, store: &str, key: &Key) -> LsResult<Option<Value>> {
		let description = db_util::describe_request("get", store, &db_util::describe_key(key));
		let enc = key.encode();
		self.run(description, store, |tx, _| {
			let name = schema::store_table_name(store);
			with_readable!(tx, schema::store_table(&name), |table| read_row(&table, &enc))
		})
		.await
	}

	pub async fn get_all(&mut self, store: &str, range: &KeyRange, limit: Option<usize>) -> LsResult<Vec<Value>> {
		let entries = self.get_all_entries(store, range, limit).await?;
		Ok(entries.into_iter().map(|(_, v)| v).collect())
	}

	/// Rows in `range` with their primary keys, in key order
	pub async fn get_all_entries(
		&mut self,
		store: &str,
		range: &KeyRange,
		limit: Option<usize>,
	) -> LsResult<Vec<(Key, Value)>> {
		let description = db_util::describe_request("getAll", store, &db_util::describe_range(range));
		let bounds = range.store_bounds();
		self.run(description, store, |tx, _| {
			let name = schema::store_table_name(store);
			with_readable!(tx, schema::store_table(&name), |table| scan(&table, &bounds, limit))
		})
		.await
	}

	/// Rows whose index key for `index` falls in `range`, ordered by index key
	pub async fn get_all_by_index(&mut self, store: &str, index: &str, range: &KeyRange) -> LsResult<Vec<Value>> {
		let description =
			db_util::describe_request("getAllByIndex", store, &format!("{} {}", index, db_util::describe_range(range)));
		let bounds = range.index_bounds();
		self.run(description, store, |tx, schema| {
			if !schema.indexes(store).any(|(name, _)| name == index) {
				return Err(Error::NotFound(format!("index {} on {}", index, store)));
			}
			let rows_name = schema::store_table_name(store);
			let index_name = schema::index_table_name(store, index);
			let rows = match tx {
				TxInner::Read(tx) => {
					let entries = tx.open_table(schema::index_table(&index_name)).map_err(from_redb_error)?;
					let table = tx.open_table(schema::store_table(&rows_name)).map_err(from_redb_error)?;
					scan_index(&entries, &table, &bounds)?
				}
				TxInner::Write(tx) => {
					let entries = tx.open_table(schema::index_table(&index_name)).map_err(from_redb_error)?;
					let table = tx.open_table(schema::store_table(&rows_name)).map_err(from_redb_error)?;
					scan_index(&entries, &table, &bounds)?
				}
			};
			Ok(rows)
		})
		.await
	}

	pub async fn count(&mut self, store: &str, range: &KeyRange) -> LsResult<usize> {
		let description = db_util::describe_request("count", store, &db_util::describe_range(range));
		let bounds = range.store_bounds();
		self.run(description, store, |tx, _| {
			let name = schema::store_table_name(store);
			with_readable!(tx, schema::store_table(&name), |table| {
				let mut count = 0;
				if let Some(range) = byte_range(&bounds) {
					for item in table.range::<&[u8]>(range).map_err(from_redb_error)? {
						item.map_err(from_redb_error)?;
						count += 1;
					}
				}
				Ok(count)
			})
		})
		.await
	}

	/// Inserts or replaces the row at `key`, keeping every index of the store current
	pub async fn put(&mut self, store: &str, key: &Key, row: &Value) -> LsResult<()> {
		let description = db_util::describe_request("put", store, &db_util::describe_key(key));
		self.run(description, store, |tx, schema| {
			let tx = writable(tx, store)?;
			write_row(tx, schema, store, key, row, true)
		})
		.await
	}

	/// Inserts a new row. Fails with `ConstraintError` if the key exists.
	pub async fn add(&mut self, store: &str, key: &Key, row: &Value) -> LsResult<()> {
		let description = db_util::describe_request("add", store, &db_util::describe_key(key));
		self.run(description, store, |tx, schema| {
			let tx = writable(tx, store)?;
			write_row(tx, schema, store, key, row, false)
		})
		.await
	}

	/// Deletes the row at `key`. Returns whether a row was removed.
	pub async fn delete(&mut self, store: &str, key: &Key) -> LsResult<bool> {
		let description = db_util::describe_request("delete", store, &db_util::describe_key(key));
		self.run(description, store, |tx, schema| {
			let tx = writable(tx, store)?;
			delete_row(tx, schema, store, key)
		})
		.await
	}

	/// Deletes every row in `range`, returning the number of rows removed
	pub async fn delete_range(&mut self, store: &str, range: &KeyRange) -> LsResult<usize> {
		let description = db_util::describe_request("deleteRange", store, &db_util::describe_range(range));
		let bounds = range.store_bounds();
		self.run(description, store, |tx, schema| {
			let tx = writable(tx, store)?;
			let name = schema::store_table_name(store);
			let keys: Vec<Key> = {
				let table = tx.open_table(schema::store_table(&name)).map_err(from_redb_error)?;
				scan(&table, &bounds, None)?.into_iter().map(|(k, _)| k).collect()
			};
			for key in &keys {
				delete_row(tx, schema, store, key)?;
			}
			Ok(keys.len())
		})
		.await
	}

	pub async fn open_cursor(
		&mut self,
		store: &str,
		range: &KeyRange,
		direction: CursorDirection,
	) -> LsResult<Cursor> {
		let entries = self.get_all_entries(store, range, None).await?;
		Ok(Cursor::new(entries, direction))
	}

	/// Commits every change made through this transaction
	pub async fn commit(mut self) -> LsResult<()> {
		let req = self.request::<()>("commit".into());
		let Some(tx) = self.tx.take() else {
			return Err(Error::InvalidState("transaction already finished".into()));
		};
		let result = if self.abort.is_cancelled() {
			Err(Error::Aborted)
		} else {
			match tx {
				TxInner::Read(_) => Ok(()),
				TxInner::Write(tx) => tx.commit().map_err(from_redb_error),
			}
		};
		req.with_timeout(None).run_once(result).await
	}

	/// Rolls back every change and suppresses pending callbacks
	pub fn abort(mut self) -> LsResult<()> {
		self.abort.cancel();
		match self.tx.take() {
			Some(TxInner::Write(tx)) => tx.abort().map_err(from_redb_error),
			_ => Ok(()),
		}
	}

	/// Finishes the transaction early: the changes made so far are kept,
	/// but no further callbacks are delivered for it.
	pub fn abandon(mut self) -> LsResult<()> {
		self.abort.cancel();
		match self.tx.take() {
			Some(TxInner::Write(tx)) => tx.commit().map_err(from_redb_error),
			_ => Ok(()),
		}
	}
}

impl std::fmt::Debug for Transaction {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Transaction")
			.field("database", &self.connection.name())
			.field("stores", &self.store_names)
			.field("writable", &self.is_writable())
			.field("aborted", &self.abort.is_cancelled())
			.finish_non_exhaustive()
	}
}

fn writable<'a>(tx: &'a TxInner, store: &str) -> LsResult<&'a redb::WriteTransaction> {
	match tx {
		TxInner::Write(tx) => Ok(tx),
		TxInner::Read(_) => Err(Error::ReadOnly(format!("cannot write to {} in a read-only transaction", store))),
	}
}

type ByteRange<'a> = (Bound<&'a [u8]>, Bound<&'a [u8]>);

/// Borrowed byte range, or None if the bounds select nothing
fn byte_range(bounds: &ByteBounds) -> Option<ByteRange<'_>> {
	let lower = bounds.0.as_ref().map(Vec::as_slice);
	let upper = bounds.1.as_ref().map(Vec::as_slice);
	let empty = match (lower, upper) {
		(Bound::Included(l), Bound::Included(u)) => l > u,
		(Bound::Included(l) | Bound::Excluded(l), Bound::Excluded(u))
		| (Bound::Excluded(l), Bound::Included(u)) => l >= u,
		_ => false,
	};
	if empty { None } else { Some((lower, upper)) }
}

fn read_row<T>(table: &T, key: &[u8]) -> LsResult<Option<Value>>
where
	T: ReadableTable<&'static [u8], &'static str>,
{
	match table.get(key).map_err(from_redb_error)? {
		Some(row) => Ok(Some(serde_json::from_str(row.value())?)),
		None => Ok(None),
	}
}

fn scan<T>(table: &T, bounds: &ByteBounds, limit: Option<usize>) -> LsResult<Vec<(Key, Value)>>
where
	T: ReadableTable<&'static [u8], &'static str>,
{
	let mut out = Vec::new();
	let Some(range) = byte_range(bounds) else {
		return Ok(out);
	};
	for item in table.range::<&[u8]>(range).map_err(from_redb_error)? {
		if limit.is_some_and(|limit| out.len() >= limit) {
			break;
		}
		let (key, row) = item.map_err(from_redb_error)?;
		out.push((Key::decode(key.value())?, serde_json::from_str(row.value())?));
	}
	Ok(out)
}

fn scan_index<I, T>(entries: &I, table: &T, bounds: &ByteBounds) -> LsResult<Vec<Value>>
where
	I: ReadableTable<&'static [u8], &'static [u8]>,
	T: ReadableTable<&'static [u8], &'static str>,
{
	let mut out = Vec::new();
	let Some(range) = byte_range(bounds) else {
		return Ok(out);
	};
	for item in entries.range::<&[u8]>(range).map_err(from_redb_error)? {
		let (_, primary) = item.map_err(from_redb_error)?;
		match read_row(table, primary.value())? {
			Some(row) => out.push(row),
			None => warn!("Dangling index entry for {:?}", Key::decode(primary.value()).ok()),
		}
	}
	Ok(out)
}

fn write_row(
	tx: &redb::WriteTransaction,
	schema: &Schema,
	store: &str,
	key: &Key,
	row: &Value,
	overwrite: bool,
) -> LsResult<()> {
	let enc = key.encode();
	let name = schema::store_table_name(store);
	let old = {
		let mut table = tx.open_table(schema::store_table(&name)).map_err(from_redb_error)?;
		let old = read_row(&table, &enc)?;
		if old.is_some() && !overwrite {
			return Err(Error::ConstraintError(format!(
				"key {} already exists in {}",
				db_util::describe_key(key),
				store
			)));
		}
		let json = serde_json::to_string(row)?;
		table.insert(enc.as_slice(), json.as_str()).map_err(from_redb_error)?;
		old
	};
	update_indexes(tx, schema, store, key, old.as_ref(), Some(row))
}

fn delete_row(tx: &redb::WriteTransaction, schema: &Schema, store: &str, key: &Key) -> LsResult<bool> {
	let enc = key.encode();
	let name = schema::store_table_name(store);
	let old = {
		let mut table = tx.open_table(schema::store_table(&name)).map_err(from_redb_error)?;
		let old = read_row(&table, &enc)?;
		if old.is_some() {
			table.remove(enc.as_slice()).map_err(from_redb_error)?;
		}
		old
	};
	let Some(old) = old else {
		return Ok(false);
	};
	update_indexes(tx, schema, store, key, Some(&old), None)?;
	Ok(true)
}

/// Moves the index entries of one row from its old to its new index keys
fn update_indexes(
	tx: &redb::WriteTransaction,
	schema: &Schema,
	store: &str,
	key: &Key,
	old: Option<&Value>,
	new: Option<&Value>,
) -> LsResult<()> {
	let primary = key.encode();
	for (index, def) in schema.indexes(store) {
		let old_key = old.and_then(|row| schema::index_key_for(row, &def.key_path));
		let new_key = new.and_then(|row| schema::index_key_for(row, &def.key_path));
		if old_key == new_key {
			continue;
		}

		let name = schema::index_table_name(store, index);
		let mut entries = tx.open_table(schema::index_table(&name)).map_err(from_redb_error)?;
		if let Some(old_key) = old_key {
			entries.remove(schema::index_entry(&old_key, key).as_slice()).map_err(from_redb_error)?;
		}
		if let Some(new_key) = new_key {
			entries
				.insert(schema::index_entry(&new_key, key).as_slice(), primary.as_slice())
				.map_err(from_redb_error)?;
		}
	}
	Ok(())
}

// vim: ts=4
