//! Persisted schema: object stores, indexes, and the schema version.
//!
//! # Storage Layout
//!
//! - `__meta` - schema version and store/index definitions as JSON
//! - `os:{store}` - rows of an object store: encoded key -> JSON row
//! - `ix:{store}:{index}` - index entries: encoded `[indexKey, primaryKey]` -> encoded primary key

use localstore::prelude::*;
use redb::{ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::from_redb_error;

/// Metadata storage table
pub const TABLE_META: TableDefinition<&str, &str> = TableDefinition::new("__meta");

const META_VERSION: &str = "version";
const META_SCHEMA: &str = "schema";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexSchema {
	/// Row property whose value is the index key
	pub key_path: Box<str>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSchema {
	pub indexes: BTreeMap<Box<str>, IndexSchema>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
	pub stores: BTreeMap<Box<str>, StoreSchema>,
}

impl Schema {
	pub fn has_store(&self, store: &str) -> bool {
		self.stores.contains_key(store)
	}

	/// Store names in sorted order
	pub fn store_names(&self) -> Vec<String> {
		self.stores.keys().map(ToString::to_string).collect()
	}

	pub fn indexes(&self, store: &str) -> impl Iterator<Item = (&str, &IndexSchema)> {
		self.stores
			.get(store)
			.into_iter()
			.flat_map(|s| s.indexes.iter().map(|(name, idx)| (name.as_ref(), idx)))
	}
}

pub fn store_table_name(store: &str) -> String {
	format!("os:{}", store)
}

pub fn index_table_name(store: &str, index: &str) -> String {
	format!("ix:{}:{}", store, index)
}

pub fn store_table(name: &str) -> TableDefinition<'_, &'static [u8], &'static str> {
	TableDefinition::new(name)
}

pub fn index_table(name: &str) -> TableDefinition<'_, &'static [u8], &'static [u8]> {
	TableDefinition::new(name)
}

/// Extracts the index key of a row, if the row has a valid key at `key_path`.
pub fn index_key_for(row: &Value, key_path: &str) -> Option<Key> {
	row.get(key_path).and_then(|v| Key::from_value(v).ok())
}

/// Encoded index entry for a row
pub fn index_entry(index_key: &Key, primary_key: &Key) -> Vec<u8> {
	Key::Array(vec![index_key.clone(), primary_key.clone()]).encode()
}

/// Reads version and schema. Works on both read and write transactions.
pub fn load_meta<T>(table: &T) -> LsResult<(u64, Schema)>
where
	T: ReadableTable<&'static str, &'static str>,
{
	let version = match table.get(META_VERSION).map_err(from_redb_error)? {
		Some(v) => v.value().parse::<u64>().map_err(|e| Error::Serialization(e.to_string()))?,
		None => 0,
	};
	let schema = match table.get(META_SCHEMA).map_err(from_redb_error)? {
		Some(v) => serde_json::from_str(v.value())?,
		None => Schema::default(),
	};
	Ok((version, schema))
}

pub fn store_meta(tx: &redb::WriteTransaction, version: u64, schema: &Schema) -> LsResult<()> {
	let mut table = tx.open_table(TABLE_META).map_err(from_redb_error)?;
	let version_str = version.to_string();
	let schema_json = serde_json::to_string(schema)?;
	table.insert(META_VERSION, version_str.as_str()).map_err(from_redb_error)?;
	table.insert(META_SCHEMA, schema_json.as_str()).map_err(from_redb_error)?;
	Ok(())
}

// vim: ts=4
