//! Generic read-modify-write of stored rows.
//!
//! Patching always assumes the row exists; creating rows is a separate,
//! explicit `put` done by the capabilities for records that are still new.

use localstore::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::transaction::Transaction;

/// Store holding profile-wide singleton rows, keyed by their data type
pub const PROFILE_DATA_STORE: &str = "ProfileData";

/// Applies `modifications` to the row at `key` and writes it back.
///
/// A null value is only accepted for properties listed in `nullable`.
pub async fn save_modifications(
	tx: &mut Transaction,
	store: &str,
	key: &Key,
	modifications: &Map<String, Value>,
	nullable: &[&str],
) -> LsResult<()> {
	let Some(row) = tx.get(store, key).await? else {
		return Err(Error::NotFound(format!(
			"could not find object to update in {} at {}",
			store,
			key.to_value()
		)));
	};
	let row = apply_modifications(row, modifications, nullable)?;
	tx.put(store, key, &row).await
}

/// Merges a sparse set of property changes into a row
pub fn apply_modifications(row: Value, modifications: &Map<String, Value>, nullable: &[&str]) -> LsResult<Value> {
	let Value::Object(mut row) = row else {
		return Err(Error::InvalidModification("stored row is not an object".into()));
	};
	for (property, value) in modifications {
		if value.is_null() && !nullable.contains(&property.as_str()) {
			return Err(Error::InvalidModification(format!("property {} is not nullable", property)));
		}
		row.insert(property.clone(), value.clone());
	}
	Ok(Value::Object(row))
}

// Document id lists //
//*******************//

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentIdList {
	pub data_type: Box<str>,
	pub document_ids: Vec<Box<str>>,
}

/// Reads the document id list stored under `data_type`. Missing lists are empty.
pub async fn read_document_id_list(tx: &mut Transaction, data_type: &str) -> LsResult<DocumentIdList> {
	match tx.get(PROFILE_DATA_STORE, &Key::from(data_type)).await? {
		Some(row) => Ok(serde_json::from_value(row)?),
		None => Ok(DocumentIdList { data_type: data_type.into(), document_ids: Vec::new() }),
	}
}

pub async fn write_document_id_list(tx: &mut Transaction, list: &DocumentIdList) -> LsResult<()> {
	let row = serde_json::to_value(list)?;
	tx.put(PROFILE_DATA_STORE, &Key::from(list.data_type.as_ref()), &row).await
}


// vim: ts=4
