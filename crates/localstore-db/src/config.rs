use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the document localstore
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StoreConfig {
	/// Directory holding the database files
	pub storage_dir: PathBuf,

	/// Name of the documents database
	pub database_name: String,

	/// Timeout for each storage request in milliseconds (0 disables it)
	pub request_timeout_ms: u64,

	/// Create the storage directory if it does not exist
	pub create_dir: bool,
}

impl Default for StoreConfig {
	fn default() -> Self {
		Self {
			storage_dir: PathBuf::from("localstore"),
			database_name: "docs".into(),
			request_timeout_ms: 0,
			create_dir: true,
		}
	}
}

impl StoreConfig {
	pub fn request_timeout(&self) -> Option<Duration> {
		(self.request_timeout_ms > 0).then(|| Duration::from_millis(self.request_timeout_ms))
	}
}

// vim: ts=4
