//! Bulk reconciliation of local files with a requested set.
//!
//! A `FileSyncTask` writes every requested file and, with `delete_missing`,
//! removes the local files that are no longer requested. Individual failures
//! are counted and logged; they never stop the other writes or deletes.

use futures::FutureExt;
use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use localstore::error_reporter::ErrorReporter;
use localstore::file_storage_adapter::FileStorageAdapter;
use localstore::prelude::*;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Maximum writes and deletes in flight at once
const MAX_CONCURRENT_OPERATIONS: usize = 8;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncCounters {
	pub total_writes: usize,
	pub write_successes: usize,
	pub write_failures: usize,
	pub total_deletes: usize,
	pub delete_successes: usize,
	pub delete_failures: usize,
}

impl SyncCounters {
	/// True once every write and every delete has reported back
	pub fn is_complete(&self) -> bool {
		self.write_successes + self.write_failures == self.total_writes
			&& self.delete_successes + self.delete_failures == self.total_deletes
	}
}

#[derive(Clone, Debug, Default)]
pub struct FileSyncResult {
	counters: SyncCounters,
	listing_failed: bool,
	local_urls: HashMap<Box<str>, Box<str>>,
}

impl FileSyncResult {
	pub fn has_failures(&self) -> bool {
		self.listing_failed || self.counters.write_failures > 0 || self.counters.delete_failures > 0
	}

	/// Local URL of a file written by the task
	pub fn get_local_url(&self, file_id: &str) -> Option<&str> {
		self.local_urls.get(file_id).map(AsRef::as_ref)
	}

	pub fn counters(&self) -> &SyncCounters {
		&self.counters
	}
}

enum Outcome {
	Written { id: Box<str>, result: LsResult<Box<str>> },
	Deleted { id: Box<str>, result: LsResult<()> },
}

#[derive(Debug)]
pub struct FileSyncTask {
	adapter: Arc<dyn FileStorageAdapter>,
	reporter: Arc<dyn ErrorReporter>,
	directory: Box<str>,
	/// File id to remote URL
	files: BTreeMap<Box<str>, Box<str>>,
	delete_missing: bool,
}

impl FileSyncTask {
	pub fn new(
		adapter: Arc<dyn FileStorageAdapter>,
		reporter: Arc<dyn ErrorReporter>,
		directory: &str,
		files: BTreeMap<Box<str>, Box<str>>,
		delete_missing: bool,
	) -> Self {
		Self { adapter, reporter, directory: directory.into(), files, delete_missing }
	}

	/// Local files under the directory that are not requested any more
	async fn files_to_delete(&self) -> LsResult<Vec<Box<str>>> {
		let existing = self.adapter.get_all_files(&self.directory).await?;
		let requested: HashSet<&str> = self.files.keys().map(AsRef::as_ref).collect();
		Ok(existing.into_iter().filter(|entry| !requested.contains(entry.id.as_ref())).map(|entry| entry.id).collect())
	}

	/// Runs every write and delete to completion
	pub async fn run(self) -> FileSyncResult {
		let mut result = FileSyncResult::default();

		let deletes = if self.delete_missing {
			match self.files_to_delete().await {
				Ok(deletes) => deletes,
				Err(err) => {
					self.reporter.info(&err, "listing local files failed");
					result.listing_failed = true;
					Vec::new()
				}
			}
		} else {
			Vec::new()
		};

		result.counters.total_writes = self.files.len();
		result.counters.total_deletes = deletes.len();
		info!(
			"Syncing {} files into {} ({} to delete)",
			result.counters.total_writes, self.directory, result.counters.total_deletes
		);

		// Operations own their inputs; the run future stays 'static
		let mut operations: Vec<BoxFuture<'static, Outcome>> = Vec::with_capacity(self.files.len() + deletes.len());
		for (id, remote_url) in &self.files {
			let adapter = Arc::clone(&self.adapter);
			let directory = self.directory.clone();
			let (id, remote_url) = (id.clone(), remote_url.clone());
			operations.push(
				async move {
					let result = adapter.add_file(&directory, &id, &remote_url).await;
					Outcome::Written { id, result }
				}
				.boxed(),
			);
		}
		for id in deletes {
			let adapter = Arc::clone(&self.adapter);
			let directory = self.directory.clone();
			operations.push(
				async move {
					let result = adapter.remove_file(&directory, &id).await;
					Outcome::Deleted { id, result }
				}
				.boxed(),
			);
		}

		let mut outcomes = stream::iter(operations).buffer_unordered(MAX_CONCURRENT_OPERATIONS);
		while let Some(outcome) = outcomes.next().await {
			let counters = &mut result.counters;
			match outcome {
				Outcome::Written { id, result: Ok(local_url) } => {
					counters.write_successes += 1;
					result.local_urls.insert(id, local_url);
				}
				Outcome::Written { id, result: Err(err) } => {
					counters.write_failures += 1;
					warn!("Writing file {} failed: {}", id, err);
					self.reporter.log(&err);
				}
				Outcome::Deleted { result: Ok(()), .. } => counters.delete_successes += 1,
				Outcome::Deleted { id, result: Err(err) } => {
					counters.delete_failures += 1;
					warn!("Deleting file {} failed: {}", id, err);
					self.reporter.log(&err);
				}
			}
		}

		self.reporter.assert(
			result.counters.is_complete(),
			Error::InvalidState(format!("file sync of {} ended early: {:?}", self.directory, result.counters)),
		);
		debug!("File sync of {} finished: {:?}", self.directory, result.counters);
		result
	}

	/// Runs the task in the background and hands its result to `on_complete`
	pub fn start<F>(self, on_complete: F) -> JoinHandle<()>
	where
		F: FnOnce(FileSyncResult) + Send + 'static,
	{
		tokio::spawn(async move {
			let result = self.run().await;
			on_complete(result);
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_partial_completion_is_not_complete() {
		let mut counters = SyncCounters { total_writes: 2, total_deletes: 1, ..SyncCounters::default() };
		counters.write_successes = 1;
		counters.write_failures = 1;
		assert!(!counters.is_complete());
		counters.delete_failures = 1;
		assert!(counters.is_complete());
	}

	#[test]
	fn test_empty_task_is_complete() {
		assert!(SyncCounters::default().is_complete());
	}
}

// vim: ts=4
