use async_trait::async_trait;
use localstore::error_reporter::TracingErrorReporter;
use localstore::file_storage_adapter::{FileEntry, FileStorageAdapter};
use localstore::prelude::*;
use localstore_db::FileSyncTask;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// In-memory file store failing on configured ids
#[derive(Debug, Default)]
struct MockFileStorage {
	files: Mutex<BTreeSet<String>>,
	failing: BTreeSet<String>,
	fail_listing: bool,
}

impl MockFileStorage {
	fn with_files(files: &[&str]) -> Self {
		Self { files: Mutex::new(files.iter().map(ToString::to_string).collect()), ..Self::default() }
	}

	fn failing(mut self, ids: &[&str]) -> Self {
		self.failing = ids.iter().map(ToString::to_string).collect();
		self
	}

	fn stored(&self) -> Vec<String> {
		self.files.lock().unwrap().iter().cloned().collect()
	}
}

#[async_trait]
impl FileStorageAdapter for MockFileStorage {
	async fn get_all_files(&self, directory: &str) -> LsResult<Vec<FileEntry>> {
		if self.fail_listing {
			return Err(Error::DbError("listing unavailable".into()));
		}
		let files = self.files.lock().unwrap();
		Ok(files
			.iter()
			.map(|id| FileEntry { id: id.as_str().into(), local_url: format!("mem://{}/{}", directory, id).into() })
			.collect())
	}

	async fn add_file(&self, path: &str, id: &str, remote_url: &str) -> LsResult<Box<str>> {
		tokio::time::sleep(Duration::from_millis(1)).await;
		if self.failing.contains(id) {
			return Err(Error::NotFound(remote_url.to_string()));
		}
		self.files.lock().unwrap().insert(id.to_string());
		Ok(format!("mem://{}/{}", path, id).into())
	}

	async fn remove_file(&self, _directory: &str, id: &str) -> LsResult<()> {
		if self.failing.contains(id) {
			return Err(Error::Io(std::io::Error::other("locked")));
		}
		self.files.lock().unwrap().remove(id);
		Ok(())
	}
}

fn create_test_files(ids: &[&str]) -> BTreeMap<Box<str>, Box<str>> {
	ids.iter().map(|id| ((*id).into(), format!("https://files.example/{}", id).into())).collect()
}

#[tokio::test]
async fn test_writes_and_deletes_missing_files() {
	let storage = Arc::new(MockFileStorage::with_files(&["old1", "keep", "old2"]));
	let files = create_test_files(&["keep", "new1", "new2"]);
	let task = FileSyncTask::new(storage.clone(), Arc::new(TracingErrorReporter), "images", files, true);

	let result = task.run().await;
	let counters = result.counters();
	assert_eq!((counters.total_writes, counters.write_successes), (3, 3));
	assert_eq!((counters.total_deletes, counters.delete_successes), (2, 2));
	assert!(counters.is_complete());
	assert!(!result.has_failures());
	assert_eq!(result.get_local_url("new1"), Some("mem://images/new1"));
	assert_eq!(result.get_local_url("old1"), None);
	assert_eq!(storage.stored(), vec!["keep", "new1", "new2"]);
}

#[tokio::test]
async fn test_failures_do_not_stop_other_files() {
	let storage = Arc::new(MockFileStorage::with_files(&["stale", "stuck"]).failing(&["broken", "stuck"]));
	let files = create_test_files(&["a", "broken", "b"]);
	let task = FileSyncTask::new(storage.clone(), Arc::new(TracingErrorReporter), "images", files, true);

	let result = task.run().await;
	let counters = result.counters();
	assert_eq!((counters.write_successes, counters.write_failures), (2, 1));
	assert_eq!((counters.delete_successes, counters.delete_failures), (1, 1));
	assert!(counters.is_complete());
	assert!(result.has_failures());
	assert_eq!(result.get_local_url("broken"), None);
	assert_eq!(storage.stored(), vec!["a", "b", "stuck"]);
}

#[tokio::test]
async fn test_keeps_unrequested_files_without_delete_missing() {
	let storage = Arc::new(MockFileStorage::with_files(&["other"]));
	let task =
		FileSyncTask::new(storage.clone(), Arc::new(TracingErrorReporter), "images", create_test_files(&["a"]), false);

	let result = task.run().await;
	assert_eq!(result.counters().total_deletes, 0);
	assert_eq!(storage.stored(), vec!["a", "other"]);
}

#[tokio::test]
async fn test_listing_failure_still_writes() {
	let storage = Arc::new(MockFileStorage { fail_listing: true, ..MockFileStorage::default() });
	let task =
		FileSyncTask::new(storage.clone(), Arc::new(TracingErrorReporter), "images", create_test_files(&["a"]), true);

	let result = task.run().await;
	assert!(result.has_failures());
	assert_eq!(result.counters().write_successes, 1);
	assert_eq!(result.counters().total_deletes, 0);
}

#[tokio::test]
async fn test_start_reports_completion_once() {
	let storage = Arc::new(MockFileStorage::default());
	let files = create_test_files(&["a", "b", "c", "d", "e", "f", "g", "h", "i", "j"]);
	let task = FileSyncTask::new(storage.clone(), Arc::new(TracingErrorReporter), "images", files, true);

	let calls = Arc::new(AtomicUsize::new(0));
	let (tx, rx) = tokio::sync::oneshot::channel();
	let counter = Arc::clone(&calls);
	let handle = task.start(move |result| {
		counter.fetch_add(1, Ordering::SeqCst);
		let _ = tx.send(result);
	});

	let result = tokio::time::timeout(Duration::from_secs(5), rx).await.unwrap().unwrap();
	handle.await.unwrap();
	assert_eq!(calls.load(Ordering::SeqCst), 1);
	assert_eq!(result.counters().write_successes, 10);
	assert_eq!(storage.stored().len(), 10);
}

#[tokio::test]
async fn test_run_as_spawned_task_with_deletes() {
	let storage = Arc::new(MockFileStorage::with_files(&["gone1", "gone2"]));
	let task =
		FileSyncTask::new(storage.clone(), Arc::new(TracingErrorReporter), "images", create_test_files(&["a", "b"]), true);

	let result = tokio::spawn(task.run()).await.unwrap();
	assert_eq!((result.counters().write_successes, result.counters().delete_successes), (2, 2));
	assert_eq!(storage.stored(), vec!["a", "b"]);
}

#[tokio::test]
async fn test_empty_sync_completes() {
	let storage = Arc::new(MockFileStorage::default());
	let task = FileSyncTask::new(storage, Arc::new(TracingErrorReporter), "images", BTreeMap::new(), true);
	let result = task.run().await;
	assert!(result.counters().is_complete());
	assert!(!result.has_failures());
}

// vim: ts=4
