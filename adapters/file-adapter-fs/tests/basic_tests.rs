//! Filesystem file adapter tests
//!
//! Covers storing, listing and removing files, and a full sync run

use async_trait::async_trait;
use localstore::error_reporter::TracingErrorReporter;
use localstore::file_storage_adapter::{FileStorageAdapter, RemoteFetcher};
use localstore::prelude::*;
use localstore_db::FileSyncTask;
use localstore_file_adapter_fs::FsFileStorageAdapter;
use std::collections::BTreeMap;
use std::sync::Arc;
use tempfile::TempDir;

/// Serves the URL itself as file content; URLs containing "missing" fail
#[derive(Debug)]
struct EchoFetcher;

#[async_trait]
impl RemoteFetcher for EchoFetcher {
	async fn fetch(&self, remote_url: &str) -> LsResult<Box<[u8]>> {
		if remote_url.contains("missing") {
			return Err(Error::NotFound(remote_url.to_string()));
		}
		Ok(remote_url.as_bytes().into())
	}
}

async fn create_test_adapter() -> (Arc<FsFileStorageAdapter>, TempDir) {
	let temp_dir = TempDir::new().expect("Failed to create temp directory");
	let adapter = FsFileStorageAdapter::new(temp_dir.path().into(), Arc::new(EchoFetcher))
		.await
		.expect("Failed to create adapter");
	(Arc::new(adapter), temp_dir)
}

#[tokio::test]
async fn test_add_and_list_files() {
	let (adapter, temp) = create_test_adapter().await;

	let url = adapter.add_file("images/doc1", "f2", "https://files.example/f2").await.unwrap();
	adapter.add_file("images/doc1", "f1", "https://files.example/f1").await.unwrap();

	let path = temp.path().join("images/doc1/f2");
	assert_eq!(url.as_ref(), format!("file://{}", path.display()));
	assert_eq!(tokio::fs::read(&path).await.unwrap(), b"https://files.example/f2");

	let files = adapter.get_all_files("images/doc1").await.unwrap();
	let ids: Vec<&str> = files.iter().map(|f| f.id.as_ref()).collect();
	assert_eq!(ids, vec!["f1", "f2"]);
	assert_eq!(files[1].local_url, url);
}

#[tokio::test]
async fn test_missing_directory_lists_nothing() {
	let (adapter, _temp) = create_test_adapter().await;
	assert!(adapter.get_all_files("nothing/here").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_fetch_leaves_no_file() {
	let (adapter, temp) = create_test_adapter().await;
	let result = adapter.add_file("images", "f1", "https://files.example/missing").await;
	assert!(matches!(result, Err(Error::NotFound(_))));
	assert!(!temp.path().join("images/f1").exists());
	assert!(adapter.get_all_files("images").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_remove_file() {
	let (adapter, temp) = create_test_adapter().await;
	adapter.add_file("images", "f1", "https://files.example/f1").await.unwrap();
	adapter.remove_file("images", "f1").await.unwrap();
	assert!(!temp.path().join("images/f1").exists());

	let result = adapter.remove_file("images", "f1").await;
	assert!(matches!(result, Err(Error::NotFound(_))));
}

#[tokio::test]
async fn test_rejects_paths_outside_base_dir() {
	let (adapter, _temp) = create_test_adapter().await;
	assert!(adapter.add_file("../outside", "f1", "https://files.example/f1").await.is_err());
	assert!(adapter.add_file("images", "../f1", "https://files.example/f1").await.is_err());
	assert!(adapter.get_all_files("/etc").await.is_err());
}

#[tokio::test]
async fn test_sync_task_over_filesystem() {
	let (adapter, temp) = create_test_adapter().await;
	adapter.add_file("images", "stale", "https://files.example/stale").await.unwrap();

	let files: BTreeMap<Box<str>, Box<str>> = [
		("a".into(), "https://files.example/a".into()),
		("b".into(), "https://files.example/missing-b".into()),
	]
	.into_iter()
	.collect();
	let task = FileSyncTask::new(adapter.clone(), Arc::new(TracingErrorReporter), "images", files, true);
	let result = task.run().await;

	assert!(result.has_failures());
	assert_eq!(result.counters().write_successes, 1);
	assert_eq!(result.counters().write_failures, 1);
	assert_eq!(result.counters().delete_successes, 1);
	let local = result.get_local_url("a").unwrap();
	assert!(local.ends_with("images/a"));
	assert!(!temp.path().join("images/stale").exists());
}

// vim: ts=4
