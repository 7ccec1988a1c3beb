//! Adapter that stores synced files on the local device
use async_trait::async_trait;
use std::fmt::Debug;

use crate::prelude::*;

/// A file already present in local storage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileEntry {
	pub id: Box<str>,
	pub local_url: Box<str>,
}

#[async_trait]
pub trait FileStorageAdapter: Debug + Send + Sync {
	/// Lists every file stored under a directory prefix
	async fn get_all_files(&self, directory: &str) -> LsResult<Vec<FileEntry>>;

	/// Fetches `remote_url` and stores it as file `id` in `path`, returning its local URL
	async fn add_file(&self, path: &str, id: &str, remote_url: &str) -> LsResult<Box<str>>;

	/// Removes file `id` from `directory`
	async fn remove_file(&self, directory: &str, id: &str) -> LsResult<()>;
}

/// Source of remote file content.
#[async_trait]
pub trait RemoteFetcher: Debug + Send + Sync {
	async fn fetch(&self, remote_url: &str) -> LsResult<Box<[u8]>>;
}

/// Receives documents that switched to local storage so they can be
/// snapshotted periodically.
pub trait SnapshotScheduler: Debug + Send + Sync {
	fn register_document(&self, doc_id: &str);
}

// vim: ts=4
