//! Filesystem-backed [`FileStorageAdapter`].
//!
//! Files live at `{base_dir}/{directory}/{id}` and are addressed by `file://`
//! URLs. Content is fetched through a [`RemoteFetcher`] and written to a
//! temporary file first, so a failed download never leaves a partial file
//! behind under its final name.

use std::{
	path::{Component, Path, PathBuf},
	sync::Arc,
};

use async_trait::async_trait;
use tokio::{
	fs::{File, create_dir_all, read_dir, remove_file, rename},
	io::AsyncWriteExt,
};

use localstore::{
	file_storage_adapter::{FileEntry, FileStorageAdapter, RemoteFetcher},
	prelude::*,
};

const TMP_PREFIX: &str = ".tmp-";

/// Directory holding the files of `directory`
fn dir_path(base_dir: &Path, directory: &str) -> LsResult<PathBuf> {
	let relative = Path::new(directory);
	if !relative.components().all(|c| matches!(c, Component::Normal(_))) {
		return Err(Error::InvalidKey(format!("invalid file directory: {}", directory)));
	}
	Ok(base_dir.join(relative))
}

fn file_path(base_dir: &Path, directory: &str, id: &str) -> LsResult<PathBuf> {
	if id.is_empty() || id.starts_with('.') || id.contains(['/', '\\']) {
		return Err(Error::InvalidKey(format!("invalid file id: {}", id)));
	}
	Ok(dir_path(base_dir, directory)?.join(id))
}

fn tmp_file_path(base_dir: &Path, directory: &str, id: &str) -> LsResult<PathBuf> {
	file_path(base_dir, directory, id)?;
	Ok(dir_path(base_dir, directory)?.join(format!("{}{}", TMP_PREFIX, id)))
}

fn local_url(path: &Path) -> Box<str> {
	format!("file://{}", path.display()).into()
}

#[derive(Debug)]
pub struct FsFileStorageAdapter {
	base_dir: Box<Path>,
	fetcher: Arc<dyn RemoteFetcher>,
}

impl FsFileStorageAdapter {
	pub async fn new(base_dir: Box<Path>, fetcher: Arc<dyn RemoteFetcher>) -> LsResult<Self> {
		create_dir_all(&base_dir).await?;
		Ok(Self { base_dir, fetcher })
	}

	pub fn base_dir(&self) -> &Path {
		&self.base_dir
	}
}

#[async_trait]
impl FileStorageAdapter for FsFileStorageAdapter {
	/// Lists regular files; a missing directory has no files
	async fn get_all_files(&self, directory: &str) -> LsResult<Vec<FileEntry>> {
		let dir = dir_path(&self.base_dir, directory)?;
		let mut entries = match read_dir(&dir).await {
			Ok(entries) => entries,
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
			Err(err) => return Err(err.into()),
		};

		let mut files = Vec::new();
		while let Some(entry) = entries.next_entry().await? {
			if !entry.file_type().await?.is_file() {
				continue;
			}
			let Some(id) = entry.file_name().to_str().map(Box::<str>::from) else {
				continue;
			};
			if id.starts_with('.') {
				continue;
			}
			files.push(FileEntry { local_url: local_url(&entry.path()), id });
		}
		files.sort_by(|a, b| a.id.cmp(&b.id));
		Ok(files)
	}

	async fn add_file(&self, path: &str, id: &str, remote_url: &str) -> LsResult<Box<str>> {
		let target = file_path(&self.base_dir, path, id)?;
		let tmp_path = tmp_file_path(&self.base_dir, path, id)?;
		let data = self.fetcher.fetch(remote_url).await?;
		create_dir_all(dir_path(&self.base_dir, path)?).await?;

		let res = async {
			let mut file = File::create(&tmp_path).await?;
			file.write_all(&data).await?;
			file.sync_all().await?;
			rename(&tmp_path, &target).await?;
			Ok::<(), Error>(())
		}
		.await;
		if let Err(err) = res {
			info!("  writing {:?} failed, removing tmpfile", &target);
			let _ = remove_file(&tmp_path).await;
			return Err(err);
		}

		debug!("stored {} ({} bytes)", remote_url, data.len());
		Ok(local_url(&target))
	}

	async fn remove_file(&self, directory: &str, id: &str) -> LsResult<()> {
		let path = file_path(&self.base_dir, directory, id)?;
		remove_file(&path).await.map_err(|err| match err.kind() {
			std::io::ErrorKind::NotFound => Error::NotFound(format!("file {}", path.display())),
			_ => Error::from(err),
		})
	}
}


// vim: ts=4
