//! Object stores addressed by URI.
//!
//! The async inference path and the S3-type output sinks move bytes through
//! this interface. URIs are opaque strings of the form
//! `scheme://bucket/key`; the memory implementation accepts any scheme, the
//! filesystem implementation maps bucket/key onto a root directory.

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use dashmap::DashMap;
use std::{path::PathBuf, sync::Arc};

#[async_trait]
pub trait ObjectStore: Send + Sync {
	async fn put_object(&self, uri: &str, bytes: &[u8]) -> Result<()>;

	async fn get_object(&self, uri: &str) -> Result<Vec<u8>>;

	async fn object_exists(&self, uri: &str) -> Result<bool>;

	async fn delete_object(&self, uri: &str) -> Result<()>;
}

pub type SharedObjectStore = Arc<dyn ObjectStore>;

/// In-memory object store.
#[derive(Default)]
pub struct MemoryObjectStore {
	objects: DashMap<String, Vec<u8>>,
}

impl MemoryObjectStore {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub fn len(&self) -> usize {
		self.objects.len()
	}

	pub fn is_empty(&self) -> bool {
		self.objects.is_empty()
	}

	/// URIs currently stored, for inspection in tests.
	pub fn uris(&self) -> Vec<String> {
		self.objects.iter().map(|entry| entry.key().clone()).collect()
	}
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
	async fn put_object(&self, uri: &str, bytes: &[u8]) -> Result<()> {
		self.objects.insert(uri.to_string(), bytes.to_vec());
		Ok(())
	}

	async fn get_object(&self, uri: &str) -> Result<Vec<u8>> {
		self
			.objects
			.get(uri)
			.map(|entry| entry.value().clone())
			.ok_or_else(|| anyhow!("object '{uri}' does not exist"))
	}

	async fn object_exists(&self, uri: &str) -> Result<bool> {
		Ok(self.objects.contains_key(uri))
	}

	async fn delete_object(&self, uri: &str) -> Result<()> {
		self.objects.remove(uri);
		Ok(())
	}
}

/// Object store backed by a local directory; `scheme://bucket/key` maps to
/// `<root>/bucket/key`.
pub struct FileObjectStore {
	root: PathBuf,
}

impl FileObjectStore {
	pub fn new(root: PathBuf) -> Arc<Self> {
		Arc::new(Self { root })
	}

	fn path_for(&self, uri: &str) -> Result<PathBuf> {
		let (_, rest) = uri
			.split_once("://")
			.ok_or_else(|| anyhow!("object URI '{uri}' has no scheme"))?;
		if rest.is_empty() {
			bail!("object URI '{uri}' has no bucket/key");
		}
		if rest.split('/').any(|segment| segment == "..") {
			bail!("object URI '{uri}' escapes the store root");
		}
		Ok(self.root.join(rest))
	}
}

#[async_trait]
impl ObjectStore for FileObjectStore {
	async fn put_object(&self, uri: &str, bytes: &[u8]) -> Result<()> {
		let path = self.path_for(uri)?;
		if let Some(parent) = path.parent() {
			tokio::fs::create_dir_all(parent)
				.await
				.with_context(|| format!("could not create directory for '{uri}'"))?;
		}
		tokio::fs::write(&path, bytes)
			.await
			.with_context(|| format!("could not write object '{uri}'"))
	}

	async fn get_object(&self, uri: &str) -> Result<Vec<u8>> {
		let path = self.path_for(uri)?;
		tokio::fs::read(&path)
			.await
			.with_context(|| format!("could not read object '{uri}'"))
	}

	async fn object_exists(&self, uri: &str) -> Result<bool> {
		Ok(self.path_for(uri)?.exists())
	}

	async fn delete_object(&self, uri: &str) -> Result<()> {
		let path = self.path_for(uri)?;
		match tokio::fs::remove_file(&path).await {
			Ok(()) => Ok(()),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
			Err(e) => Err(e).with_context(|| format!("could not delete object '{uri}'")),
		}
	}
}

/// Joins an object-store prefix and a key into a URI.
pub fn object_uri(bucket: &str, prefix: &str, key: &str) -> String {
	let prefix = prefix.trim_matches('/');
	if prefix.is_empty() {
		format!("s3://{bucket}/{key}")
	} else {
		format!("s3://{bucket}/{prefix}/{key}")
	}
}
