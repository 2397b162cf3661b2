//! Object storage addressed by `s3://bucket/key` URIs.
//!
//! [`LocalObjectStore`] keeps each bucket as a directory under a root, which
//! is how a mounted bucket looks to the nodes.

use async_trait::async_trait;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tokio::fs;
use tracing::debug;
use crate::error::{DispatchError, Result};

static OBJECT_URI: LazyLock<Regex> = LazyLock::new(|| {
  Regex::new(r"^s3://([A-Za-z0-9][A-Za-z0-9._\-]*)/?(.*)$").expect("object uri pattern is valid")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectUri {
  pub bucket: String,
  pub key: String,
}

impl ObjectUri {
  pub fn parse(uri: &str) -> Result<Self> {
    let caps = OBJECT_URI
      .captures(uri.trim())
      .ok_or_else(|| DispatchError::StorageUnavailable(format!("not an object uri: {}", uri)))?;
    Ok(Self { bucket: caps[1].to_string(), key: caps[2].trim_matches('/').to_string() })
  }

  pub fn file_name(&self) -> Option<&str> {
    self.key.rsplit('/').next().filter(|name| !name.is_empty())
  }
}

pub fn object_uri(bucket: &str, key: &str) -> String {
  format!("s3://{}/{}", bucket, key.trim_start_matches('/'))
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
  /// Fetches the object into `destination_dir`, keeping its file name.
  async fn download(&self, uri: &str, destination_dir: &Path) -> Result<PathBuf>;

  /// Copies every file under `local_dir` beneath `destination_uri`.
  async fn upload_tree(&self, local_dir: &Path, destination_uri: &str) -> Result<()>;

  /// `(key, uri)` pairs for every object in `bucket`, ordered by key.
  async fn list_keys(&self, bucket: &str) -> Result<Vec<(String, String)>>;
}

pub struct LocalObjectStore {
  root: PathBuf,
}

impl LocalObjectStore {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self { root: root.into() }
  }

  fn path_for(&self, uri: &ObjectUri) -> PathBuf {
    let mut path = self.root.join(&uri.bucket);
    for part in uri.key.split('/').filter(|p| !p.is_empty() && *p != "." && *p != "..") {
      path.push(part);
    }
    path
  }
}

fn storage_error(context: &str, e: std::io::Error) -> DispatchError {
  DispatchError::StorageUnavailable(format!("{}: {}", context, e))
}

/// Every regular file below `dir`, as paths relative to it.
async fn walk_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
  let mut files = Vec::new();
  let mut pending = vec![PathBuf::new()];
  while let Some(relative) = pending.pop() {
    let mut entries = fs::read_dir(dir.join(&relative)).await?;
    while let Some(entry) = entries.next_entry().await? {
      let file_type = entry.file_type().await?;
      let child = relative.join(entry.file_name());
      if file_type.is_dir() {
        pending.push(child);
      } else if file_type.is_file() {
        files.push(child);
      }
    }
  }
  files.sort();
  Ok(files)
}

fn key_of(relative: &Path) -> String {
  relative
    .components()
    .map(|c| c.as_os_str().to_string_lossy())
    .collect::<Vec<_>>()
    .join("/")
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
  async fn download(&self, uri: &str, destination_dir: &Path) -> Result<PathBuf> {
    let parsed = ObjectUri::parse(uri)?;
    let file_name = parsed
      .file_name()
      .ok_or_else(|| DispatchError::StorageUnavailable(format!("object uri has no key: {}", uri)))?;
    let destination = destination_dir.join(file_name);
    debug!(uri, destination = %destination.display(), "Downloading object");
    fs::copy(self.path_for(&parsed), &destination)
      .await
      .map_err(|e| storage_error(&format!("failed to download {}", uri), e))?;
    Ok(destination)
  }

  async fn upload_tree(&self, local_dir: &Path, destination_uri: &str) -> Result<()> {
    let base = self.path_for(&ObjectUri::parse(destination_uri)?);
    let files = walk_files(local_dir)
      .await
      .map_err(|e| storage_error(&format!("failed to walk {}", local_dir.display()), e))?;
    for relative in files {
      let target = base.join(&relative);
      if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)
          .await
          .map_err(|e| storage_error("failed to create object prefix", e))?;
      }
      fs::copy(local_dir.join(&relative), &target)
        .await
        .map_err(|e| storage_error(&format!("failed to upload {}", relative.display()), e))?;
    }
    debug!(local = %local_dir.display(), destination_uri, "Uploaded directory tree");
    Ok(())
  }

  async fn list_keys(&self, bucket: &str) -> Result<Vec<(String, String)>> {
    let files = walk_files(&self.root.join(bucket))
      .await
      .map_err(|e| storage_error(&format!("failed to list bucket {}", bucket), e))?;
    Ok(files.iter()
      .map(|relative| {
        let key = key_of(relative);
        let uri = object_uri(bucket, &key);
        (key, uri)
      })
      .collect())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_object_uris() {
    let uri = ObjectUri::parse("s3://problems/set-a/test.cnf").unwrap();
    assert_eq!(uri.bucket, "problems");
    assert_eq!(uri.key, "set-a/test.cnf");
    assert_eq!(uri.file_name(), Some("test.cnf"));
    assert!(ObjectUri::parse("https://example.com/x").is_err());
    assert_eq!(ObjectUri::parse("s3://bucket").unwrap().file_name(), None);
  }

  #[tokio::test]
  async fn download_and_upload_tree() {
    let root = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(root.path().join("problems/set-a")).unwrap();
    std::fs::write(root.path().join("problems/set-a/test.cnf"), "p cnf 1 1\n1 0\n").unwrap();

    let store = LocalObjectStore::new(root.path());
    let local = store.download("s3://problems/set-a/test.cnf", work.path()).await.unwrap();
    assert_eq!(local, work.path().join("test.cnf"));
    assert_eq!(std::fs::read_to_string(&local).unwrap(), "p cnf 1 1\n1 0\n");

    std::fs::create_dir_all(work.path().join("nested")).unwrap();
    std::fs::write(work.path().join("nested/log.txt"), "hello").unwrap();
    store.upload_tree(work.path(), "s3://artifacts/task-1").await.unwrap();

    let keys = store.list_keys("artifacts").await.unwrap();
    assert_eq!(keys, vec![
      ("task-1/nested/log.txt".to_string(), "s3://artifacts/task-1/nested/log.txt".to_string()),
      ("task-1/test.cnf".to_string(), "s3://artifacts/task-1/test.cnf".to_string()),
    ]);
  }

  #[tokio::test]
  async fn missing_object_is_a_storage_error() {
    let root = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let store = LocalObjectStore::new(root.path());
    let err = store.download("s3://problems/absent.cnf", work.path()).await.unwrap_err();
    assert!(matches!(err, DispatchError::StorageUnavailable(_)));
  }
}
