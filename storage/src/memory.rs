use std::collections::HashMap;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use tokio::{io::AsyncWriteExt, sync::RwLock};

use storage_driver::{Driver, Metadata, Reader, StorageError, Writer};

const ENGINE: &str = "memory";

#[derive(Debug, Clone)]
struct MemoryFileItem {
    created: DateTime<Utc>,
    data: Vec<u8>,
}

impl AsRef<[u8]> for MemoryFileItem {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl From<Vec<u8>> for MemoryFileItem {
    fn from(data: Vec<u8>) -> Self {
        Self {
            created: Utc::now(),
            data,
        }
    }
}

impl From<&MemoryFileItem> for Metadata {
    fn from(value: &MemoryFileItem) -> Self {
        Self {
            created: value.created,
            size: value.data.len() as u64,
        }
    }
}

type Bucket = HashMap<Utf8PathBuf, MemoryFileItem>;

/// Storage driver that stores objects in memory.
///
/// Buckets are created on first upload. Reads against a bucket that was never
/// written behave like reads of a missing object.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    buckets: RwLock<HashMap<String, Bucket>>,
}

impl MemoryStorage {
    /// Create a new `MemoryStorage` instance, with no buckets.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new `MemoryStorage` instance, with the given buckets.
    pub fn with_buckets(buckets: &[&str]) -> Self {
        let mut map = HashMap::new();
        for bucket in buckets {
            map.insert(bucket.to_string(), HashMap::new());
        }

        Self {
            buckets: RwLock::new(map),
        }
    }

    /// Create a new bucket in the storage.
    pub async fn create_bucket(&self, bucket: String) {
        let mut buckets = self.buckets.write().await;
        buckets.entry(bucket).or_default();
    }
}

fn lookup<'b>(
    buckets: &'b HashMap<String, Bucket>,
    bucket: &str,
    remote: &Utf8Path,
) -> Result<&'b MemoryFileItem, StorageError> {
    buckets
        .get(bucket)
        .and_then(|items| items.get(remote))
        .ok_or_else(|| StorageError::not_found(ENGINE, bucket, remote.as_str()))
}

#[async_trait::async_trait]
impl Driver for MemoryStorage {
    fn name(&self) -> &'static str {
        ENGINE
    }

    fn scheme(&self) -> &str {
        "memory"
    }

    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        let buckets = self.buckets.read().await;
        Ok(lookup(&buckets, bucket, remote)?.into())
    }

    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
        let mut buckets = self.buckets.write().await;
        buckets
            .get_mut(bucket)
            .and_then(|items| items.remove(remote))
            .map(|_| ())
            .ok_or_else(|| StorageError::not_found(ENGINE, bucket, remote.as_str()))
    }

    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Reader<'_>,
    ) -> Result<(), StorageError> {
        let mut buf = Vec::new();

        tokio::io::copy(local, &mut buf)
            .await
            .map_err(|err| StorageError::io(ENGINE, err).at(bucket, remote.as_str()))?;

        let mut buckets = self.buckets.write().await;
        let bucket_map = buckets.entry(bucket.to_string()).or_default();
        bucket_map.insert(remote.to_owned(), buf.into());

        Ok(())
    }

    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Writer<'_>,
    ) -> Result<(), StorageError> {
        // Clone out so the lock is not held across the writer's await points.
        let item = {
            let buckets = self.buckets.read().await;
            lookup(&buckets, bucket, remote)?.clone()
        };

        let mut buf = item.as_ref();
        tokio::io::copy(&mut buf, local)
            .await
            .map_err(|err| StorageError::io(ENGINE, err).at(bucket, remote.as_str()))?;

        local
            .flush()
            .await
            .map_err(|err| StorageError::io(ENGINE, err).at(bucket, remote.as_str()))?;

        Ok(())
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError> {
        tracing::trace!(%bucket, ?prefix, "list memory bucket");

        let buckets = self.buckets.read().await;
        let Some(bucket_map) = buckets.get(bucket) else {
            return Ok(Vec::new());
        };

        let mut paths: Vec<String> = bucket_map
            .keys()
            .filter(|path| prefix.is_none_or(|prefix| path.starts_with(prefix)))
            .map(|path| path.to_string())
            .collect();
        paths.sort();

        Ok(paths)
    }

    async fn copy(&self, bucket: &str, from: &Utf8Path, to: &Utf8Path) -> Result<(), StorageError> {
        let mut buckets = self.buckets.write().await;
        let data = lookup(&buckets, bucket, from)?.data.clone();
        buckets
            .entry(bucket.to_string())
            .or_default()
            .insert(to.to_owned(), data.into());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_objects_are_not_found() {
        let storage = MemoryStorage::with_buckets(&["pkgstore"]);

        let err = storage
            .metadata("pkgstore", Utf8Path::new("npm/nothing"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        let err = storage
            .delete("other", Utf8Path::new("npm/nothing"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn list_filters_by_prefix() {
        let storage = MemoryStorage::new();
        for key in ["npm/a", "npm/b", "pypi/c", "npmx/d"] {
            let mut reader: &[u8] = b"x";
            storage
                .upload("pkgstore", Utf8Path::new(key), &mut reader)
                .await
                .unwrap();
        }

        let keys = storage
            .list("pkgstore", Some(Utf8Path::new("npm")))
            .await
            .unwrap();
        assert_eq!(keys, vec!["npm/a".to_owned(), "npm/b".to_owned()]);

        assert!(storage.list("empty", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn upload_replaces_contents() {
        let storage = MemoryStorage::new();
        let key = Utf8Path::new("container/blob");

        let mut first: &[u8] = b"hello";
        storage.upload("b", key, &mut first).await.unwrap();
        let mut second: &[u8] = b"hi";
        storage.upload("b", key, &mut second).await.unwrap();

        let mut out = Vec::new();
        storage.download("b", key, &mut out).await.unwrap();
        assert_eq!(out, b"hi");
    }
}
