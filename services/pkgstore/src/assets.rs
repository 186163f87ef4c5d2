//! Content-addressed blob storage

use std::sync::Arc;

use bytes::Bytes;
use camino::Utf8PathBuf;
use storage::StorageBucket;
use uuid::Uuid;

use crate::catalog::{Asset, AssetState, Catalog, Ecosystem, NewAsset};
use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};

/// Path of a finalized blob.
pub fn blob_path(ecosystem: Ecosystem, digest: &Digest) -> Utf8PathBuf {
    Utf8PathBuf::from(format!("{}/{}", ecosystem, digest.hex()))
}

/// Path of the bytes of an in-flight upload.
pub fn session_path(ecosystem: Ecosystem, session: Uuid) -> Utf8PathBuf {
    Utf8PathBuf::from(format!("{ecosystem}/{session}"))
}

/// Result of [`AssetStore::put`].
#[derive(Debug, Clone)]
pub struct Stored {
    /// The catalog row for the blob.
    pub asset: Asset,
    /// Whether this call wrote the bytes, as opposed to finding them already stored.
    pub fresh: bool,
    /// Whether this call created the row. A digest first stored by another
    /// ecosystem already has one.
    pub inserted: bool,
}

/// Couples the storage bucket with the catalog's asset rows, so that a digest
/// never resolves to bytes that do not hash to it.
#[derive(Debug, Clone)]
pub struct AssetStore {
    bucket: StorageBucket,
    catalog: Arc<dyn Catalog>,
}

impl AssetStore {
    /// Create an asset store over a bucket and catalog.
    pub fn new(bucket: StorageBucket, catalog: Arc<dyn Catalog>) -> Self {
        Self { bucket, catalog }
    }

    /// The underlying bucket.
    pub fn bucket(&self) -> &StorageBucket {
        &self.bucket
    }

    /// The catalog holding asset rows.
    pub fn catalog(&self) -> &Arc<dyn Catalog> {
        &self.catalog
    }

    /// Store `data`, verifying it against `expected` first.
    ///
    /// Identical content is written once; later calls register nothing new and
    /// return the same digest.
    #[tracing::instrument(skip(self, data), fields(size = data.len()))]
    pub async fn put(
        &self,
        ecosystem: Ecosystem,
        data: Bytes,
        expected: Option<&Digest>,
    ) -> RegistryResult<Stored> {
        let digest = Digest::of(&data);
        check_digest(expected, &digest)?;

        let path = blob_path(ecosystem, &digest);
        let fresh = !self.bucket.exists(&path).await?;
        if fresh {
            self.bucket.put(&path, &data).await?;
            tracing::debug!(%digest, "Stored new blob");
        }

        let session = Uuid::new_v4();
        let registered = self
            .catalog
            .insert_asset(NewAsset {
                digest,
                size: data.len() as u64,
                session,
                ecosystem,
                state: AssetState::Finalized,
            })
            .await;

        match registered {
            Ok(asset) => {
                // An existing row keeps its own session id.
                let inserted = asset.session == session;
                Ok(Stored {
                    asset,
                    fresh,
                    inserted,
                })
            }
            Err(error) => {
                if fresh {
                    self.remove_blob(ecosystem, &digest).await;
                }
                Err(error.into())
            }
        }
    }

    /// Read a finalized blob.
    pub async fn get(&self, ecosystem: Ecosystem, digest: &Digest) -> RegistryResult<Bytes> {
        self.bucket
            .get(&blob_path(ecosystem, digest))
            .await?
            .ok_or_else(|| RegistryError::BlobNotFound(digest.oci()))
    }

    /// Whether a finalized blob is stored.
    pub async fn exists(&self, ecosystem: Ecosystem, digest: &Digest) -> RegistryResult<bool> {
        Ok(self.bucket.exists(&blob_path(ecosystem, digest)).await?)
    }

    /// The finalized catalog row for a digest, if any.
    pub async fn stat(&self, digest: &Digest) -> RegistryResult<Option<Asset>> {
        let asset = self.catalog.asset_by_digest(digest).await?;
        Ok(asset.filter(|asset| asset.state == AssetState::Finalized))
    }

    /// Undo what [`AssetStore::put`] created after a later step failed.
    ///
    /// Only bytes and rows written by that call are removed. Failures are
    /// logged, the caller is already reporting the original error.
    pub(crate) async fn discard(&self, ecosystem: Ecosystem, stored: &Stored) {
        if stored.fresh {
            self.remove_blob(ecosystem, &stored.asset.digest).await;
        }
        if !stored.inserted {
            return;
        }
        if let Err(error) = self.catalog.delete_asset(stored.asset.id).await {
            let digest = &stored.asset.digest;
            tracing::warn!(%digest, %error, "Failed to roll back asset row");
        }
    }

    pub(crate) async fn remove_blob(&self, ecosystem: Ecosystem, digest: &Digest) {
        match self.bucket.delete(&blob_path(ecosystem, digest)).await {
            Ok(()) => tracing::debug!(%digest, "Rolled back blob"),
            Err(error) if error.is_not_found() => {}
            Err(error) => tracing::warn!(%digest, %error, "Failed to roll back blob"),
        }
    }
}

pub(crate) fn check_digest(expected: Option<&Digest>, actual: &Digest) -> RegistryResult<()> {
    match expected {
        Some(expected) if expected != actual => Err(RegistryError::DigestMismatch {
            expected: expected.oci(),
            actual: actual.oci(),
        }),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use camino::Utf8Path;
    use storage::{MemoryStorage, Storage};

    use super::*;
    use crate::catalog::MemoryCatalog;
    use crate::catalog::testing::FaultyCatalog;

    fn store() -> AssetStore {
        let storage = Storage::new(MemoryStorage::new());
        AssetStore::new(storage.bucket("pkgstore"), Arc::new(MemoryCatalog::new()))
    }

    #[test]
    fn paths() {
        let digest = Digest::of(b"helloworld");
        assert_eq!(
            blob_path(Ecosystem::Container, &digest),
            format!("container/{}", digest.hex())
        );

        let session = Uuid::nil();
        assert_eq!(
            session_path(Ecosystem::Npm, session),
            "npm/00000000-0000-0000-0000-000000000000"
        );
    }

    #[tokio::test]
    async fn put_deduplicates() {
        let store = store();
        let first = store
            .put(Ecosystem::Npm, Bytes::from_static(b"tarball"), None)
            .await
            .unwrap();
        let second = store
            .put(Ecosystem::Npm, Bytes::from_static(b"tarball"), None)
            .await
            .unwrap();

        assert!(first.fresh);
        assert!(!second.fresh);
        assert_eq!(first.asset.id, second.asset.id);
        assert_eq!(first.asset.digest, Digest::of(b"tarball"));

        let keys = store.bucket().list(Some(Utf8Path::new("npm"))).await.unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(store.catalog().assets().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn put_rejects_mismatch_before_writing() {
        let store = store();
        let wrong = Digest::of(b"something else");
        let error = store
            .put(Ecosystem::Pypi, Bytes::from_static(b"wheel"), Some(&wrong))
            .await
            .unwrap_err();

        assert!(matches!(error, RegistryError::DigestMismatch { .. }));
        assert!(!store.exists(Ecosystem::Pypi, &Digest::of(b"wheel")).await.unwrap());
        assert!(!store.exists(Ecosystem::Pypi, &wrong).await.unwrap());
    }

    #[tokio::test]
    async fn get_missing_blob() {
        let store = store();
        let error = store
            .get(Ecosystem::Container, &Digest::of(b"absent"))
            .await
            .unwrap_err();
        assert!(matches!(error, RegistryError::BlobNotFound(_)));
    }

    #[tokio::test]
    async fn failed_registration_removes_blob() {
        let storage = Storage::new(MemoryStorage::new());
        let catalog = Arc::new(FaultyCatalog::new());
        let store = AssetStore::new(storage.bucket("pkgstore"), catalog.clone());

        catalog.fail("insert_asset");
        let error = store
            .put(Ecosystem::Npm, Bytes::from_static(b"tarball"), None)
            .await
            .unwrap_err();
        assert!(matches!(error, RegistryError::Catalog(_)));
        assert!(!store.exists(Ecosystem::Npm, &Digest::of(b"tarball")).await.unwrap());
    }

    #[tokio::test]
    async fn discard_leaves_rows_owned_by_another_ecosystem() {
        let store = store();
        let wheel = store
            .put(Ecosystem::Pypi, Bytes::from_static(b"shared"), None)
            .await
            .unwrap();
        let tarball = store
            .put(Ecosystem::Npm, Bytes::from_static(b"shared"), None)
            .await
            .unwrap();

        assert!(wheel.fresh && wheel.inserted);
        assert!(tarball.fresh && !tarball.inserted);
        assert_eq!(wheel.asset.id, tarball.asset.id);

        let digest = Digest::of(b"shared");
        store.discard(Ecosystem::Npm, &tarball).await;
        assert!(!store.exists(Ecosystem::Npm, &digest).await.unwrap());
        assert!(store.exists(Ecosystem::Pypi, &digest).await.unwrap());
        assert!(store.stat(&digest).await.unwrap().is_some());

        store.discard(Ecosystem::Pypi, &wheel).await;
        assert!(!store.exists(Ecosystem::Pypi, &digest).await.unwrap());
        assert!(store.stat(&digest).await.unwrap().is_none());
    }
}
