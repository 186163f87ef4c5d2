use std::collections::HashSet;

use camino::{Utf8Path, Utf8PathBuf};
use uuid::Uuid;

use super::memory::{MemoryCatalog, Tables};
use super::{
    Asset, Catalog, CatalogError, CatalogResult, Ecosystem, NewAsset, NewVersion, Package,
    PackageVersion,
};
use crate::digest::Digest;

/// Catalog persisted as a JSON snapshot, rewritten after every mutation.
///
/// Reads are served from memory. Each write reloads the file, applies the
/// change to that copy and renames the new snapshot into place before the
/// in-memory tables are swapped, so a failed write leaves both untouched.
/// Reloading keeps rows deleted by `pkgstore cleanup` from being written
/// back. Reads may lag such a change until the next write, and two processes
/// writing at the same moment can still lose one update.
#[derive(Debug)]
pub struct JsonCatalog {
    path: Utf8PathBuf,
    inner: MemoryCatalog,
    write: tokio::sync::Mutex<()>,
}

/// A write in progress, holding the write lock.
struct Pending<'c> {
    catalog: &'c JsonCatalog,
    scratch: MemoryCatalog,
    guard: tokio::sync::MutexGuard<'c, ()>,
}

impl JsonCatalog {
    /// Load the snapshot at `path`, starting empty if it does not exist yet.
    #[tracing::instrument]
    pub async fn open(path: Utf8PathBuf) -> CatalogResult<Self> {
        let tables = match load(&path).await? {
            Some(tables) => tables,
            None => {
                tracing::info!(%path, "Starting with an empty catalog");
                Tables::default()
            }
        };

        Ok(Self {
            path,
            inner: MemoryCatalog::from_tables(tables),
            write: tokio::sync::Mutex::new(()),
        })
    }

    /// Location of the snapshot file.
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Start a write against the newest snapshot on disk.
    async fn begin(&self) -> CatalogResult<Pending<'_>> {
        let guard = self.write.lock().await;
        let tables = match load(&self.path).await? {
            Some(tables) => tables,
            None => self.inner.tables(),
        };

        Ok(Pending {
            catalog: self,
            scratch: MemoryCatalog::from_tables(tables),
            guard,
        })
    }
}

impl Pending<'_> {
    /// Persist the scratch tables, then make them current.
    async fn commit(self) -> CatalogResult<()> {
        let Pending {
            catalog,
            scratch,
            guard,
        } = self;
        let path = &catalog.path;

        let snapshot = scratch.snapshot()?;
        let io = |source: std::io::Error| CatalogError::Io {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(io)?;
        }

        let staging = path.with_extension("json.tmp");
        tokio::fs::write(&staging, snapshot).await.map_err(io)?;
        tokio::fs::rename(&staging, path).await.map_err(io)?;

        catalog.inner.replace(scratch.into_tables());
        drop(guard);
        tracing::trace!(%path, "Catalog persisted");
        Ok(())
    }
}

async fn load(path: &Utf8Path) -> CatalogResult<Option<Tables>> {
    match tokio::fs::read(path).await {
        Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(CatalogError::Io {
            path: path.to_owned(),
            source,
        }),
    }
}

#[async_trait::async_trait]
impl Catalog for JsonCatalog {
    async fn find_package(
        &self,
        ecosystem: Ecosystem,
        name: &str,
    ) -> CatalogResult<Option<Package>> {
        self.inner.find_package(ecosystem, name).await
    }

    async fn package(&self, id: u64) -> CatalogResult<Option<Package>> {
        self.inner.package(id).await
    }

    async fn create_package(
        &self,
        ecosystem: Ecosystem,
        name: &str,
        owner: &str,
    ) -> CatalogResult<Package> {
        let pending = self.begin().await?;
        let package = pending.scratch.create_package(ecosystem, name, owner).await?;
        pending.commit().await?;
        Ok(package)
    }

    async fn set_latest_version(
        &self,
        package_id: u64,
        version: Option<&str>,
    ) -> CatalogResult<()> {
        let pending = self.begin().await?;
        pending.scratch.set_latest_version(package_id, version).await?;
        pending.commit().await
    }

    async fn delete_package(&self, id: u64) -> CatalogResult<()> {
        let pending = self.begin().await?;
        pending.scratch.delete_package(id).await?;
        pending.commit().await
    }

    async fn list_packages(&self) -> CatalogResult<Vec<Package>> {
        self.inner.list_packages().await
    }

    async fn versions(&self, package_id: u64) -> CatalogResult<Vec<PackageVersion>> {
        self.inner.versions(package_id).await
    }

    async fn find_version(
        &self,
        package_id: u64,
        version: &str,
    ) -> CatalogResult<Option<PackageVersion>> {
        self.inner.find_version(package_id, version).await
    }

    async fn find_version_by_tag(
        &self,
        package_id: u64,
        tag: &str,
    ) -> CatalogResult<Option<PackageVersion>> {
        self.inner.find_version_by_tag(package_id, tag).await
    }

    async fn save_version(
        &self,
        package_id: u64,
        version: NewVersion,
    ) -> CatalogResult<PackageVersion> {
        let pending = self.begin().await?;
        let row = pending.scratch.save_version(package_id, version).await?;
        pending.commit().await?;
        Ok(row)
    }

    async fn delete_version(&self, package_id: u64, version_id: u64) -> CatalogResult<()> {
        let pending = self.begin().await?;
        pending.scratch.delete_version(package_id, version_id).await?;
        pending.commit().await
    }

    async fn referenced_digests(&self) -> CatalogResult<HashSet<Digest>> {
        self.inner.referenced_digests().await
    }

    async fn insert_asset(&self, asset: NewAsset) -> CatalogResult<Asset> {
        let pending = self.begin().await?;
        let row = pending.scratch.insert_asset(asset).await?;
        pending.commit().await?;
        Ok(row)
    }

    async fn asset_by_digest(&self, digest: &Digest) -> CatalogResult<Option<Asset>> {
        self.inner.asset_by_digest(digest).await
    }

    async fn asset_by_session(&self, session: Uuid) -> CatalogResult<Option<Asset>> {
        self.inner.asset_by_session(session).await
    }

    async fn update_asset(&self, asset: &Asset) -> CatalogResult<Asset> {
        let pending = self.begin().await?;
        let row = pending.scratch.update_asset(asset).await?;
        pending.commit().await?;
        Ok(row)
    }

    async fn delete_asset(&self, id: u64) -> CatalogResult<()> {
        let pending = self.begin().await?;
        pending.scratch.delete_asset(id).await?;
        pending.commit().await
    }

    async fn assets(&self) -> CatalogResult<Vec<Asset>> {
        self.inner.assets().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{AssetState, PypiFile, PypiMetadata, VersionMetadata};

    #[tokio::test]
    async fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("state/catalog.json")).unwrap();

        let digest = Digest::of(b"wheel");
        {
            let catalog = JsonCatalog::open(path.clone()).await.unwrap();
            let package = catalog
                .create_package(Ecosystem::Pypi, "pkg", "alice")
                .await
                .unwrap();
            catalog
                .save_version(
                    package.id,
                    NewVersion {
                        version: "1.0".into(),
                        tag: None,
                        digests: vec![digest],
                        metadata: VersionMetadata::Pypi(PypiMetadata {
                            requires_python: Some(">=3.8".into()),
                            files: vec![PypiFile {
                                filename: "pkg-1.0.tar.gz".into(),
                                digest,
                                size: 5,
                            }],
                        }),
                    },
                )
                .await
                .unwrap();
            catalog
                .insert_asset(NewAsset {
                    digest,
                    size: 5,
                    session: Uuid::new_v4(),
                    ecosystem: Ecosystem::Pypi,
                    state: AssetState::Finalized,
                })
                .await
                .unwrap();
        }

        let reopened = JsonCatalog::open(path).await.unwrap();
        let package = reopened
            .find_package(Ecosystem::Pypi, "pkg")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reopened.versions(package.id).await.unwrap().len(), 1);
        assert!(reopened.referenced_digests().await.unwrap().contains(&digest));
        assert!(reopened.asset_by_digest(&digest).await.unwrap().is_some());

        // Ids keep counting from where the snapshot left off.
        let other = reopened
            .create_package(Ecosystem::Npm, "other", "bob")
            .await
            .unwrap();
        assert!(other.id > package.id);
    }

    fn temp_catalog_path() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("catalog.json")).unwrap();
        (dir, path)
    }

    #[tokio::test]
    async fn failed_write_changes_nothing() {
        let (_dir, path) = temp_catalog_path();
        let catalog = JsonCatalog::open(path.clone()).await.unwrap();
        let package = catalog
            .create_package(Ecosystem::Npm, "left-pad", "alice")
            .await
            .unwrap();

        // The staging file cannot be written over a directory.
        let staging = path.with_extension("json.tmp");
        std::fs::create_dir(&staging).unwrap();

        let version = NewVersion {
            version: "1.0.0".into(),
            tag: Some("latest".into()),
            digests: vec![Digest::of(b"tarball")],
            metadata: VersionMetadata::Npm(serde_json::json!({})),
        };
        let error = catalog
            .save_version(package.id, version.clone())
            .await
            .unwrap_err();
        assert!(matches!(error, CatalogError::Io { .. }));
        assert!(catalog.versions(package.id).await.unwrap().is_empty());
        assert!(catalog.referenced_digests().await.unwrap().is_empty());

        let on_disk = JsonCatalog::open(path.clone()).await.unwrap();
        assert!(on_disk.versions(package.id).await.unwrap().is_empty());

        std::fs::remove_dir(&staging).unwrap();
        catalog.save_version(package.id, version).await.unwrap();
        assert_eq!(catalog.versions(package.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn writes_keep_rows_removed_by_another_process() {
        let (_dir, path) = temp_catalog_path();
        let server = JsonCatalog::open(path.clone()).await.unwrap();
        let digest = Digest::of(b"orphan");
        let asset = server
            .insert_asset(NewAsset {
                digest,
                size: 6,
                session: Uuid::new_v4(),
                ecosystem: Ecosystem::Container,
                state: AssetState::Finalized,
            })
            .await
            .unwrap();

        let cleanup = JsonCatalog::open(path.clone()).await.unwrap();
        cleanup.delete_asset(asset.id).await.unwrap();

        server
            .create_package(Ecosystem::Container, "app", "alice")
            .await
            .unwrap();
        assert!(server.asset_by_digest(&digest).await.unwrap().is_none());

        let reopened = JsonCatalog::open(path).await.unwrap();
        assert!(reopened.asset_by_digest(&digest).await.unwrap().is_none());
        assert!(
            reopened
                .find_package(Ecosystem::Container, "app")
                .await
                .unwrap()
                .is_some()
        );
    }
}
