//! A catalog that can be told to fail or stall, for exercising error paths.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use uuid::Uuid;

use super::{
    Asset, Catalog, CatalogError, CatalogResult, Ecosystem, MemoryCatalog, NewAsset, NewVersion,
    Package, PackageVersion,
};
use crate::digest::Digest;

/// Handshake for a paused `assets` read.
#[derive(Debug, Clone, Default)]
pub(crate) struct Pause {
    /// Signalled once the read has started.
    pub reached: Arc<Notify>,
    /// Lets the read continue.
    pub release: Arc<Notify>,
}

/// Delegates to a [`MemoryCatalog`], failing the named write operations.
#[derive(Debug, Default)]
pub(crate) struct FaultyCatalog {
    inner: MemoryCatalog,
    failing: Mutex<HashSet<&'static str>>,
    pause: Mutex<Option<Pause>>,
}

impl FaultyCatalog {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Make `operation` return an I/O error until [`FaultyCatalog::recover`].
    pub(crate) fn fail(&self, operation: &'static str) {
        self.failing.lock().insert(operation);
    }

    pub(crate) fn recover(&self) {
        self.failing.lock().clear();
    }

    /// Hold the next `assets` call until released.
    pub(crate) fn pause_next_assets(&self) -> Pause {
        let pause = Pause::default();
        *self.pause.lock() = Some(pause.clone());
        pause
    }

    fn check(&self, operation: &'static str) -> CatalogResult<()> {
        if self.failing.lock().contains(operation) {
            return Err(CatalogError::Io {
                path: "faulty-catalog.json".into(),
                source: std::io::Error::other(format!("{operation} failed")),
            });
        }
        Ok(())
    }

    async fn wait_for_release(&self) {
        let pause = self.pause.lock().take();
        if let Some(pause) = pause {
            pause.reached.notify_one();
            pause.release.notified().await;
        }
    }
}

#[async_trait::async_trait]
impl Catalog for FaultyCatalog {
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
        self.check("create_package")?;
        self.inner.create_package(ecosystem, name, owner).await
    }

    async fn set_latest_version(
        &self,
        package_id: u64,
        version: Option<&str>,
    ) -> CatalogResult<()> {
        self.check("set_latest_version")?;
        self.inner.set_latest_version(package_id, version).await
    }

    async fn delete_package(&self, id: u64) -> CatalogResult<()> {
        self.check("delete_package")?;
        self.inner.delete_package(id).await
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
        self.check("save_version")?;
        self.inner.save_version(package_id, version).await
    }

    async fn delete_version(&self, package_id: u64, version_id: u64) -> CatalogResult<()> {
        self.check("delete_version")?;
        self.inner.delete_version(package_id, version_id).await
    }

    async fn referenced_digests(&self) -> CatalogResult<HashSet<Digest>> {
        self.inner.referenced_digests().await
    }

    async fn insert_asset(&self, asset: NewAsset) -> CatalogResult<Asset> {
        self.check("insert_asset")?;
        self.inner.insert_asset(asset).await
    }

    async fn asset_by_digest(&self, digest: &Digest) -> CatalogResult<Option<Asset>> {
        self.inner.asset_by_digest(digest).await
    }

    async fn asset_by_session(&self, session: Uuid) -> CatalogResult<Option<Asset>> {
        self.inner.asset_by_session(session).await
    }

    async fn update_asset(&self, asset: &Asset) -> CatalogResult<Asset> {
        self.check("update_asset")?;
        self.inner.update_asset(asset).await
    }

    async fn delete_asset(&self, id: u64) -> CatalogResult<()> {
        self.check("delete_asset")?;
        self.inner.delete_asset(id).await
    }

    async fn assets(&self) -> CatalogResult<Vec<Asset>> {
        self.wait_for_release().await;
        self.inner.assets().await
    }
}
