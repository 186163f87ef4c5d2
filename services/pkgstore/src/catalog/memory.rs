use std::collections::{BTreeMap, HashSet};

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{
    Asset, Catalog, CatalogError, CatalogResult, Ecosystem, NewAsset, NewVersion, Package,
    PackageVersion,
};
use crate::digest::Digest;

/// Every catalog row. Serialized as a whole by [`super::JsonCatalog`].
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub(crate) struct Tables {
    next_id: u64,
    packages: BTreeMap<u64, Package>,
    versions: BTreeMap<u64, PackageVersion>,
    assets: BTreeMap<u64, Asset>,
}

impl Tables {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Catalog held entirely in process memory.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    tables: RwLock<Tables>,
}

impl MemoryCatalog {
    /// An empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_tables(tables: Tables) -> Self {
        Self {
            tables: RwLock::new(tables),
        }
    }

    pub(crate) fn snapshot(&self) -> CatalogResult<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(&*self.tables.read())?)
    }

    pub(crate) fn tables(&self) -> Tables {
        self.tables.read().clone()
    }

    pub(crate) fn replace(&self, tables: Tables) {
        *self.tables.write() = tables;
    }

    pub(crate) fn into_tables(self) -> Tables {
        self.tables.into_inner()
    }
}

#[async_trait::async_trait]
impl Catalog for MemoryCatalog {
    async fn find_package(
        &self,
        ecosystem: Ecosystem,
        name: &str,
    ) -> CatalogResult<Option<Package>> {
        let tables = self.tables.read();
        Ok(tables
            .packages
            .values()
            .find(|p| p.ecosystem == ecosystem && p.name == name)
            .cloned())
    }

    async fn package(&self, id: u64) -> CatalogResult<Option<Package>> {
        Ok(self.tables.read().packages.get(&id).cloned())
    }

    async fn create_package(
        &self,
        ecosystem: Ecosystem,
        name: &str,
        owner: &str,
    ) -> CatalogResult<Package> {
        let mut tables = self.tables.write();
        if tables
            .packages
            .values()
            .any(|p| p.ecosystem == ecosystem && p.name == name)
        {
            return Err(CatalogError::conflict(
                "package",
                format!("{ecosystem}/{name}"),
            ));
        }

        let now = Utc::now();
        let package = Package {
            id: tables.allocate_id(),
            name: name.to_owned(),
            ecosystem,
            owner: owner.to_owned(),
            latest_version: None,
            created_at: now,
            updated_at: now,
        };
        tables.packages.insert(package.id, package.clone());
        Ok(package)
    }

    async fn set_latest_version(
        &self,
        package_id: u64,
        version: Option<&str>,
    ) -> CatalogResult<()> {
        let mut tables = self.tables.write();
        let package = tables
            .packages
            .get_mut(&package_id)
            .ok_or_else(|| CatalogError::not_found("package", package_id))?;
        package.latest_version = version.map(str::to_owned);
        package.updated_at = Utc::now();
        Ok(())
    }

    async fn delete_package(&self, id: u64) -> CatalogResult<()> {
        let mut tables = self.tables.write();
        tables
            .packages
            .remove(&id)
            .ok_or_else(|| CatalogError::not_found("package", id))?;
        tables.versions.retain(|_, v| v.package_id != id);
        Ok(())
    }

    async fn list_packages(&self) -> CatalogResult<Vec<Package>> {
        Ok(self.tables.read().packages.values().cloned().collect())
    }

    async fn versions(&self, package_id: u64) -> CatalogResult<Vec<PackageVersion>> {
        Ok(self
            .tables
            .read()
            .versions
            .values()
            .filter(|v| v.package_id == package_id)
            .cloned()
            .collect())
    }

    async fn find_version(
        &self,
        package_id: u64,
        version: &str,
    ) -> CatalogResult<Option<PackageVersion>> {
        Ok(self
            .tables
            .read()
            .versions
            .values()
            .find(|v| v.package_id == package_id && v.version == version)
            .cloned())
    }

    async fn find_version_by_tag(
        &self,
        package_id: u64,
        tag: &str,
    ) -> CatalogResult<Option<PackageVersion>> {
        Ok(self
            .tables
            .read()
            .versions
            .values()
            .find(|v| v.package_id == package_id && v.tag.as_deref() == Some(tag))
            .cloned())
    }

    async fn save_version(
        &self,
        package_id: u64,
        version: NewVersion,
    ) -> CatalogResult<PackageVersion> {
        let mut tables = self.tables.write();
        let now = Utc::now();

        let ecosystem = {
            let package = tables
                .packages
                .get_mut(&package_id)
                .ok_or_else(|| CatalogError::not_found("package", package_id))?;
            package.updated_at = now;
            package.ecosystem
        };

        if let Some(tag) = &version.tag {
            for other in tables.versions.values_mut() {
                if other.package_id == package_id
                    && other.version != version.version
                    && other.tag.as_deref() == Some(tag.as_str())
                {
                    tracing::debug!(%tag, from = %other.version, to = %version.version, "Moving tag");
                    other.tag = None;
                    other.updated_at = now;
                }
            }
        }

        let existing = tables
            .versions
            .values_mut()
            .find(|v| v.package_id == package_id && v.version == version.version);

        if let Some(row) = existing {
            row.tag = version.tag;
            row.digests = version.digests;
            row.metadata = version.metadata;
            row.updated_at = now;
            return Ok(row.clone());
        }

        let row = PackageVersion {
            id: tables.allocate_id(),
            package_id,
            ecosystem,
            version: version.version,
            tag: version.tag,
            digests: version.digests,
            metadata: version.metadata,
            created_at: now,
            updated_at: now,
        };
        tables.versions.insert(row.id, row.clone());
        Ok(row)
    }

    async fn delete_version(&self, package_id: u64, version_id: u64) -> CatalogResult<()> {
        let mut tables = self.tables.write();
        match tables.versions.get(&version_id) {
            Some(row) if row.package_id == package_id => {
                tables.versions.remove(&version_id);
                Ok(())
            }
            _ => Err(CatalogError::not_found("version", version_id)),
        }
    }

    async fn referenced_digests(&self) -> CatalogResult<HashSet<Digest>> {
        Ok(self
            .tables
            .read()
            .versions
            .values()
            .flat_map(|v| v.digests.iter().copied())
            .collect())
    }

    async fn insert_asset(&self, asset: NewAsset) -> CatalogResult<Asset> {
        let mut tables = self.tables.write();
        if let Some(existing) = tables.assets.values().find(|a| a.digest == asset.digest) {
            tracing::trace!(digest = %asset.digest, "Asset already registered");
            return Ok(existing.clone());
        }

        let now = Utc::now();
        let row = Asset {
            id: tables.allocate_id(),
            digest: asset.digest,
            size: asset.size,
            session: asset.session,
            ecosystem: asset.ecosystem,
            state: asset.state,
            created_at: now,
            updated_at: now,
        };
        tables.assets.insert(row.id, row.clone());
        Ok(row)
    }

    async fn asset_by_digest(&self, digest: &Digest) -> CatalogResult<Option<Asset>> {
        Ok(self
            .tables
            .read()
            .assets
            .values()
            .find(|a| &a.digest == digest)
            .cloned())
    }

    async fn asset_by_session(&self, session: Uuid) -> CatalogResult<Option<Asset>> {
        Ok(self
            .tables
            .read()
            .assets
            .values()
            .find(|a| a.session == session)
            .cloned())
    }

    async fn update_asset(&self, asset: &Asset) -> CatalogResult<Asset> {
        let mut tables = self.tables.write();
        if !tables.assets.contains_key(&asset.id) {
            return Err(CatalogError::not_found("asset", asset.id));
        }
        if tables
            .assets
            .values()
            .any(|a| a.id != asset.id && a.digest == asset.digest)
        {
            return Err(CatalogError::conflict("asset", asset.digest));
        }

        let mut row = asset.clone();
        row.updated_at = Utc::now();
        tables.assets.insert(row.id, row.clone());
        Ok(row)
    }

    async fn delete_asset(&self, id: u64) -> CatalogResult<()> {
        self.tables
            .write()
            .assets
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| CatalogError::not_found("asset", id))
    }

    async fn assets(&self) -> CatalogResult<Vec<Asset>> {
        Ok(self.tables.read().assets.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{AssetState, VersionMetadata};

    fn npm_version(version: &str, tag: Option<&str>) -> NewVersion {
        NewVersion {
            version: version.to_owned(),
            tag: tag.map(str::to_owned),
            digests: vec![Digest::of(version.as_bytes())],
            metadata: VersionMetadata::Npm(serde_json::json!({ "version": version })),
        }
    }

    #[tokio::test]
    async fn package_names_are_unique_per_ecosystem() {
        let catalog = MemoryCatalog::new();
        let npm = catalog
            .create_package(Ecosystem::Npm, "requests", "alice")
            .await
            .unwrap();
        catalog
            .create_package(Ecosystem::Pypi, "requests", "bob")
            .await
            .unwrap();

        let err = catalog
            .create_package(Ecosystem::Npm, "requests", "carol")
            .await
            .unwrap_err();
        assert!(matches!(err, CatalogError::Conflict { .. }));

        let found = catalog
            .find_or_create_package(Ecosystem::Npm, "requests", "carol")
            .await
            .unwrap();
        assert_eq!(found.id, npm.id);
        assert_eq!(found.owner, "alice");
    }

    #[tokio::test]
    async fn save_version_upserts_and_moves_tags() {
        let catalog = MemoryCatalog::new();
        let package = catalog
            .create_package(Ecosystem::Npm, "left-pad", "alice")
            .await
            .unwrap();

        let first = catalog
            .save_version(package.id, npm_version("1.0.0", Some("latest")))
            .await
            .unwrap();
        let second = catalog
            .save_version(package.id, npm_version("1.1.0", Some("latest")))
            .await
            .unwrap();

        let first = catalog
            .find_version(package.id, &first.version)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.tag, None);

        let tagged = catalog
            .find_version_by_tag(package.id, "latest")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tagged.id, second.id);

        let republished = catalog
            .save_version(package.id, npm_version("1.1.0", Some("next")))
            .await
            .unwrap();
        assert_eq!(republished.id, second.id);
        assert_eq!(catalog.versions(package.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn delete_package_cascades() {
        let catalog = MemoryCatalog::new();
        let package = catalog
            .create_package(Ecosystem::Npm, "left-pad", "alice")
            .await
            .unwrap();
        catalog
            .save_version(package.id, npm_version("1.0.0", None))
            .await
            .unwrap();

        catalog.delete_package(package.id).await.unwrap();
        assert!(catalog.versions(package.id).await.unwrap().is_empty());
        assert!(catalog.referenced_digests().await.unwrap().is_empty());
        assert!(matches!(
            catalog.delete_package(package.id).await,
            Err(CatalogError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn assets_are_unique_by_digest() {
        let catalog = MemoryCatalog::new();
        let digest = Digest::of(b"layer");
        let new = |session| NewAsset {
            digest,
            size: 5,
            session,
            ecosystem: Ecosystem::Container,
            state: AssetState::Finalized,
        };

        let first = catalog.insert_asset(new(Uuid::new_v4())).await.unwrap();
        let second = catalog.insert_asset(new(Uuid::new_v4())).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(catalog.assets().await.unwrap().len(), 1);

        let mut placeholder = catalog
            .insert_asset(NewAsset {
                digest: Digest::random(),
                size: 0,
                session: Uuid::new_v4(),
                ecosystem: Ecosystem::Container,
                state: AssetState::Open,
            })
            .await
            .unwrap();
        placeholder.digest = digest;
        assert!(matches!(
            catalog.update_asset(&placeholder).await,
            Err(CatalogError::Conflict { .. })
        ));
    }
}
