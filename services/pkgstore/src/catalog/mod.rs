//! The catalog of packages, versions and stored assets.
//!
//! The catalog owns row lifecycles; blob bytes live in storage. The
//! [`Catalog`] trait is the seam, with an in-memory implementation for tests
//! and a JSON-file snapshot implementation for single-node deployments.

use std::collections::HashSet;
use std::fmt;

use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::digest::Digest;

mod json;
mod memory;
#[cfg(test)]
pub(crate) mod testing;

pub use json::JsonCatalog;
pub use memory::MemoryCatalog;

/// Result type for catalog operations
pub type CatalogResult<T> = Result<T, CatalogError>;

/// Error types for catalog operations
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    /// No row matched
    #[error("{entity} not found: {key}")]
    NotFound {
        /// Kind of row
        entity: &'static str,
        /// Lookup key
        key: String,
    },

    /// A uniqueness constraint was violated
    #[error("{entity} already exists: {key}")]
    Conflict {
        /// Kind of row
        entity: &'static str,
        /// Conflicting key
        key: String,
    },

    /// Reading or writing the backing file failed
    #[error("catalog I/O on {path}: {source}")]
    Io {
        /// File being accessed
        path: Utf8PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// The backing file could not be encoded or decoded
    #[error("catalog serialization: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CatalogError {
    pub(crate) fn not_found(entity: &'static str, key: impl fmt::Display) -> Self {
        CatalogError::NotFound {
            entity,
            key: key.to_string(),
        }
    }

    pub(crate) fn conflict(entity: &'static str, key: impl fmt::Display) -> Self {
        CatalogError::Conflict {
            entity,
            key: key.to_string(),
        }
    }
}

/// Package ecosystem, which doubles as the storage path prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ecosystem {
    /// npm tarballs
    Npm,
    /// PyPI wheels and sdists
    Pypi,
    /// OCI image blobs and manifests
    Container,
}

impl Ecosystem {
    /// Every ecosystem, in storage listing order.
    pub const ALL: [Ecosystem; 3] = [Ecosystem::Npm, Ecosystem::Pypi, Ecosystem::Container];

    /// Storage prefix and wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Ecosystem::Npm => "npm",
            Ecosystem::Pypi => "pypi",
            Ecosystem::Container => "container",
        }
    }
}

impl fmt::Display for Ecosystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named package in one ecosystem. `(name, ecosystem)` is unique.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Package {
    /// Row id.
    pub id: u64,
    /// Name as published, scoped names included.
    pub name: String,
    /// Ecosystem the package belongs to.
    pub ecosystem: Ecosystem,
    /// Principal that first published the package.
    pub owner: String,
    /// Version that `latest` resolves to.
    pub latest_version: Option<String>,
    /// When the row was created.
    pub created_at: DateTime<Utc>,
    /// When the row last changed.
    pub updated_at: DateTime<Utc>,
}

/// One published version of a package.
///
/// `(package_id, version)` and `(package_id, tag)` are each unique.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageVersion {
    /// Row id.
    pub id: u64,
    /// Owning package.
    pub package_id: u64,
    /// Ecosystem of the owning package.
    pub ecosystem: Ecosystem,
    /// Version string, or the manifest reference for images.
    pub version: String,
    /// Dist-tag or image tag pointing at this version.
    pub tag: Option<String>,
    /// Content digests of the blobs this version references.
    #[serde(with = "comma_separated")]
    pub digests: Vec<Digest>,
    /// Ecosystem-specific document.
    pub metadata: VersionMetadata,
    /// When the version was first published.
    pub created_at: DateTime<Utc>,
    /// When the version was last re-published.
    pub updated_at: DateTime<Utc>,
}

/// Ecosystem-specific version payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "ecosystem", content = "data", rename_all = "lowercase")]
pub enum VersionMetadata {
    /// The package.json-shaped version document.
    Npm(serde_json::Value),
    /// Distribution files uploaded for the version.
    Pypi(PypiMetadata),
    /// The manifest document, kept verbatim.
    Container(ContainerMetadata),
}

/// PyPI version payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PypiMetadata {
    /// `Requires-Python` from the most recent upload that set it.
    pub requires_python: Option<String>,
    /// Files in upload order.
    pub files: Vec<PypiFile>,
}

/// One wheel or sdist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PypiFile {
    /// Name the file was uploaded under.
    pub filename: String,
    /// Content digest of the file.
    pub digest: Digest,
    /// Length in bytes.
    pub size: u64,
}

/// OCI manifest payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerMetadata {
    /// Media type the manifest was pushed with.
    pub content_type: String,
    /// Digest of the manifest bytes themselves.
    pub digest: Digest,
    /// The manifest body.
    pub manifest: String,
}

/// Fields supplied when creating or re-publishing a version.
#[derive(Debug, Clone)]
pub struct NewVersion {
    /// Version string, unique within the package.
    pub version: String,
    /// Tag to move onto this version.
    pub tag: Option<String>,
    /// Blobs the version references.
    pub digests: Vec<Digest>,
    /// Ecosystem-specific document.
    pub metadata: VersionMetadata,
}

/// Lifecycle of an asset row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetState {
    /// Upload in progress, digest is a placeholder.
    Open,
    /// Bytes verified and stored at `{ecosystem}/{digest}`.
    Finalized,
}

/// A stored blob, or an upload that will become one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    /// Row id.
    pub id: u64,
    /// Content digest, or a random placeholder while the upload is open.
    pub digest: Digest,
    /// Bytes stored so far.
    pub size: u64,
    /// Upload session id, also the name of an open upload's bytes.
    pub session: Uuid,
    /// Ecosystem that first stored the blob.
    pub ecosystem: Ecosystem,
    /// Whether the upload is still in progress.
    pub state: AssetState,
    /// When the row was created.
    pub created_at: DateTime<Utc>,
    /// When the row last changed.
    pub updated_at: DateTime<Utc>,
}

/// Fields supplied when registering an asset.
#[derive(Debug, Clone)]
pub struct NewAsset {
    /// Content or placeholder digest.
    pub digest: Digest,
    /// Length in bytes.
    pub size: u64,
    /// Session id for the row.
    pub session: Uuid,
    /// Ecosystem storing the blob.
    pub ecosystem: Ecosystem,
    /// Initial state.
    pub state: AssetState,
}

/// Repository of catalog rows.
///
/// Implementations must be safe for concurrent use. Asset digests are unique,
/// and inserting an asset whose digest is already registered returns the
/// existing row rather than failing.
#[async_trait::async_trait]
pub trait Catalog: fmt::Debug + Send + Sync {
    /// Look a package up by ecosystem and name.
    async fn find_package(&self, ecosystem: Ecosystem, name: &str)
    -> CatalogResult<Option<Package>>;

    /// Look a package up by id.
    async fn package(&self, id: u64) -> CatalogResult<Option<Package>>;

    /// Create a package, failing with `Conflict` if the name is taken.
    async fn create_package(
        &self,
        ecosystem: Ecosystem,
        name: &str,
        owner: &str,
    ) -> CatalogResult<Package>;

    /// Record the version that `latest` resolves to.
    async fn set_latest_version(&self, package_id: u64, version: Option<&str>)
    -> CatalogResult<()>;

    /// Delete a package and all of its versions.
    async fn delete_package(&self, id: u64) -> CatalogResult<()>;

    /// All packages, ordered by id.
    async fn list_packages(&self) -> CatalogResult<Vec<Package>>;

    /// All versions of a package, ordered by id.
    async fn versions(&self, package_id: u64) -> CatalogResult<Vec<PackageVersion>>;

    /// Look a version up by its version string.
    async fn find_version(
        &self,
        package_id: u64,
        version: &str,
    ) -> CatalogResult<Option<PackageVersion>>;

    /// The version a tag currently points at.
    async fn find_version_by_tag(
        &self,
        package_id: u64,
        tag: &str,
    ) -> CatalogResult<Option<PackageVersion>>;

    /// Insert a version or update it in place.
    ///
    /// A tag held by another version of the package moves to this one.
    async fn save_version(&self, package_id: u64, version: NewVersion)
    -> CatalogResult<PackageVersion>;

    /// Delete one version. The package row is kept.
    async fn delete_version(&self, package_id: u64, version_id: u64) -> CatalogResult<()>;

    /// Union of every version's digests.
    async fn referenced_digests(&self) -> CatalogResult<HashSet<Digest>>;

    /// Register an asset, returning the existing row on a duplicate digest.
    async fn insert_asset(&self, asset: NewAsset) -> CatalogResult<Asset>;

    /// The asset row for a digest, in any state.
    async fn asset_by_digest(&self, digest: &Digest) -> CatalogResult<Option<Asset>>;

    /// The asset row created for an upload session.
    async fn asset_by_session(&self, session: Uuid) -> CatalogResult<Option<Asset>>;

    /// Replace an asset row by id. `Conflict` if the digest belongs to another row.
    async fn update_asset(&self, asset: &Asset) -> CatalogResult<Asset>;

    /// Delete an asset row. `NotFound` if it is already gone.
    async fn delete_asset(&self, id: u64) -> CatalogResult<()>;

    /// All asset rows, open uploads included.
    async fn assets(&self) -> CatalogResult<Vec<Asset>>;

    /// Find a package, creating it on first use.
    async fn find_or_create_package(
        &self,
        ecosystem: Ecosystem,
        name: &str,
        owner: &str,
    ) -> CatalogResult<Package> {
        if let Some(package) = self.find_package(ecosystem, name).await? {
            return Ok(package);
        }

        match self.create_package(ecosystem, name, owner).await {
            // Lost a creation race, the winner's row is fine.
            Err(CatalogError::Conflict { .. }) => self
                .find_package(ecosystem, name)
                .await?
                .ok_or_else(|| CatalogError::not_found("package", name)),
            other => other,
        }
    }
}

mod comma_separated {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::digest::Digest;

    #[allow(clippy::ptr_arg)]
    pub fn serialize<S: Serializer>(digests: &Vec<Digest>, serializer: S) -> Result<S::Ok, S::Error> {
        let joined = digests
            .iter()
            .map(Digest::hex)
            .collect::<Vec<_>>()
            .join(",");
        serializer.serialize_str(&joined)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Digest>, D::Error> {
        let joined = String::deserialize(deserializer)?;
        joined
            .split(',')
            .filter(|part| !part.is_empty())
            .map(|part| part.parse().map_err(D::Error::custom))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digests_persist_comma_joined() {
        let version = PackageVersion {
            id: 1,
            package_id: 1,
            ecosystem: Ecosystem::Npm,
            version: "1.0.0".into(),
            tag: None,
            digests: vec![Digest::of(b"a"), Digest::of(b"b")],
            metadata: VersionMetadata::Npm(serde_json::json!({"name": "left-pad"})),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        let value = serde_json::to_value(&version).unwrap();
        let joined = value["digests"].as_str().unwrap();
        assert_eq!(joined.split(',').count(), 2);
        assert_eq!(value["metadata"]["ecosystem"], "npm");

        let back: PackageVersion = serde_json::from_value(value).unwrap();
        assert_eq!(back, version);
    }

    #[test]
    fn ecosystem_prefixes() {
        let names: Vec<_> = Ecosystem::ALL.iter().map(Ecosystem::as_str).collect();
        assert_eq!(names, ["npm", "pypi", "container"]);
    }
}
