//! Garbage collection of unreferenced blobs and abandoned uploads.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use storage::StorageBucket;
use uuid::Uuid;

use crate::assets::blob_path;
use crate::catalog::{Asset, AssetState, Catalog, Ecosystem};
use crate::digest::Digest;
use crate::error::RegistryResult;

/// What a garbage entry's storage key encodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GarbageKind {
    /// A finalized blob no version references.
    Blob(Digest),
    /// Bytes left behind by an upload session that is no longer open.
    Session(Uuid),
    /// A catalog row whose blob has already gone from storage.
    CatalogOnly(Digest),
}

/// One item found by [`GarbageCollector::cleanup_assets`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Garbage {
    /// Ecosystem prefix the key lives under.
    pub ecosystem: Ecosystem,
    /// Storage key, present unless the entry is catalog-only.
    pub path: Option<Utf8PathBuf>,
    /// Whether the entry is a blob, session bytes or a bare catalog row.
    pub kind: GarbageKind,
    /// Catalog row removed along with the key.
    pub asset_id: Option<u64>,
}

impl fmt::Display for Garbage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            GarbageKind::Blob(digest) => write!(f, "blob {}/{}", self.ecosystem, digest),
            GarbageKind::Session(session) => write!(f, "session {}/{}", self.ecosystem, session),
            GarbageKind::CatalogOnly(digest) => {
                write!(f, "asset row {} ({})", digest, self.ecosystem)
            }
        }
    }
}

/// Sweeps storage against the catalog.
#[derive(Debug, Clone)]
pub struct GarbageCollector {
    bucket: StorageBucket,
    catalog: Arc<dyn Catalog>,
}

impl GarbageCollector {
    /// Create a collector over the registry's bucket and catalog.
    pub fn new(bucket: StorageBucket, catalog: Arc<dyn Catalog>) -> Self {
        Self { bucket, catalog }
    }

    /// Find, and unless `dry_run` is set delete, everything no version needs.
    ///
    /// Blobs referenced by any version are kept, as are the bytes and rows of
    /// open upload sessions. Keys that are neither a digest nor a session id
    /// are left alone.
    ///
    /// Storage is listed before the catalog is read. A session opened after
    /// the listing has no listed bytes, and one opened before it already has
    /// its row.
    #[tracing::instrument(skip(self))]
    pub async fn cleanup_assets(&self, dry_run: bool) -> RegistryResult<Vec<Garbage>> {
        let mut listings = Vec::with_capacity(Ecosystem::ALL.len());
        for ecosystem in Ecosystem::ALL {
            let keys = self
                .bucket
                .list(Some(Utf8Path::new(ecosystem.as_str())))
                .await?;
            listings.push((ecosystem, keys));
        }

        let referenced = self.catalog.referenced_digests().await?;
        let assets = self.catalog.assets().await?;

        let by_digest: HashMap<Digest, &Asset> =
            assets.iter().map(|asset| (asset.digest, asset)).collect();
        let open: HashSet<Uuid> = assets
            .iter()
            .filter(|asset| asset.state == AssetState::Open)
            .map(|asset| asset.session)
            .collect();

        let mut garbage = Vec::new();
        let mut stored = HashSet::new();
        let mut claimed = HashSet::new();

        for (ecosystem, keys) in listings {
            for key in keys {
                let Some(name) = key
                    .strip_prefix(ecosystem.as_str())
                    .and_then(|rest| rest.strip_prefix('/'))
                else {
                    continue;
                };

                if let Ok(digest) = name.parse::<Digest>() {
                    stored.insert(digest);
                    if referenced.contains(&digest) {
                        continue;
                    }
                    let asset_id = by_digest
                        .get(&digest)
                        .filter(|asset| asset.state == AssetState::Finalized)
                        .map(|asset| asset.id)
                        .filter(|id| claimed.insert(*id));
                    garbage.push(Garbage {
                        ecosystem,
                        path: Some(Utf8PathBuf::from(key)),
                        kind: GarbageKind::Blob(digest),
                        asset_id,
                    });
                } else if let Ok(session) = name.parse::<Uuid>() {
                    if open.contains(&session) {
                        continue;
                    }
                    garbage.push(Garbage {
                        ecosystem,
                        path: Some(Utf8PathBuf::from(key)),
                        kind: GarbageKind::Session(session),
                        asset_id: None,
                    });
                } else {
                    tracing::trace!(%key, "Skipping unrecognized key");
                }
            }
        }

        for asset in &assets {
            if asset.state != AssetState::Finalized
                || referenced.contains(&asset.digest)
                || stored.contains(&asset.digest)
            {
                continue;
            }
            // The blob may have landed after the listing.
            if self.stored_anywhere(&asset.digest).await? {
                continue;
            }
            garbage.push(Garbage {
                ecosystem: asset.ecosystem,
                path: None,
                kind: GarbageKind::CatalogOnly(asset.digest),
                asset_id: Some(asset.id),
            });
        }

        tracing::info!(count = garbage.len(), dry_run, "Collected garbage");

        if !dry_run {
            for item in &garbage {
                self.remove(item).await?;
            }
        }

        Ok(garbage)
    }

    async fn stored_anywhere(&self, digest: &Digest) -> RegistryResult<bool> {
        for ecosystem in Ecosystem::ALL {
            if self.bucket.exists(&blob_path(ecosystem, digest)).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn remove(&self, item: &Garbage) -> RegistryResult<()> {
        tracing::debug!(%item, "Removing");

        if let Some(path) = &item.path {
            match self.bucket.delete(path).await {
                Ok(()) => {}
                Err(error) if error.is_not_found() => {}
                Err(error) => return Err(error.into()),
            }
        }

        if let Some(id) = item.asset_id {
            match self.catalog.delete_asset(id).await {
                Ok(()) => {}
                Err(crate::catalog::CatalogError::NotFound { .. }) => {}
                Err(error) => return Err(error.into()),
            }
        }

        Ok(())
    }
}
