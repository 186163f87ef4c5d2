//! Resumable uploads.
//!
//! A session is an [`Asset`] row in the `Open` state, keyed by a random
//! placeholder digest, with its bytes stored at `{ecosystem}/{session}`.
//! Appending rewrites the whole object, so one client must drive a session
//! serially. Finalizing verifies the content, moves it to its content address
//! and re-keys the row to the real digest.

use std::io::Cursor;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt as _, BufReader};
use uuid::Uuid;

use crate::assets::{AssetStore, blob_path, check_digest, session_path};
use crate::catalog::{Asset, AssetState, CatalogError, Ecosystem, NewAsset};
use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};
use crate::hashing::HashingReader;

/// Value for the `Range` header after `size` bytes have been received.
///
/// Always the inclusive `0-<end>` form, `0-0` before any bytes arrive.
pub fn upload_range(size: u64) -> String {
    format!("0-{}", size.saturating_sub(1))
}

/// Drives upload sessions against an [`AssetStore`].
#[derive(Debug, Clone)]
pub struct UploadSessions {
    assets: AssetStore,
}

impl UploadSessions {
    /// Create the session manager.
    pub fn new(assets: AssetStore) -> Self {
        Self { assets }
    }

    /// Allocate a new session with no bytes.
    #[tracing::instrument(skip(self))]
    pub async fn open(&self, ecosystem: Ecosystem) -> RegistryResult<Asset> {
        let session = Uuid::new_v4();
        let asset = self
            .assets
            .catalog()
            .insert_asset(NewAsset {
                digest: Digest::random(),
                size: 0,
                session,
                ecosystem,
                state: AssetState::Open,
            })
            .await?;

        tracing::debug!(%session, "Opened upload session");
        Ok(asset)
    }

    /// The session row, while it is still open.
    pub async fn progress(&self, ecosystem: Ecosystem, session: Uuid) -> RegistryResult<Asset> {
        self.assets
            .catalog()
            .asset_by_session(session)
            .await?
            .filter(|asset| asset.state == AssetState::Open && asset.ecosystem == ecosystem)
            .ok_or_else(|| RegistryError::UploadNotFound(session.to_string()))
    }

    /// Append a chunk to the session's bytes.
    #[tracing::instrument(skip(self, chunk), fields(chunk = chunk.len()))]
    pub async fn append(
        &self,
        ecosystem: Ecosystem,
        session: Uuid,
        chunk: Bytes,
    ) -> RegistryResult<Asset> {
        let mut asset = self.progress(ecosystem, session).await?;
        let bucket = self.assets.bucket();
        let path = session_path(ecosystem, session);

        let existing = bucket.get(&path).await?.unwrap_or_default();
        let combined = Cursor::new(existing).chain(Cursor::new(chunk));
        let mut reader = BufReader::new(HashingReader::new(combined));
        bucket.upload(&path, &mut reader).await?;

        let (running, size) = reader.get_ref().finish();
        tracing::trace!(%session, %running, size, "Chunk appended");

        asset.size = size;
        Ok(self.assets.catalog().update_asset(&asset).await?)
    }

    /// Verify and commit the session's bytes, plus an optional final chunk.
    ///
    /// A digest mismatch leaves the session exactly as it was. On success the
    /// returned row carries the content digest. When identical content was
    /// already stored, the existing row is returned and the session row removed.
    #[tracing::instrument(skip(self, tail), fields(tail = tail.len()))]
    pub async fn finalize(
        &self,
        ecosystem: Ecosystem,
        session: Uuid,
        tail: Bytes,
        expected: Option<&Digest>,
    ) -> RegistryResult<Asset> {
        let open = self.progress(ecosystem, session).await?;
        let bucket = self.assets.bucket();
        let catalog = self.assets.catalog();
        let temp = session_path(ecosystem, session);

        let existing = bucket.get(&temp).await?;
        let received = existing.as_deref().unwrap_or_default();
        let digest = Digest::of_parts(&[received, &tail]);
        check_digest(expected, &digest)?;
        let size = (received.len() + tail.len()) as u64;

        let target = blob_path(ecosystem, &digest);
        let fresh = !bucket.exists(&target).await?;
        if fresh {
            match &existing {
                Some(_) if tail.is_empty() => bucket.copy(&temp, &target).await?,
                Some(received) => {
                    let mut combined = BytesMut::with_capacity(size as usize);
                    combined.extend_from_slice(received);
                    combined.extend_from_slice(&tail);
                    bucket.put(&target, &combined).await?
                }
                None => bucket.put(&target, &tail).await?,
            }
        }

        let mut row = open.clone();
        row.digest = digest;
        row.size = size;
        row.state = AssetState::Finalized;

        let finalized = match catalog.update_asset(&row).await {
            Ok(row) => row,
            Err(CatalogError::Conflict { .. }) => {
                catalog.delete_asset(open.id).await?;
                catalog
                    .asset_by_digest(&digest)
                    .await?
                    .ok_or_else(|| RegistryError::BlobNotFound(digest.oci()))?
            }
            Err(error) => {
                if fresh {
                    self.assets.remove_blob(ecosystem, &digest).await;
                }
                return Err(error.into());
            }
        };

        match bucket.delete(&temp).await {
            Ok(()) => {}
            Err(error) if error.is_not_found() => {}
            Err(error) => tracing::warn!(%session, %error, "Failed to remove upload bytes"),
        }

        tracing::debug!(%session, %digest, size, "Upload finalized");
        Ok(finalized)
    }

    /// Discard the session's bytes and row.
    #[tracing::instrument(skip(self))]
    pub async fn abort(&self, ecosystem: Ecosystem, session: Uuid) -> RegistryResult<()> {
        let asset = self.progress(ecosystem, session).await?;

        match self.assets.bucket().delete(&session_path(ecosystem, session)).await {
            Ok(()) => {}
            Err(error) if error.is_not_found() => {}
            Err(error) => return Err(error.into()),
        }

        self.assets.catalog().delete_asset(asset.id).await?;
        tracing::debug!(%session, "Upload aborted");
        Ok(())
    }
}
