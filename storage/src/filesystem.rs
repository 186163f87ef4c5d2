use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::Instrument;

use storage_driver::{Driver, Metadata, Reader, StorageError, StorageErrorKind, Writer};

const ENGINE: &str = "filesystem";

/// Stores objects as plain files under `root/<bucket>/<key>`.
#[derive(Debug)]
pub struct FilesystemDriver {
    root: Utf8PathBuf,
}

impl FilesystemDriver {
    /// Create a driver rooted at `root`. The directory is created lazily.
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn bucket_root(&self, bucket: &str) -> Result<Utf8PathBuf, StorageError> {
        if bucket.is_empty() || bucket.contains(['/', '\\']) || bucket == ".." || bucket == "." {
            return Err(StorageError::builder(
                ENGINE,
                StorageErrorKind::InvalidRequest,
                format!("invalid bucket name: {bucket:?}"),
            )
            .bucket(bucket)
            .build());
        }
        Ok(self.root.join(bucket))
    }

    /// Resolve a key to a file, refusing anything that would escape the bucket.
    fn path(&self, bucket: &str, remote: &Utf8Path) -> Result<Utf8PathBuf, StorageError> {
        let safe = remote
            .components()
            .all(|component| matches!(component, Utf8Component::Normal(_)));
        if !safe || remote.as_str().is_empty() {
            return Err(StorageError::builder(
                ENGINE,
                StorageErrorKind::InvalidRequest,
                format!("invalid object key: {remote:?}"),
            )
            .bucket(bucket)
            .path(remote.as_str())
            .build());
        }
        Ok(self.bucket_root(bucket)?.join(remote))
    }

    /// Sibling file that writes go through before being renamed over `path`.
    fn staging(path: &Utf8Path) -> Utf8PathBuf {
        path.with_file_name(format!(".{}.partial", path.file_name().unwrap_or("object")))
    }

    fn io_error(bucket: &str, remote: &Utf8Path) -> impl FnOnce(std::io::Error) -> StorageError {
        let bucket = bucket.to_owned();
        let remote = remote.to_owned();
        move |err| StorageError::io(ENGINE, err).at(&bucket, remote.as_str())
    }
}

#[async_trait::async_trait]
impl Driver for FilesystemDriver {
    fn name(&self) -> &'static str {
        ENGINE
    }

    fn scheme(&self) -> &str {
        "file"
    }

    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        let path = self.path(bucket, remote)?;
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(Self::io_error(bucket, remote))?;
        if !metadata.is_file() {
            return Err(StorageError::not_found(ENGINE, bucket, remote.as_str()));
        }

        // Not every filesystem records a birth time.
        let created = metadata
            .created()
            .or_else(|_| metadata.modified())
            .map_err(Self::io_error(bucket, remote))?;

        Ok(Metadata {
            size: metadata.len(),
            created: created.into(),
        })
    }

    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
        let path = self.path(bucket, remote)?;
        tokio::fs::remove_file(path)
            .await
            .map_err(Self::io_error(bucket, remote))?;
        Ok(())
    }

    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Reader<'_>,
    ) -> Result<(), StorageError> {
        let path = self.path(bucket, remote)?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(Self::io_error(bucket, remote))?;
        }

        // Write beside the target and rename, so readers never see a partial file.
        let staging = Self::staging(&path);

        let mut writer = tokio::io::BufWriter::new(
            tokio::fs::File::create(&staging)
                .await
                .map_err(Self::io_error(bucket, remote))?,
        );

        let written = async {
            tokio::io::copy(local, &mut writer).await?;
            writer.shutdown().await
        }
        .await;

        if let Err(err) = written {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(Self::io_error(bucket, remote)(err));
        }

        tokio::fs::rename(&staging, &path)
            .await
            .map_err(Self::io_error(bucket, remote))?;
        Ok(())
    }

    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Writer<'_>,
    ) -> Result<(), StorageError> {
        let path = self.path(bucket, remote)?;

        let mut reader = tokio::io::BufReader::new(
            tokio::fs::File::open(&path)
                .await
                .map_err(Self::io_error(bucket, remote))?,
        );

        tokio::io::copy(&mut reader, local)
            .await
            .map_err(Self::io_error(bucket, remote))?;

        local
            .flush()
            .await
            .map_err(Self::io_error(bucket, remote))?;

        Ok(())
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError> {
        let root = self.bucket_root(bucket)?;
        let prefix = prefix.map(Utf8Path::to_owned);

        let items = tokio::task::spawn_blocking(move || collect_list(&root, prefix.as_deref()))
            .in_current_span()
            .await
            .map_err(StorageError::with(ENGINE, StorageErrorKind::Other))?
            .map_err(|err| StorageError::io(ENGINE, err).at(bucket, ""))?;

        tracing::debug!("Found {} entries", items.len());
        Ok(items)
    }

    async fn copy(&self, bucket: &str, from: &Utf8Path, to: &Utf8Path) -> Result<(), StorageError> {
        let source = self.path(bucket, from)?;
        let target = self.path(bucket, to)?;

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(Self::io_error(bucket, to))?;
        }

        let staging = Self::staging(&target);
        if let Err(err) = tokio::fs::copy(&source, &staging).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(Self::io_error(bucket, from)(err));
        }

        tokio::fs::rename(&staging, &target)
            .await
            .map_err(Self::io_error(bucket, to))?;
        Ok(())
    }
}

/// Walk a bucket directory, returning `/`-separated keys under `prefix`.
#[tracing::instrument(level = "trace")]
fn collect_list(root: &Utf8Path, prefix: Option<&Utf8Path>) -> std::io::Result<Vec<String>> {
    let mut files = Vec::new();
    match prefix {
        Some(prefix) => {
            let start = root.join(prefix);
            if start.is_dir() {
                visit(root, &start, &mut files)?;
            }
        }
        None if root.is_dir() => visit(root, root, &mut files)?,
        None => {}
    }
    files.sort();
    Ok(files)
}

fn visit(root: &Utf8Path, dir: &Utf8Path, files: &mut Vec<String>) -> std::io::Result<()> {
    for entry in dir.read_dir_utf8()? {
        let entry = entry?;
        if entry.file_name().ends_with(".partial") {
            continue;
        }

        if entry.file_type()?.is_dir() {
            visit(root, entry.path(), files)?;
        } else if let Ok(key) = entry.path().strip_prefix(root) {
            let key = key
                .components()
                .map(|component| component.as_str())
                .collect::<Vec<_>>()
                .join("/");
            files.push(key);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver() -> (tempfile::TempDir, FilesystemDriver) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_owned()).unwrap();
        (dir, FilesystemDriver::new(root))
    }

    async fn put(driver: &FilesystemDriver, key: &str, data: &[u8]) {
        let mut reader = data;
        driver
            .upload("pkgstore", Utf8Path::new(key), &mut reader)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn roundtrip_and_metadata() {
        let (_dir, driver) = driver();
        put(&driver, "pypi/abc", b"wheel-bytes").await;

        let meta = driver
            .metadata("pkgstore", Utf8Path::new("pypi/abc"))
            .await
            .unwrap();
        assert_eq!(meta.size, 11);

        let mut out = Vec::new();
        driver
            .download("pkgstore", Utf8Path::new("pypi/abc"), &mut out)
            .await
            .unwrap();
        assert_eq!(out, b"wheel-bytes");
    }

    #[tokio::test]
    async fn missing_is_not_found() {
        let (_dir, driver) = driver();
        let err = driver
            .metadata("pkgstore", Utf8Path::new("npm/none"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        let err = driver
            .delete("pkgstore", Utf8Path::new("npm/none"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn rejects_traversal() {
        let (_dir, driver) = driver();
        let err = driver
            .metadata("pkgstore", Utf8Path::new("../secret"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::InvalidRequest);

        let err = driver
            .metadata("../other", Utf8Path::new("file"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::InvalidRequest);
    }

    #[tokio::test]
    async fn list_and_copy() {
        let (_dir, driver) = driver();
        put(&driver, "container/aa", b"1").await;
        put(&driver, "container/bb", b"22").await;
        put(&driver, "npm/cc", b"333").await;

        driver
            .copy(
                "pkgstore",
                Utf8Path::new("container/bb"),
                Utf8Path::new("container/dd"),
            )
            .await
            .unwrap();

        let keys = driver
            .list("pkgstore", Some(Utf8Path::new("container")))
            .await
            .unwrap();
        assert_eq!(keys, vec!["container/aa", "container/bb", "container/dd"]);

        let all = driver.list("pkgstore", None).await.unwrap();
        assert_eq!(all.len(), 4);

        assert!(driver.list("never-written", None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn copy_goes_through_staging() {
        let (dir, driver) = driver();
        put(&driver, "container/session", b"layer-bytes").await;

        // Occupy the staging slot so the copy cannot write its bytes.
        let blocked = dir.path().join("pkgstore/container/.digest.partial");
        std::fs::create_dir_all(&blocked).unwrap();

        let from = Utf8Path::new("container/session");
        let to = Utf8Path::new("container/digest");
        assert!(driver.copy("pkgstore", from, to).await.is_err());
        assert!(driver.metadata("pkgstore", to).await.unwrap_err().is_not_found());

        std::fs::remove_dir(&blocked).unwrap();
        driver.copy("pkgstore", from, to).await.unwrap();

        let mut out = Vec::new();
        driver.download("pkgstore", to, &mut out).await.unwrap();
        assert_eq!(out, b"layer-bytes");
        assert_eq!(
            driver.list("pkgstore", None).await.unwrap(),
            vec!["container/digest", "container/session"]
        );
    }
}
