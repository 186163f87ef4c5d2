//! S3-compatible storage backend using the AWS SDK.

use aws_config::BehaviorVersion;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use camino::Utf8Path;
use chrono::{DateTime, Utc};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde::Deserialize;
use tokio::io::AsyncWriteExt;

use storage_driver::{Driver, Metadata, Reader, StorageError, StorageErrorKind, Writer};

const ENGINE: &str = "s3";

/// Connection settings for an S3-compatible store.
///
/// Credentials fall back to the ambient AWS chain when the key pair is unset.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct S3Config {
    /// Region, defaults to `us-east-1`.
    #[serde(default)]
    pub region: Option<String>,

    /// Custom endpoint such as a MinIO host.
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Access key id.
    #[serde(default)]
    pub access_key: Option<String>,

    /// Secret access key.
    #[serde(default)]
    pub secret_key: Option<String>,

    /// Key prefix prepended to every object.
    #[serde(default)]
    pub prefix: Option<String>,

    /// Use `endpoint/bucket/key` addressing.
    #[serde(default)]
    pub force_path_style: bool,
}

/// Stores objects in an S3 bucket. The driver's bucket argument names the S3 bucket.
pub struct S3Driver {
    client: Client,
    keys: KeyPrefix,
}

impl std::fmt::Debug for S3Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Driver")
            .field("prefix", &self.keys.0)
            .finish_non_exhaustive()
    }
}

impl S3Driver {
    /// Build a client from configuration.
    pub async fn new(config: S3Config) -> Result<Self, StorageError> {
        if config.access_key.is_some() != config.secret_key.is_some() {
            return Err(StorageError::new(
                ENGINE,
                StorageErrorKind::InvalidRequest,
                "s3 config requires both access-key and secret-key when either is set",
            ));
        }

        let region = aws_config::Region::new(
            config.region.unwrap_or_else(|| "us-east-1".to_owned()),
        );

        let mut builder = match (config.access_key, config.secret_key) {
            (Some(key_id), Some(secret)) => {
                let credentials = aws_sdk_s3::config::Credentials::new(
                    key_id,
                    secret,
                    None,
                    None,
                    "pkgstore-config",
                );
                aws_sdk_s3::config::Builder::new()
                    .behavior_version(BehaviorVersion::latest())
                    .region(region)
                    .credentials_provider(credentials)
            }
            _ => {
                let shared = aws_config::defaults(BehaviorVersion::latest())
                    .region(region)
                    .load()
                    .await;
                aws_sdk_s3::config::Builder::from(&shared)
            }
        };

        if let Some(endpoint) = config.endpoint {
            let lower = endpoint.to_ascii_lowercase();
            let endpoint = if lower.starts_with("http://") || lower.starts_with("https://") {
                endpoint
            } else {
                format!("https://{endpoint}")
            };
            builder = builder.endpoint_url(endpoint);
        }

        if config.force_path_style {
            builder = builder.force_path_style(true);
        }

        Ok(Self {
            client: Client::from_conf(builder.build()),
            keys: KeyPrefix::new(config.prefix),
        })
    }
}

/// Maps bucket keys to S3 object keys under an optional prefix.
#[derive(Debug, Clone, Default)]
struct KeyPrefix(Option<String>);

impl KeyPrefix {
    fn new(prefix: Option<String>) -> Self {
        KeyPrefix(
            prefix
                .map(|p| p.trim_end_matches('/').to_owned())
                .filter(|p| !p.is_empty()),
        )
    }

    fn full_key(&self, key: &Utf8Path) -> String {
        match &self.0 {
            Some(prefix) => format!("{prefix}/{key}"),
            None => key.to_string(),
        }
    }

    fn strip_prefix<'k>(&self, full_key: &'k str) -> &'k str {
        match &self.0 {
            Some(prefix) => full_key
                .strip_prefix(prefix.as_str())
                .and_then(|rest| rest.strip_prefix('/'))
                .unwrap_or(full_key),
            None => full_key,
        }
    }
}

fn map_sdk_error<E>(err: SdkError<E>, bucket: &str, key: &Utf8Path) -> StorageError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let kind = match &err {
        SdkError::ServiceError(service) => match service.raw().status().as_u16() {
            404 => StorageErrorKind::NotFound,
            401 | 403 => StorageErrorKind::PermissionDenied,
            400 => StorageErrorKind::InvalidRequest,
            500..=599 => StorageErrorKind::ServiceUnavailable,
            _ => StorageErrorKind::Other,
        },
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => {
            StorageErrorKind::ServiceUnavailable
        }
        _ => StorageErrorKind::Other,
    };

    StorageError::builder(ENGINE, kind, err)
        .bucket(bucket)
        .path(key.as_str())
        .build()
}

#[async_trait::async_trait]
impl Driver for S3Driver {
    fn name(&self) -> &'static str {
        ENGINE
    }

    fn scheme(&self) -> &str {
        "s3"
    }

    #[tracing::instrument(skip(self), fields(backend = "s3"))]
    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        let output = self
            .client
            .head_object()
            .bucket(bucket)
            .key(self.keys.full_key(remote))
            .send()
            .await
            .map_err(|e| map_sdk_error(e, bucket, remote))?;

        let created = output
            .last_modified()
            .and_then(|dt| DateTime::<Utc>::from_timestamp(dt.secs(), dt.subsec_nanos()))
            .unwrap_or_else(Utc::now);

        Ok(Metadata {
            size: output.content_length().unwrap_or(0).max(0) as u64,
            created,
        })
    }

    #[tracing::instrument(skip(self), fields(backend = "s3"))]
    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
        // delete_object succeeds on missing keys, check first to report NotFound.
        self.metadata(bucket, remote).await?;

        self.client
            .delete_object()
            .bucket(bucket)
            .key(self.keys.full_key(remote))
            .send()
            .await
            .map_err(|e| map_sdk_error(e, bucket, remote))?;
        Ok(())
    }

    #[tracing::instrument(skip(self, reader), fields(backend = "s3"))]
    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        reader: &mut Reader<'_>,
    ) -> Result<(), StorageError> {
        let mut data = Vec::new();
        tokio::io::copy(reader, &mut data)
            .await
            .map_err(|err| StorageError::io(ENGINE, err).at(bucket, remote.as_str()))?;

        tracing::trace!(size = data.len(), "put_object");
        self.client
            .put_object()
            .bucket(bucket)
            .key(self.keys.full_key(remote))
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| map_sdk_error(e, bucket, remote))?;
        Ok(())
    }

    #[tracing::instrument(skip(self, writer), fields(backend = "s3"))]
    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        writer: &mut Writer<'_>,
    ) -> Result<(), StorageError> {
        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(self.keys.full_key(remote))
            .send()
            .await
            .map_err(|e| map_sdk_error(e, bucket, remote))?;

        let mut body = output.body.into_async_read();
        tokio::io::copy(&mut body, writer)
            .await
            .map_err(|err| StorageError::io(ENGINE, err).at(bucket, remote.as_str()))?;
        writer
            .flush()
            .await
            .map_err(|err| StorageError::io(ENGINE, err).at(bucket, remote.as_str()))?;
        Ok(())
    }

    #[tracing::instrument(skip(self), fields(backend = "s3"))]
    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError> {
        let full_prefix = match prefix {
            Some(prefix) => self.keys.full_key(prefix),
            None => self.keys.0.clone().unwrap_or_default(),
        };

        let mut results = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(bucket)
                .prefix(&full_prefix);

            if let Some(token) = continuation_token.take() {
                request = request.continuation_token(token);
            }

            let output = request
                .send()
                .await
                .map_err(|e| map_sdk_error(e, bucket, Utf8Path::new(&full_prefix)))?;

            for object in output.contents() {
                if let Some(key) = object.key() {
                    let key = self.keys.strip_prefix(key);
                    // S3 prefixes are plain string prefixes, keep only whole components.
                    if prefix.is_none_or(|prefix| Utf8Path::new(key).starts_with(prefix)) {
                        results.push(key.to_owned());
                    }
                }
            }

            if output.is_truncated() == Some(true) {
                continuation_token = output.next_continuation_token().map(|s| s.to_owned());
            } else {
                break;
            }
        }

        Ok(results)
    }

    #[tracing::instrument(skip(self), fields(backend = "s3"))]
    async fn copy(&self, bucket: &str, from: &Utf8Path, to: &Utf8Path) -> Result<(), StorageError> {
        let encoded = utf8_percent_encode(&self.keys.full_key(from), NON_ALPHANUMERIC).to_string();
        let source = format!("{bucket}/{encoded}");

        self.client
            .copy_object()
            .bucket(bucket)
            .key(self.keys.full_key(to))
            .copy_source(source)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, bucket, from))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_respect_prefix() {
        let keys = KeyPrefix::new(Some("registry/".into()));

        assert_eq!(keys.full_key(Utf8Path::new("npm/abc")), "registry/npm/abc");
        assert_eq!(keys.strip_prefix("registry/npm/abc"), "npm/abc");
        assert_eq!(keys.strip_prefix("elsewhere/npm/abc"), "elsewhere/npm/abc");

        let bare = KeyPrefix::new(Some("/".into()));
        assert_eq!(bare.full_key(Utf8Path::new("npm/abc")), "npm/abc");
    }

    #[tokio::test]
    async fn half_configured_credentials_are_rejected() {
        let err = S3Driver::new(S3Config {
            access_key: Some("only-the-id".into()),
            ..Default::default()
        })
        .await
        .unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::InvalidRequest);
    }
}
