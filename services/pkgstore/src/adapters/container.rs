//! OCI distribution (Registry v2) under `/container/v2`.

use axum::extract::{Query, Request};
use axum::http::header::{self, HeaderName};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use super::{Adapter, Context, Operation, Principal, read_body};
use crate::catalog::{
    ContainerMetadata, Ecosystem, NewVersion, Package, PackageVersion, VersionMetadata,
};
use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};
use crate::upload::upload_range;

const PREFIX: &str = "/container/v2";

static DOCKER_UPLOAD_UUID: HeaderName = HeaderName::from_static("docker-upload-uuid");
static DOCKER_CONTENT_DIGEST: HeaderName = HeaderName::from_static("docker-content-digest");
static API_VERSION: HeaderName = HeaderName::from_static("docker-distribution-api-version");

const MANIFEST_V1: &str = "application/vnd.docker.distribution.manifest.v1+json";
const MANIFEST_V1_SIGNED: &str = "application/vnd.docker.distribution.manifest.v1+prettyjws";
const MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";
const MANIFEST_LIST_V2: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";

#[derive(Debug, PartialEq, Eq)]
enum ContainerRoute<'p> {
    /// `/container/v2/`
    VersionCheck,
    /// `{name}/tags/list`
    Tags { name: &'p str },
    /// `{name}/blobs/uploads/[{session}]`
    Upload {
        name: &'p str,
        session: Option<&'p str>,
    },
    /// `{name}/blobs/{digest}`
    Blob { name: &'p str, digest: &'p str },
    /// `{name}/manifests/{reference}`
    Manifest { name: &'p str, reference: &'p str },
}

impl<'p> ContainerRoute<'p> {
    /// Parse from the right, since repository names may contain `/`.
    fn parse(path: &'p str) -> Option<Self> {
        let rest = path.strip_prefix(PREFIX)?;
        if rest.is_empty() || rest == "/" {
            return Some(ContainerRoute::VersionCheck);
        }
        let rest = rest.strip_prefix('/')?;

        let route = if let Some(name) = rest.strip_suffix("/tags/list") {
            ContainerRoute::Tags { name }
        } else if let Some((name, tail)) = rest.rsplit_once("/blobs/uploads") {
            let session = match tail {
                "" | "/" => None,
                tail => {
                    let session = tail.strip_prefix('/')?;
                    if session.contains('/') {
                        return None;
                    }
                    Some(session)
                }
            };
            ContainerRoute::Upload { name, session }
        } else if let Some((name, digest)) = rest.rsplit_once("/blobs/") {
            ContainerRoute::Blob { name, digest }
        } else if let Some((name, reference)) = rest.rsplit_once("/manifests/") {
            ContainerRoute::Manifest { name, reference }
        } else {
            return None;
        };

        let last = match &route {
            ContainerRoute::Blob { digest: last, .. }
            | ContainerRoute::Manifest {
                reference: last, ..
            } => Some(*last),
            _ => None,
        };
        match last {
            Some(last) if last.is_empty() || last.contains('/') => None,
            _ => Some(route),
        }
    }

    fn name(&self) -> Option<&'p str> {
        match self {
            ContainerRoute::VersionCheck => None,
            ContainerRoute::Tags { name }
            | ContainerRoute::Upload { name, .. }
            | ContainerRoute::Blob { name, .. }
            | ContainerRoute::Manifest { name, .. } => Some(*name),
        }
    }
}

/// Repository names are `/`-separated components of `[a-z0-9._-]`.
fn validate_repository(name: &str) -> RegistryResult<()> {
    let valid = !name.is_empty()
        && name.split('/').all(|component| {
            !component.is_empty()
                && component != "."
                && component != ".."
                && component
                    .bytes()
                    .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b"._-".contains(&b))
        });
    if valid {
        Ok(())
    } else {
        Err(RegistryError::InvalidRepository(name.to_owned()))
    }
}

fn parse_session(session: &str) -> RegistryResult<Uuid> {
    session
        .parse()
        .map_err(|_| RegistryError::UploadNotFound(session.to_owned()))
}

fn header_value(value: impl AsRef<str>) -> HeaderValue {
    HeaderValue::from_str(value.as_ref()).unwrap_or_else(|_| HeaderValue::from_static(""))
}

#[derive(Debug, Default, Deserialize)]
struct DigestQuery {
    digest: Option<String>,
}

impl DigestQuery {
    fn from_request(request: &Request) -> RegistryResult<Option<Digest>> {
        let Query(query) = Query::<DigestQuery>::try_from_uri(request.uri())
            .map_err(|rejection| RegistryError::InvalidInput(rejection.body_text()))?;
        query
            .digest
            .filter(|digest| !digest.is_empty())
            .map(|digest| digest.parse::<Digest>())
            .transpose()
            .map_err(RegistryError::from)
    }
}

/// The three families of manifest schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ManifestKind {
    /// Docker schema 1, layers listed in `fsLayers`.
    V1,
    /// Docker schema 2 or an OCI image manifest, with a `config` blob.
    V2,
    /// A manifest list or OCI index, referencing other manifests.
    List,
}

impl ManifestKind {
    fn from_media_type(media_type: &str) -> RegistryResult<Self> {
        match media_type {
            MANIFEST_V1 | MANIFEST_V1_SIGNED => Ok(ManifestKind::V1),
            MANIFEST_V2 | OCI_MANIFEST => Ok(ManifestKind::V2),
            MANIFEST_LIST_V2 | OCI_INDEX => Ok(ManifestKind::List),
            other => Err(RegistryError::UnsupportedManifestType(other.to_owned())),
        }
    }
}

/// What a manifest upload refers to, extracted before anything is stored.
#[derive(Debug)]
struct ParsedManifest {
    media_type: String,
    /// Repository name, which schema 1 manifests may override.
    name: String,
    /// Reference, which schema 1 manifests may override.
    reference: String,
    /// Blobs that must already be uploaded, primary digest first.
    blobs: Vec<Digest>,
}

fn blob_digest(value: &Value, field: &str) -> RegistryResult<Digest> {
    value
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| RegistryError::InvalidManifest(format!("missing {field}")))?
        .parse()
        .map_err(RegistryError::from)
}

fn parse_manifest(
    headers: &HeaderMap,
    body: &[u8],
    name: &str,
    reference: &str,
) -> RegistryResult<ParsedManifest> {
    let document: Value = serde_json::from_slice(body)
        .map_err(|error| RegistryError::InvalidManifest(error.to_string()))?;

    let declared = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.split(';').next().unwrap_or(value).trim())
        .filter(|value| !value.is_empty());
    let media_type = declared
        .or_else(|| document.get("mediaType").and_then(Value::as_str))
        .or_else(|| {
            (document.get("schemaVersion").and_then(Value::as_u64) == Some(1))
                .then_some(MANIFEST_V1)
        })
        .ok_or_else(|| RegistryError::UnsupportedManifestType("unspecified".into()))?
        .to_owned();

    let mut parsed = ParsedManifest {
        name: name.to_owned(),
        reference: reference.to_owned(),
        blobs: Vec::new(),
        media_type,
    };

    match ManifestKind::from_media_type(&parsed.media_type)? {
        ManifestKind::V1 => {
            let layers = document
                .get("fsLayers")
                .and_then(Value::as_array)
                .filter(|layers| !layers.is_empty())
                .ok_or_else(|| RegistryError::InvalidManifest("no layers found".into()))?;
            for layer in layers.iter().rev() {
                push_unique(&mut parsed.blobs, blob_digest(layer, "blobSum")?);
            }
            if let Some(name) = document.get("name").and_then(Value::as_str) {
                parsed.name = name.to_owned();
            }
            if let Some(tag) = document.get("tag").and_then(Value::as_str) {
                parsed.reference = tag.to_owned();
            }
        }
        ManifestKind::V2 => {
            let config = document
                .get("config")
                .ok_or_else(|| RegistryError::InvalidManifest("missing config".into()))?;
            parsed.blobs.push(blob_digest(config, "digest")?);
            for layer in document
                .get("layers")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
            {
                push_unique(&mut parsed.blobs, blob_digest(layer, "digest")?);
            }
        }
        ManifestKind::List => {}
    }

    Ok(parsed)
}

fn push_unique(digests: &mut Vec<Digest>, digest: Digest) {
    if !digests.contains(&digest) {
        digests.push(digest);
    }
}

/// Serves container images under `/container/v2`.
///
/// Container requests are never forwarded upstream.
#[derive(Debug, Clone)]
pub struct ContainerAdapter {
    context: Context,
}

impl ContainerAdapter {
    /// Create the adapter.
    pub fn new(context: Context) -> Self {
        Self { context }
    }

    fn session_location(name: &str, session: Uuid) -> String {
        format!("{PREFIX}/{name}/blobs/uploads/{session}")
    }

    fn blob_location(name: &str, digest: &Digest) -> String {
        format!("{PREFIX}/{name}/blobs/{}", digest.oci())
    }

    fn session_headers(name: &str, session: Uuid, size: u64) -> [(HeaderName, HeaderValue); 4] {
        [
            (
                header::LOCATION,
                header_value(Self::session_location(name, session)),
            ),
            (DOCKER_UPLOAD_UUID.clone(), header_value(session.to_string())),
            (header::RANGE, header_value(upload_range(size))),
            (header::CONTENT_LENGTH, HeaderValue::from_static("0")),
        ]
    }

    fn committed(name: &str, digest: &Digest) -> Response {
        (
            StatusCode::CREATED,
            [
                (header::LOCATION, header_value(Self::blob_location(name, digest))),
                (DOCKER_CONTENT_DIGEST.clone(), header_value(digest.oci())),
                (header::CONTENT_LENGTH, HeaderValue::from_static("0")),
            ],
        )
            .into_response()
    }

    async fn package(&self, name: &str) -> RegistryResult<Package> {
        self.context
            .catalog()
            .find_package(Ecosystem::Container, name)
            .await?
            .ok_or_else(|| RegistryError::PackageNotFound(name.to_owned()))
    }

    #[tracing::instrument(skip(self, request))]
    async fn start_upload(&self, name: &str, request: Request) -> RegistryResult<Response> {
        if let Some(digest) = DigestQuery::from_request(&request)? {
            let body = read_body(request.into_body()).await?;
            let stored = self
                .context
                .assets
                .put(Ecosystem::Container, body, Some(&digest))
                .await?;
            return Ok(Self::committed(name, &stored.asset.digest));
        }

        let asset = self.context.uploads.open(Ecosystem::Container).await?;
        Ok((
            StatusCode::ACCEPTED,
            Self::session_headers(name, asset.session, asset.size),
        )
            .into_response())
    }

    #[tracing::instrument(skip(self, request))]
    async fn upload_chunk(
        &self,
        name: &str,
        session: Uuid,
        request: Request,
    ) -> RegistryResult<Response> {
        let current = self
            .context
            .uploads
            .progress(Ecosystem::Container, session)
            .await?;

        let start = request
            .headers()
            .get(header::CONTENT_RANGE)
            .and_then(|value| value.to_str().ok())
            .and_then(|range| range.split_once('-'))
            .and_then(|(start, _)| start.trim().parse::<u64>().ok());
        if let Some(start) = start {
            if start != current.size {
                return Err(RegistryError::BlobUploadInvalid(format!(
                    "chunk starts at {start}, expected {}",
                    current.size
                )));
            }
        }

        let chunk = read_body(request.into_body()).await?;
        let asset = self
            .context
            .uploads
            .append(Ecosystem::Container, session, chunk)
            .await?;
        Ok((
            StatusCode::ACCEPTED,
            Self::session_headers(name, session, asset.size),
        )
            .into_response())
    }

    #[tracing::instrument(skip(self, request))]
    async fn finish_upload(
        &self,
        name: &str,
        session: Uuid,
        request: Request,
    ) -> RegistryResult<Response> {
        let digest = DigestQuery::from_request(&request)?
            .ok_or_else(|| RegistryError::BlobUploadInvalid("missing digest".into()))?;
        let tail = read_body(request.into_body()).await?;

        let asset = self
            .context
            .uploads
            .finalize(Ecosystem::Container, session, tail, Some(&digest))
            .await?;
        Ok(Self::committed(name, &asset.digest))
    }

    async fn upload_progress(&self, name: &str, session: Uuid) -> RegistryResult<Response> {
        let asset = self
            .context
            .uploads
            .progress(Ecosystem::Container, session)
            .await?;
        Ok((
            StatusCode::NO_CONTENT,
            Self::session_headers(name, session, asset.size),
        )
            .into_response())
    }

    async fn blob(&self, method: &Method, digest: &str) -> RegistryResult<Response> {
        let digest: Digest = digest.parse()?;
        let asset = self
            .context
            .assets
            .stat(&digest)
            .await?
            .ok_or_else(|| RegistryError::BlobNotFound(digest.oci()))?;

        let headers = [
            (header::CONTENT_TYPE, HeaderValue::from_static("application/octet-stream")),
            (DOCKER_CONTENT_DIGEST.clone(), header_value(digest.oci())),
            (header::CONTENT_LENGTH, header_value(asset.size.to_string())),
        ];

        if method == Method::HEAD {
            if !self.context.assets.exists(Ecosystem::Container, &digest).await? {
                return Err(RegistryError::BlobNotFound(digest.oci()));
            }
            return Ok((StatusCode::OK, headers).into_response());
        }

        let data = self.context.assets.get(Ecosystem::Container, &digest).await?;
        Ok((StatusCode::OK, headers, data).into_response())
    }

    #[tracing::instrument(skip(self, request))]
    async fn put_manifest(
        &self,
        name: &str,
        reference: &str,
        request: Request,
    ) -> RegistryResult<Response> {
        let owner = Principal::of(&request);
        let headers = request.headers().clone();
        let body = read_body(request.into_body()).await?;

        let parsed = parse_manifest(&headers, &body, name, reference)?;
        validate_repository(&parsed.name)?;

        let manifest_digest = Digest::of(&body);
        let tag = if parsed.reference.starts_with("sha256:") {
            let declared: Digest = parsed.reference.parse()?;
            if declared != manifest_digest {
                return Err(RegistryError::DigestMismatch {
                    expected: declared.oci(),
                    actual: manifest_digest.oci(),
                });
            }
            None
        } else {
            Some(parsed.reference.clone())
        };

        // Rows are shared across ecosystems, the bytes are not.
        let assets = &self.context.assets;
        for blob in &parsed.blobs {
            if assets.stat(blob).await?.is_none()
                || !assets.exists(Ecosystem::Container, blob).await?
            {
                return Err(RegistryError::ManifestBlobUnknown(blob.oci()));
            }
        }

        let manifest = String::from_utf8(body.to_vec())
            .map_err(|error| RegistryError::InvalidManifest(error.to_string()))?;

        let catalog = self.context.catalog();
        let package = catalog
            .find_or_create_package(Ecosystem::Container, &parsed.name, &owner)
            .await?;
        catalog
            .save_version(
                package.id,
                NewVersion {
                    version: parsed.reference.clone(),
                    tag: tag.clone(),
                    digests: parsed.blobs,
                    metadata: VersionMetadata::Container(ContainerMetadata {
                        content_type: parsed.media_type,
                        digest: manifest_digest,
                        manifest,
                    }),
                },
            )
            .await?;
        if tag.is_some() {
            catalog
                .set_latest_version(package.id, tag.as_deref())
                .await?;
        }

        tracing::info!(repository = %parsed.name, reference = %parsed.reference, digest = %manifest_digest, "Manifest stored");
        Ok((
            StatusCode::CREATED,
            [
                (
                    header::LOCATION,
                    header_value(format!(
                        "{PREFIX}/{}/manifests/{}",
                        parsed.name,
                        manifest_digest.oci()
                    )),
                ),
                (DOCKER_CONTENT_DIGEST.clone(), header_value(manifest_digest.oci())),
                (header::CONTENT_LENGTH, HeaderValue::from_static("0")),
            ],
        )
            .into_response())
    }

    async fn find_manifest(&self, name: &str, reference: &str) -> RegistryResult<PackageVersion> {
        let package = self.package(name).await?;
        let catalog = self.context.catalog();
        let missing = || RegistryError::ManifestNotFound(format!("{name}:{reference}"));

        if reference.starts_with("sha256:") {
            let digest: Digest = reference.parse()?;
            return catalog
                .versions(package.id)
                .await?
                .into_iter()
                .find(|version| {
                    matches!(
                        &version.metadata,
                        VersionMetadata::Container(metadata) if metadata.digest == digest
                    )
                })
                .ok_or_else(missing);
        }

        if let Some(version) = catalog.find_version_by_tag(package.id, reference).await? {
            return Ok(version);
        }
        catalog
            .find_version(package.id, reference)
            .await?
            .ok_or_else(missing)
    }

    async fn get_manifest(
        &self,
        method: &Method,
        name: &str,
        reference: &str,
    ) -> RegistryResult<Response> {
        let version = self.find_manifest(name, reference).await?;
        let VersionMetadata::Container(metadata) = version.metadata else {
            return Err(RegistryError::ManifestNotFound(format!("{name}:{reference}")));
        };

        let headers = [
            (header::CONTENT_TYPE, header_value(&metadata.content_type)),
            (DOCKER_CONTENT_DIGEST.clone(), header_value(metadata.digest.oci())),
            (
                header::CONTENT_LENGTH,
                header_value(metadata.manifest.len().to_string()),
            ),
        ];

        if method == Method::HEAD {
            return Ok((StatusCode::OK, headers).into_response());
        }
        Ok((StatusCode::OK, headers, metadata.manifest).into_response())
    }

    async fn tags(&self, name: &str) -> RegistryResult<Response> {
        let package = self.package(name).await?;
        let mut tags: Vec<String> = self
            .context
            .catalog()
            .versions(package.id)
            .await?
            .into_iter()
            .filter_map(|version| version.tag)
            .collect();
        tags.sort();

        Ok(axum::Json(serde_json::json!({ "name": name, "tags": tags })).into_response())
    }
}

#[async_trait::async_trait]
impl Adapter for ContainerAdapter {
    fn ecosystem(&self) -> Ecosystem {
        Ecosystem::Container
    }

    fn classify(&self, method: &Method, path: &str) -> Option<Operation> {
        let route = ContainerRoute::parse(path)?;
        let read = method == Method::GET || method == Method::HEAD;
        match route {
            ContainerRoute::VersionCheck | ContainerRoute::Tags { .. } if read => {
                Some(Operation::Metadata)
            }
            ContainerRoute::Manifest { .. } if read => Some(Operation::Metadata),
            ContainerRoute::Manifest { .. } if method == Method::PUT => Some(Operation::Upload),
            ContainerRoute::Blob { .. } if read => Some(Operation::Download),
            ContainerRoute::Upload { session: None, .. } if method == Method::POST => {
                Some(Operation::Upload)
            }
            ContainerRoute::Upload {
                session: Some(_), ..
            } if [Method::GET, Method::PATCH, Method::PUT, Method::DELETE].contains(method) => {
                Some(Operation::Upload)
            }
            _ => None,
        }
    }

    fn package_name(&self, path: &str) -> Option<String> {
        ContainerRoute::parse(path)?.name().map(str::to_owned)
    }

    fn error_response(&self, error: RegistryError) -> Response {
        error.into_response()
    }

    async fn download(&self, request: Request) -> RegistryResult<Response> {
        match ContainerRoute::parse(request.uri().path()) {
            Some(ContainerRoute::Blob { name, digest }) => {
                validate_repository(name)?;
                self.blob(request.method(), digest).await
            }
            _ => Err(RegistryError::InvalidInput("not a blob path".into())),
        }
    }

    async fn upload(&self, request: Request) -> RegistryResult<Response> {
        let path = request.uri().path().to_owned();
        let method = request.method().clone();

        match ContainerRoute::parse(&path) {
            Some(ContainerRoute::Upload { name, session }) => {
                validate_repository(name)?;
                let Some(session) = session else {
                    return self.start_upload(name, request).await;
                };
                let session = parse_session(session)?;

                match method {
                    Method::PATCH => self.upload_chunk(name, session, request).await,
                    Method::PUT => self.finish_upload(name, session, request).await,
                    Method::DELETE => {
                        self.context
                            .uploads
                            .abort(Ecosystem::Container, session)
                            .await?;
                        Ok(StatusCode::NO_CONTENT.into_response())
                    }
                    _ => self.upload_progress(name, session).await,
                }
            }
            Some(ContainerRoute::Manifest { name, reference }) => {
                validate_repository(name)?;
                self.put_manifest(name, reference, request).await
            }
            _ => Err(RegistryError::InvalidInput("not an upload path".into())),
        }
    }

    async fn metadata(&self, request: Request) -> RegistryResult<Response> {
        match ContainerRoute::parse(request.uri().path()) {
            Some(ContainerRoute::VersionCheck) => Ok((
                StatusCode::OK,
                [(API_VERSION.clone(), HeaderValue::from_static("registry/2.0"))],
                axum::Json(serde_json::json!({})),
            )
                .into_response()),
            Some(ContainerRoute::Tags { name }) => {
                validate_repository(name)?;
                self.tags(name).await
            }
            Some(ContainerRoute::Manifest { name, reference }) => {
                validate_repository(name)?;
                self.get_manifest(request.method(), name, reference).await
            }
            _ => Err(RegistryError::InvalidInput("not a metadata path".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes() {
        assert_eq!(
            ContainerRoute::parse("/container/v2/"),
            Some(ContainerRoute::VersionCheck)
        );
        assert_eq!(
            ContainerRoute::parse("/container/v2/library/alpine/tags/list"),
            Some(ContainerRoute::Tags {
                name: "library/alpine"
            })
        );
        assert_eq!(
            ContainerRoute::parse("/container/v2/app/blobs/uploads/"),
            Some(ContainerRoute::Upload {
                name: "app",
                session: None
            })
        );
        assert_eq!(
            ContainerRoute::parse("/container/v2/app/blobs/uploads"),
            Some(ContainerRoute::Upload {
                name: "app",
                session: None
            })
        );
        assert_eq!(
            ContainerRoute::parse("/container/v2/org/app/blobs/uploads/abc"),
            Some(ContainerRoute::Upload {
                name: "org/app",
                session: Some("abc")
            })
        );
        assert_eq!(
            ContainerRoute::parse("/container/v2/org/app/blobs/sha256:00"),
            Some(ContainerRoute::Blob {
                name: "org/app",
                digest: "sha256:00"
            })
        );
        assert_eq!(
            ContainerRoute::parse("/container/v2/org/app/manifests/latest"),
            Some(ContainerRoute::Manifest {
                name: "org/app",
                reference: "latest"
            })
        );
        assert_eq!(ContainerRoute::parse("/container/v2/app/manifests/"), None);
        assert_eq!(ContainerRoute::parse("/container/v2/app"), None);
        assert_eq!(ContainerRoute::parse("/npm/app"), None);
    }

    #[test]
    fn repository_names() {
        assert!(validate_repository("library/alpine").is_ok());
        assert!(validate_repository("my-app.v2").is_ok());
        assert!(validate_repository("").is_err());
        assert!(validate_repository("Upper").is_err());
        assert!(validate_repository("a/../b").is_err());
        assert!(validate_repository("a//b").is_err());
    }

    #[test]
    fn v2_manifest_references_config_and_layers() {
        let config = Digest::of(b"config");
        let layer = Digest::of(b"layer");
        let body = serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": MANIFEST_V2,
            "config": { "digest": config.oci() },
            "layers": [ { "digest": layer.oci() }, { "digest": config.oci() } ]
        }))
        .unwrap();

        let parsed = parse_manifest(&HeaderMap::new(), &body, "app", "latest").unwrap();
        assert_eq!(parsed.media_type, MANIFEST_V2);
        assert_eq!(parsed.blobs, vec![config, layer]);
        assert_eq!(parsed.reference, "latest");
    }

    #[test]
    fn v1_manifest_overrides_name_and_tag() {
        let first = Digest::of(b"first");
        let last = Digest::of(b"last");
        let body = serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 1,
            "name": "other/app",
            "tag": "v1",
            "fsLayers": [ { "blobSum": first.oci() }, { "blobSum": last.oci() } ]
        }))
        .unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(MANIFEST_V1_SIGNED));

        let parsed = parse_manifest(&headers, &body, "app", "latest").unwrap();
        assert_eq!(parsed.name, "other/app");
        assert_eq!(parsed.reference, "v1");
        assert_eq!(parsed.blobs[0], last);
        assert_eq!(parsed.blobs.len(), 2);
    }

    #[test]
    fn manifest_lists_reference_no_blobs() {
        let body = br#"{"schemaVersion":2,"manifests":[]}"#;
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(OCI_INDEX));

        let parsed = parse_manifest(&headers, body, "app", "latest").unwrap();
        assert!(parsed.blobs.is_empty());
    }

    #[test]
    fn unknown_media_types_are_rejected() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        let error = parse_manifest(&headers, b"{}", "app", "latest").unwrap_err();
        assert!(matches!(error, RegistryError::UnsupportedManifestType(_)));
    }
}
