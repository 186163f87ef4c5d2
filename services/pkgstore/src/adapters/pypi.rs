use std::borrow::Cow;
use std::fmt::Write as _;

use axum::extract::{FromRequest, Multipart, Request};
use axum::http::{Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};

use super::{Adapter, Context, Operation, Principal};
use crate::assets::check_digest;
use crate::catalog::{Ecosystem, NewVersion, Package, PypiFile, PypiMetadata, VersionMetadata};
use crate::digest::Digest;
use crate::error::{RegistryError, RegistryResult};
use crate::upstream::Fallback;

const PREFIX: &str = "/pypi";

/// Extensions of distribution files, longest first.
const EXTENSIONS: [&str; 6] = [".tar.bz2", ".tar.gz", ".whl", ".zip", ".egg", ".tgz"];

/// Bytes left alone in a URL path segment: RFC 3986 unreserved characters.
const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

#[derive(Debug, PartialEq, Eq)]
enum PypiRoute<'p> {
    /// `POST /pypi/` or `/pypi/legacy/`
    Upload,
    /// `/pypi/simple/{name}/`
    Simple(&'p str),
    /// `/pypi/files/[{digest}/]{filename}`
    File {
        digest: Option<&'p str>,
        filename: Cow<'p, str>,
    },
}

impl<'p> PypiRoute<'p> {
    fn parse(path: &'p str) -> Option<Self> {
        let rest = path.strip_prefix(PREFIX)?;
        match rest {
            "" | "/" | "/legacy" | "/legacy/" => return Some(PypiRoute::Upload),
            _ => {}
        }

        if let Some(name) = rest.strip_prefix("/simple/") {
            let name = name.strip_suffix('/').unwrap_or(name);
            return (!name.is_empty() && !name.contains('/')).then_some(PypiRoute::Simple(name));
        }

        let file = rest.strip_prefix("/files/")?;
        let (digest, filename) = match file.split_once('/') {
            Some((digest, filename)) => (Some(digest), filename),
            None => (None, file),
        };
        let filename = percent_decode_str(filename).decode_utf8().ok()?;
        (!filename.is_empty() && !filename.contains('/'))
            .then_some(PypiRoute::File { digest, filename })
    }
}

/// PEP 503 name normalization: lowercase, runs of `-`, `_` and `.` become `-`.
pub(crate) fn normalize(name: &str) -> String {
    let mut normalized = String::with_capacity(name.len());
    let mut separator = false;
    for c in name.chars() {
        if matches!(c, '-' | '_' | '.') {
            separator = true;
            continue;
        }
        if separator && !normalized.is_empty() {
            normalized.push('-');
        }
        separator = false;
        normalized.push(c.to_ascii_lowercase());
    }
    normalized
}

/// Split `{name}-{version}{-postfix}.{ext}` into a normalized name and version.
///
/// The version is the first `-`-separated segment that starts with a digit.
fn parse_filename(filename: &str) -> Option<(String, &str)> {
    let stem = EXTENSIONS
        .iter()
        .find_map(|extension| filename.strip_suffix(extension))?;

    let mut name = Vec::new();
    for segment in stem.split('-') {
        if !name.is_empty() && segment.starts_with(|c: char| c.is_ascii_digit()) {
            return Some((normalize(&name.join("-")), segment));
        }
        name.push(segment);
    }
    None
}

fn escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#x27;"),
            c => escaped.push(c),
        }
    }
    escaped
}

/// Render the PEP 503 simple index for one project.
fn simple_index(base_url: &str, name: &str, files: &[(&PypiFile, Option<&str>)]) -> String {
    let mut links = String::new();
    for (file, requires_python) in files {
        let digest = file.digest.hex();
        let segment = utf8_percent_encode(&file.filename, SEGMENT);
        let filename = escape(&file.filename);
        let _ = write!(
            links,
            r#"<a href="{base_url}{PREFIX}/files/{digest}/{segment}#sha256={digest}""#
        );
        if let Some(requires_python) = requires_python {
            let _ = write!(links, r#" data-requires-python="{}""#, escape(requires_python));
        }
        let _ = write!(links, ">{filename}</a><br/>\n    ");
    }

    let name = escape(name);
    format!(
        r#"<!DOCTYPE html>
<html>
  <head>
    <title>Links for {name}</title>
  </head>
  <body>
    <h1>Links for {name}</h1>
    {}
  </body>
</html>
"#,
        links.trim_end()
    )
}

/// Fields of an upload form.
#[derive(Debug, Default)]
struct UploadForm {
    name: Option<String>,
    version: Option<String>,
    filename: Option<String>,
    content: Option<Bytes>,
    requires_python: Option<String>,
    sha256_digest: Option<String>,
}

impl UploadForm {
    async fn read(request: Request) -> RegistryResult<Self> {
        let mut multipart = Multipart::from_request(request, &())
            .await
            .map_err(|rejection| RegistryError::InvalidInput(rejection.body_text()))?;

        let invalid = |error: axum::extract::multipart::MultipartError| {
            RegistryError::InvalidInput(error.body_text())
        };

        let mut form = UploadForm::default();
        while let Some(field) = multipart.next_field().await.map_err(invalid)? {
            let name = field.name().map(str::to_owned);
            match name.as_deref() {
                Some("name") => form.name = Some(field.text().await.map_err(invalid)?),
                Some("version") => form.version = Some(field.text().await.map_err(invalid)?),
                Some("requires_python") => {
                    let text = field.text().await.map_err(invalid)?;
                    form.requires_python = Some(text).filter(|text| !text.is_empty());
                }
                Some("sha256_digest") => {
                    let text = field.text().await.map_err(invalid)?;
                    form.sha256_digest = Some(text).filter(|text| !text.is_empty());
                }
                Some("content") => {
                    form.filename = field.file_name().map(str::to_owned);
                    form.content = Some(field.bytes().await.map_err(invalid)?);
                }
                _ => {}
            }
        }
        Ok(form)
    }
}

/// A checked upload, ready to store.
#[derive(Debug)]
struct Upload {
    name: String,
    version: String,
    filename: String,
    content: Bytes,
    digest: Digest,
    requires_python: Option<String>,
}

impl TryFrom<UploadForm> for Upload {
    type Error = RegistryError;

    fn try_from(form: UploadForm) -> Result<Self, Self::Error> {
        let missing = |field: &str| RegistryError::InvalidInput(format!("missing field `{field}`"));

        let name = form.name.ok_or_else(|| missing("name"))?;
        let version = form.version.ok_or_else(|| missing("version"))?;
        let content = form.content.ok_or_else(|| missing("content"))?;
        let filename = form.filename.ok_or_else(|| missing("content"))?;

        let name = normalize(&name);
        if name.is_empty() {
            return Err(RegistryError::InvalidRepository(name));
        }
        if version.is_empty() || version.contains('/') {
            return Err(RegistryError::InvalidInput(format!("bad version {version:?}")));
        }
        if filename.is_empty() || filename.contains(['/', '\\']) {
            return Err(RegistryError::InvalidInput(format!("bad filename {filename:?}")));
        }

        let digest = Digest::of(&content);
        if let Some(declared) = &form.sha256_digest {
            let declared: Digest = declared.parse()?;
            check_digest(Some(&declared), &digest)?;
        }

        Ok(Upload {
            name,
            version,
            filename,
            content,
            digest,
            requires_python: form.requires_python,
        })
    }
}

/// Serves Python distributions under `/pypi`.
#[derive(Debug, Clone)]
pub struct PypiAdapter {
    context: Context,
    fallback: Fallback,
}

impl PypiAdapter {
    /// Create the adapter, forwarding index misses through `fallback`.
    pub fn new(context: Context, fallback: Fallback) -> Self {
        Self { context, fallback }
    }

    async fn package(&self, name: &str) -> RegistryResult<Package> {
        self.context
            .catalog()
            .find_package(Ecosystem::Pypi, name)
            .await?
            .ok_or_else(|| RegistryError::PackageNotFound(name.to_owned()))
    }

    async fn index(&self, name: &str) -> RegistryResult<Response> {
        let package = self.package(name).await?;
        let versions = self.context.catalog().versions(package.id).await?;
        if versions.is_empty() {
            return Err(RegistryError::PackageNotFound(name.to_owned()));
        }

        let files: Vec<_> = versions
            .iter()
            .filter_map(|version| match &version.metadata {
                VersionMetadata::Pypi(metadata) => Some(metadata),
                _ => None,
            })
            .flat_map(|metadata| {
                metadata
                    .files
                    .iter()
                    .map(|file| (file, metadata.requires_python.as_deref()))
            })
            .collect();

        let html = simple_index(&self.context.base_url, &package.name, &files);
        Ok((
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
            html,
        )
            .into_response())
    }

    async fn file(&self, digest: Option<&str>, filename: &str) -> RegistryResult<Response> {
        let (name, version) = parse_filename(filename)
            .ok_or_else(|| RegistryError::InvalidInput(format!("bad filename {filename:?}")))?;
        let package = self.package(&name).await?;
        let row = self
            .context
            .catalog()
            .find_version(package.id, version)
            .await?
            .ok_or_else(|| RegistryError::VersionNotFound(format!("{name} {version}")))?;

        let file = match &row.metadata {
            VersionMetadata::Pypi(metadata) => {
                metadata.files.iter().find(|file| file.filename == filename)
            }
            _ => None,
        }
        .ok_or_else(|| RegistryError::BlobNotFound(filename.to_owned()))?;

        if let Some(digest) = digest {
            let requested: Digest = digest.parse()?;
            if requested != file.digest {
                return Err(RegistryError::BlobNotFound(digest.to_owned()));
            }
        }

        let data = self.context.assets.get(Ecosystem::Pypi, &file.digest).await?;
        Ok((
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "application/octet-stream".to_owned()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename={filename}"),
                ),
            ],
            data,
        )
            .into_response())
    }
}

#[async_trait::async_trait]
impl Adapter for PypiAdapter {
    fn ecosystem(&self) -> Ecosystem {
        Ecosystem::Pypi
    }

    fn classify(&self, method: &Method, path: &str) -> Option<Operation> {
        match (method, PypiRoute::parse(path)?) {
            (&Method::POST, PypiRoute::Upload) => Some(Operation::Upload),
            (&Method::GET, PypiRoute::Simple(_)) => Some(Operation::Metadata),
            (&Method::GET | &Method::HEAD, PypiRoute::File { .. }) => Some(Operation::Download),
            _ => None,
        }
    }

    fn package_name(&self, path: &str) -> Option<String> {
        match PypiRoute::parse(path)? {
            PypiRoute::Simple(name) => Some(normalize(name)),
            PypiRoute::File { filename, .. } => parse_filename(&filename).map(|(name, _)| name),
            PypiRoute::Upload => None,
        }
    }

    async fn download(&self, request: Request) -> RegistryResult<Response> {
        match PypiRoute::parse(request.uri().path()) {
            Some(PypiRoute::File { digest, filename }) => self.file(digest, &filename).await,
            _ => Err(RegistryError::InvalidInput("not a file path".into())),
        }
    }

    #[tracing::instrument(skip(self, request))]
    async fn upload(&self, request: Request) -> RegistryResult<Response> {
        let owner = Principal::of(&request);
        let upload = Upload::try_from(UploadForm::read(request).await?)?;
        let catalog = self.context.catalog();

        let package = catalog
            .find_or_create_package(Ecosystem::Pypi, &upload.name, &owner)
            .await?;
        let mut metadata = match catalog.find_version(package.id, &upload.version).await? {
            Some(row) => match row.metadata {
                VersionMetadata::Pypi(metadata) => metadata,
                _ => PypiMetadata::default(),
            },
            None => PypiMetadata::default(),
        };

        if metadata.files.iter().any(|file| file.filename == upload.filename) {
            tracing::debug!(filename = %upload.filename, "File already uploaded");
            return Ok((StatusCode::OK, "OK").into_response());
        }

        let stored = self
            .context
            .assets
            .put(Ecosystem::Pypi, upload.content, Some(&upload.digest))
            .await?;

        metadata.files.push(PypiFile {
            filename: upload.filename.clone(),
            digest: stored.asset.digest,
            size: stored.asset.size,
        });
        if upload.requires_python.is_some() {
            metadata.requires_python = upload.requires_python;
        }

        let mut digests: Vec<Digest> = Vec::with_capacity(metadata.files.len());
        for file in &metadata.files {
            if !digests.contains(&file.digest) {
                digests.push(file.digest);
            }
        }

        let saved = catalog
            .save_version(
                package.id,
                NewVersion {
                    version: upload.version.clone(),
                    tag: None,
                    digests,
                    metadata: VersionMetadata::Pypi(metadata),
                },
            )
            .await;
        if let Err(error) = saved {
            self.context.assets.discard(Ecosystem::Pypi, &stored).await;
            return Err(error.into());
        }
        catalog
            .set_latest_version(package.id, Some(&upload.version))
            .await?;

        tracing::info!(
            package = %upload.name,
            version = %upload.version,
            filename = %upload.filename,
            "Published"
        );
        Ok((StatusCode::OK, "OK").into_response())
    }

    async fn metadata(&self, request: Request) -> RegistryResult<Response> {
        let Some(PypiRoute::Simple(raw)) = PypiRoute::parse(request.uri().path()) else {
            return Err(RegistryError::InvalidInput("not an index path".into()));
        };
        let name = normalize(raw);

        // The public index lives at `/simple/{name}/`, the same shape as ours.
        let forwarded = format!("/{name}/");
        self.fallback
            .resolve(
                request.method(),
                request.headers(),
                &forwarded,
                self.index(&name),
            )
            .await
    }
}
