use std::borrow::Cow;

use axum::extract::Request;
use axum::http::{Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use percent_encoding::percent_decode_str;
use serde_json::{Map, Value};
use sha1::{Digest as _, Sha1};

use super::{Adapter, Context, Operation, Principal, forwarded_path, read_body};
use crate::catalog::{Ecosystem, NewVersion, Package, VersionMetadata};
use crate::error::{RegistryError, RegistryResult};
use crate::upstream::Fallback;

const PREFIX: &str = "/npm";

#[derive(Debug, PartialEq, Eq)]
enum NpmRoute<'p> {
    /// `/npm/{name}`
    Package(String),
    /// `/npm/{name}/-/{file}.tgz`
    Tarball { name: String, file: &'p str },
}

impl<'p> NpmRoute<'p> {
    fn parse(path: &'p str) -> Option<Self> {
        let rest = path.strip_prefix(PREFIX)?.strip_prefix('/')?;
        match rest.split_once("/-/") {
            Some((name, file)) => {
                if !file.ends_with(".tgz") || file.contains('/') {
                    return None;
                }
                Some(NpmRoute::Tarball {
                    name: package_name(name)?,
                    file,
                })
            }
            None => Some(NpmRoute::Package(package_name(rest)?)),
        }
    }
}

/// Decode `@scope%2fname` and check the name has npm's shape.
fn package_name(raw: &str) -> Option<String> {
    let name = percent_decode_str(raw).decode_utf8().ok()?;
    let valid = match name.strip_prefix('@') {
        Some(scoped) => match scoped.split_once('/') {
            Some((scope, bare)) => !scope.is_empty() && !bare.is_empty() && !bare.contains('/'),
            None => false,
        },
        None => !name.is_empty() && !name.contains('/'),
    };
    (valid && !name.starts_with('.')).then(|| name.into_owned())
}

/// Name without its scope, as used in tarball file names.
fn basename(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}

fn tarball_name(name: &str, version: &str) -> String {
    format!("{}-{version}.tgz", basename(name))
}

/// A version from a publish document, checked and ready to store.
#[derive(Debug)]
struct Prepared {
    version: String,
    tag: Option<String>,
    document: Value,
    tarball: Bytes,
}

/// Validate a publish document without touching storage.
fn prepare(name: &str, body: &Value) -> RegistryResult<Vec<Prepared>> {
    let invalid = |message: &str| RegistryError::InvalidInput(message.to_owned());

    if let Some(declared) = body.get("name").and_then(Value::as_str) {
        if declared != name {
            return Err(RegistryError::InvalidInput(format!(
                "document is for {declared}, not {name}"
            )));
        }
    }

    let versions = body
        .get("versions")
        .and_then(Value::as_object)
        .filter(|versions| !versions.is_empty())
        .ok_or_else(|| invalid("no versions to publish"))?;
    let attachments = body
        .get("_attachments")
        .and_then(Value::as_object)
        .ok_or_else(|| invalid("missing _attachments"))?;
    let dist_tags = body.get("dist-tags").and_then(Value::as_object);

    let mut prepared = Vec::with_capacity(versions.len());
    for (version, document) in versions {
        let attachment = attachments
            .get(&tarball_name(name, version))
            // A lone attachment under another name only stands in for a lone version.
            .or_else(|| match (versions.len(), attachments.len()) {
                (1, 1) => attachments.values().next(),
                _ => None,
            })
            .ok_or_else(|| RegistryError::InvalidInput(format!("no tarball for {version}")))?;

        let data = attachment
            .get("data")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid("attachment has no data"))?;
        let tarball = STANDARD
            .decode(data)
            .map_err(|error| RegistryError::InvalidInput(format!("bad attachment: {error}")))?;

        let shasum = hex::encode(Sha1::digest(&tarball));
        let mut document = document.clone();
        let dist = document
            .as_object_mut()
            .ok_or_else(|| invalid("version must be an object"))?
            .entry("dist")
            .or_insert_with(|| Value::Object(Map::new()));
        let dist = dist
            .as_object_mut()
            .ok_or_else(|| invalid("dist must be an object"))?;

        match dist.get("shasum").and_then(Value::as_str) {
            Some(declared) if declared != shasum => {
                return Err(RegistryError::DigestMismatch {
                    expected: declared.to_owned(),
                    actual: shasum,
                });
            }
            Some(_) => {}
            None => {
                dist.insert("shasum".into(), Value::String(shasum));
            }
        }

        prepared.push(Prepared {
            version: version.clone(),
            tag: dist_tag(dist_tags, version),
            document,
            tarball: Bytes::from(tarball),
        });
    }

    Ok(prepared)
}

/// The dist-tag pointing at `version`, preferring `latest`.
fn dist_tag(dist_tags: Option<&Map<String, Value>>, version: &str) -> Option<String> {
    let tags = dist_tags?;
    if tags.get("latest").and_then(Value::as_str) == Some(version) {
        return Some("latest".into());
    }
    tags.iter()
        .find(|(_, target)| target.as_str() == Some(version))
        .map(|(tag, _)| tag.clone())
}

/// Serves npm packages under `/npm`.
#[derive(Debug, Clone)]
pub struct NpmAdapter {
    context: Context,
    fallback: Fallback,
}

impl NpmAdapter {
    /// Create the adapter, forwarding misses through `fallback`.
    pub fn new(context: Context, fallback: Fallback) -> Self {
        Self { context, fallback }
    }

    async fn package(&self, name: &str) -> RegistryResult<Package> {
        self.context
            .catalog()
            .find_package(Ecosystem::Npm, name)
            .await?
            .ok_or_else(|| RegistryError::PackageNotFound(name.to_owned()))
    }

    async fn document(&self, name: &str) -> RegistryResult<Response> {
        let package = self.package(name).await?;
        let versions = self.context.catalog().versions(package.id).await?;
        if versions.is_empty() {
            return Err(RegistryError::PackageNotFound(name.to_owned()));
        }

        let mut dist_tags = Map::new();
        let mut documents = Map::new();
        for version in versions {
            if let Some(tag) = &version.tag {
                dist_tags.insert(tag.clone(), Value::String(version.version.clone()));
            }

            let mut document = match version.metadata {
                VersionMetadata::Npm(document) => document,
                _ => Value::Object(Map::new()),
            };
            let tarball = format!(
                "{}{PREFIX}/{name}/-/{}",
                self.context.base_url,
                tarball_name(name, &version.version)
            );
            if let Some(dist) = document.get_mut("dist").and_then(Value::as_object_mut) {
                dist.insert("tarball".into(), Value::String(tarball));
            }
            documents.insert(version.version, document);
        }

        if let Some(latest) = package.latest_version {
            dist_tags.entry("latest").or_insert(Value::String(latest));
        }

        let body = serde_json::json!({
            "name": name,
            "dist-tags": dist_tags,
            "versions": documents,
        });
        Ok(axum::Json(body).into_response())
    }

    async fn tarball(&self, name: &str, file: &str) -> RegistryResult<Response> {
        let package = self.package(name).await?;
        let version = file
            .strip_prefix(basename(name))
            .and_then(|rest| rest.strip_prefix('-'))
            .and_then(|rest| rest.strip_suffix(".tgz"))
            .ok_or_else(|| RegistryError::VersionNotFound(file.to_owned()))?;

        let row = self
            .context
            .catalog()
            .find_version(package.id, version)
            .await?
            .ok_or_else(|| RegistryError::VersionNotFound(format!("{name}@{version}")))?;
        let digest = row
            .digests
            .first()
            .ok_or_else(|| RegistryError::VersionNotFound(format!("{name}@{version}")))?;

        let data = self.context.assets.get(Ecosystem::Npm, digest).await?;
        Ok((
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/octet-stream")],
            data,
        )
            .into_response())
    }
}

#[async_trait::async_trait]
impl Adapter for NpmAdapter {
    fn ecosystem(&self) -> Ecosystem {
        Ecosystem::Npm
    }

    fn classify(&self, method: &Method, path: &str) -> Option<Operation> {
        match (method, NpmRoute::parse(path)?) {
            (&Method::GET | &Method::HEAD, NpmRoute::Tarball { .. }) => Some(Operation::Download),
            (&Method::GET, NpmRoute::Package(_)) => Some(Operation::Metadata),
            (&Method::PUT, NpmRoute::Package(_)) => Some(Operation::Upload),
            _ => None,
        }
    }

    fn package_name(&self, path: &str) -> Option<String> {
        match NpmRoute::parse(path)? {
            NpmRoute::Package(name) | NpmRoute::Tarball { name, .. } => Some(name),
        }
    }

    async fn download(&self, request: Request) -> RegistryResult<Response> {
        let (name, file) = match NpmRoute::parse(request.uri().path()) {
            Some(NpmRoute::Tarball { name, file }) => (name, file.to_owned()),
            _ => return Err(RegistryError::InvalidInput("not a tarball path".into())),
        };

        let forwarded = forwarded_path(&request, PREFIX);
        self.fallback
            .resolve(
                request.method(),
                request.headers(),
                &forwarded,
                self.tarball(&name, &file),
            )
            .await
    }

    #[tracing::instrument(skip(self, request), fields(path = %request.uri().path()))]
    async fn upload(&self, request: Request) -> RegistryResult<Response> {
        let name = self
            .package_name(request.uri().path())
            .ok_or_else(|| RegistryError::InvalidRepository(request.uri().path().to_owned()))?;
        let owner = Principal::of(&request);
        let raw = read_body(request.into_body()).await?;
        let body: Value = serde_json::from_slice(&raw)
            .map_err(|error| RegistryError::InvalidInput(error.to_string()))?;

        let prepared = prepare(&name, &body)?;
        let latest = body
            .get("dist-tags")
            .and_then(|tags| tags.get("latest"))
            .and_then(Value::as_str)
            .map(Cow::Borrowed)
            .or_else(|| prepared.last().map(|p| Cow::Owned(p.version.clone())));

        let catalog = self.context.catalog();
        let package = catalog
            .find_or_create_package(Ecosystem::Npm, &name, &owner)
            .await?;

        for version in prepared {
            let stored = self
                .context
                .assets
                .put(Ecosystem::Npm, version.tarball, None)
                .await?;

            let saved = catalog
                .save_version(
                    package.id,
                    NewVersion {
                        version: version.version.clone(),
                        tag: version.tag,
                        digests: vec![stored.asset.digest],
                        metadata: VersionMetadata::Npm(version.document),
                    },
                )
                .await;
            if let Err(error) = saved {
                self.context.assets.discard(Ecosystem::Npm, &stored).await;
                return Err(error.into());
            }

            tracing::info!(package = %name, version = %version.version, "Published");
        }

        catalog
            .set_latest_version(package.id, latest.as_deref())
            .await?;

        Ok((
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            raw,
        )
            .into_response())
    }

    async fn metadata(&self, request: Request) -> RegistryResult<Response> {
        let name = self
            .package_name(request.uri().path())
            .ok_or_else(|| RegistryError::InvalidRepository(request.uri().path().to_owned()))?;

        let forwarded = forwarded_path(&request, PREFIX);
        self.fallback
            .resolve(
                request.method(),
                request.headers(),
                &forwarded,
                self.document(&name),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::Body;
    use storage::{MemoryStorage, Storage};

    use super::*;
    use crate::assets::AssetStore;
    use crate::catalog::testing::FaultyCatalog;

    #[test]
    fn routes() {
        assert_eq!(
            NpmRoute::parse("/npm/left-pad"),
            Some(NpmRoute::Package("left-pad".into()))
        );
        assert_eq!(
            NpmRoute::parse("/npm/@scope%2fwidget"),
            Some(NpmRoute::Package("@scope/widget".into()))
        );
        assert_eq!(
            NpmRoute::parse("/npm/@scope/widget"),
            Some(NpmRoute::Package("@scope/widget".into()))
        );
        assert_eq!(
            NpmRoute::parse("/npm/@scope/widget/-/widget-1.0.0.tgz"),
            Some(NpmRoute::Tarball {
                name: "@scope/widget".into(),
                file: "widget-1.0.0.tgz"
            })
        );
        assert_eq!(NpmRoute::parse("/npm/a/b"), None);
        assert_eq!(NpmRoute::parse("/npm/"), None);
        assert_eq!(NpmRoute::parse("/pypi/simple/a"), None);
    }

    #[test]
    fn tarball_names_drop_the_scope() {
        assert_eq!(tarball_name("@scope/widget", "1.0.0"), "widget-1.0.0.tgz");
        assert_eq!(tarball_name("left-pad", "1.3.0"), "left-pad-1.3.0.tgz");
    }

    fn publish(shasum: Option<&str>) -> Value {
        let mut dist = Map::new();
        if let Some(shasum) = shasum {
            dist.insert("shasum".into(), Value::String(shasum.into()));
        }
        serde_json::json!({
            "name": "left-pad",
            "dist-tags": { "beta": "1.0.0" },
            "versions": { "1.0.0": { "name": "left-pad", "version": "1.0.0", "dist": dist } },
            "_attachments": {
                "left-pad-1.0.0.tgz": { "data": STANDARD.encode(b"tarball"), "length": 7 }
            }
        })
    }

    #[test]
    fn prepare_fills_in_shasum() {
        let prepared = prepare("left-pad", &publish(None)).unwrap();
        assert_eq!(prepared.len(), 1);
        assert_eq!(prepared[0].tag.as_deref(), Some("beta"));
        assert_eq!(&prepared[0].tarball[..], b"tarball");
        assert_eq!(
            prepared[0].document["dist"]["shasum"],
            hex::encode(Sha1::digest(b"tarball"))
        );
    }

    #[test]
    fn prepare_rejects_bad_shasum() {
        let error = prepare("left-pad", &publish(Some("0000"))).unwrap_err();
        assert!(matches!(error, RegistryError::DigestMismatch { .. }));
    }

    #[test]
    fn prepare_rejects_other_names() {
        let error = prepare("right-pad", &publish(None)).unwrap_err();
        assert!(matches!(error, RegistryError::InvalidInput(_)));
    }

    #[test]
    fn lone_attachment_matches_only_a_lone_version() {
        let mut body = publish(None);
        body["_attachments"] = serde_json::json!({
            "package.tgz": { "data": STANDARD.encode(b"tarball"), "length": 7 }
        });
        let prepared = prepare("left-pad", &body).unwrap();
        assert_eq!(&prepared[0].tarball[..], b"tarball");

        body["versions"]["2.0.0"] = serde_json::json!({ "name": "left-pad", "version": "2.0.0" });
        let error = prepare("left-pad", &body).unwrap_err();
        assert!(matches!(error, RegistryError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn failed_publish_keeps_rows_shared_with_pypi() {
        let storage = Storage::new(MemoryStorage::new());
        let catalog = Arc::new(FaultyCatalog::new());
        let assets = AssetStore::new(storage.bucket("pkgstore"), catalog.clone());
        let adapter = NpmAdapter::new(Context::new(assets.clone(), ""), Fallback::new(None));

        let wheel = assets
            .put(Ecosystem::Pypi, Bytes::from_static(b"tarball"), None)
            .await
            .unwrap();

        catalog.fail("save_version");
        let request = http::Request::builder()
            .method(Method::PUT)
            .uri("/npm/left-pad")
            .body(Body::from(serde_json::to_vec(&publish(None)).unwrap()))
            .unwrap();
        let error = adapter.upload(request).await.unwrap_err();
        assert!(matches!(error, RegistryError::Catalog(_)));

        let digest = wheel.asset.digest;
        assert!(!assets.exists(Ecosystem::Npm, &digest).await.unwrap());
        assert!(assets.exists(Ecosystem::Pypi, &digest).await.unwrap());
        assert_eq!(assets.stat(&digest).await.unwrap(), Some(wheel.asset));
    }
}
