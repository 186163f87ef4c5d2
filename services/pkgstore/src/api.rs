//! Registry builder and router

use std::sync::Arc;

use axum::Router;
use axum::extract::{DefaultBodyLimit, FromRef, Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{delete, get};
use serde::Serialize;
use serde_json::json;
use storage::{MemoryStorage, Storage};
use tower_http::trace::TraceLayer;

use crate::adapters::{Adapter, Adapters, ContainerAdapter, Context, NpmAdapter, PypiAdapter};
use crate::assets::AssetStore;
use crate::catalog::{Catalog, MemoryCatalog, Package, PackageVersion};
use crate::error::{JsonError, RegistryError};
use crate::upstream::{Fallback, Upstream};

/// Default bucket holding every ecosystem's blobs.
pub const DEFAULT_BUCKET: &str = "pkgstore";

/// Registry builder for configuring and creating the package registry service
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    storage: Option<Storage>,
    bucket: Option<String>,
    catalog: Option<Arc<dyn Catalog>>,
    npm_upstream: Option<Upstream>,
    pypi_upstream: Option<Upstream>,
    base_url: Option<String>,
}

impl RegistryBuilder {
    /// Create a new registry builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the storage backend. Defaults to process memory.
    pub fn storage(mut self, storage: Storage) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Set the bucket name for storage
    pub fn bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = Some(bucket.into());
        self
    }

    /// Set the catalog. Defaults to an in-memory catalog.
    pub fn catalog(mut self, catalog: Arc<dyn Catalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Forward npm cache misses to this registry.
    pub fn npm_upstream(mut self, upstream: Upstream) -> Self {
        self.npm_upstream = Some(upstream);
        self
    }

    /// Forward PyPI simple-index misses to this index.
    pub fn pypi_upstream(mut self, upstream: Upstream) -> Self {
        self.pypi_upstream = Some(upstream);
        self
    }

    /// External URL prefix for links in npm documents and PyPI indexes.
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// Build the registry service
    ///
    /// Returns a Router that can be served with any tower-compatible server
    pub fn build(self) -> Router {
        let storage = self
            .storage
            .unwrap_or_else(|| Storage::new(MemoryStorage::new()));
        let bucket = storage.bucket(self.bucket.unwrap_or_else(|| DEFAULT_BUCKET.to_owned()));
        let catalog = self
            .catalog
            .unwrap_or_else(|| Arc::new(MemoryCatalog::new()));

        let assets = AssetStore::new(bucket, catalog.clone());
        let context = Context::new(assets, self.base_url.unwrap_or_default());

        let adapters: Vec<Arc<dyn Adapter>> = vec![
            Arc::new(NpmAdapter::new(
                context.clone(),
                Fallback::new(self.npm_upstream),
            )),
            Arc::new(PypiAdapter::new(
                context.clone(),
                Fallback::new(self.pypi_upstream),
            )),
            Arc::new(ContainerAdapter::new(context)),
        ];

        let state = AppState {
            catalog,
            adapters: Adapters::new(adapters),
        };

        Router::new()
            .route("/", get(health))
            .route("/api/packages", get(list_packages))
            .route("/api/packages/{id}", delete(delete_package))
            .route("/api/packages/{id}/versions", get(list_versions))
            .route(
                "/api/packages/{id}/versions/{version_id}",
                delete(delete_version),
            )
            .fallback(crate::adapters::dispatch)
            .with_state(state)
            .layer(DefaultBodyLimit::disable())
            .layer(TraceLayer::new_for_http())
    }
}

#[derive(Debug, Clone)]
struct AppState {
    catalog: Arc<dyn Catalog>,
    adapters: Adapters,
}

impl FromRef<AppState> for Arc<dyn Catalog> {
    fn from_ref(input: &AppState) -> Self {
        input.catalog.clone()
    }
}

impl FromRef<AppState> for Adapters {
    fn from_ref(input: &AppState) -> Self {
        input.adapters.clone()
    }
}

/// Health check endpoint
async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// A package together with its versions.
#[derive(Debug, Serialize)]
struct PackageListing {
    #[serde(flatten)]
    package: Package,
    versions: Vec<PackageVersion>,
}

async fn list_packages(
    State(catalog): State<Arc<dyn Catalog>>,
) -> Result<Json<Vec<PackageListing>>, JsonError> {
    let mut listings = Vec::new();
    for package in catalog.list_packages().await? {
        let versions = catalog.versions(package.id).await?;
        listings.push(PackageListing { package, versions });
    }
    Ok(Json(listings))
}

async fn find_package(catalog: &dyn Catalog, id: u64) -> Result<Package, JsonError> {
    catalog
        .package(id)
        .await?
        .ok_or_else(|| JsonError(RegistryError::PackageNotFound(id.to_string())))
}

async fn list_versions(
    State(catalog): State<Arc<dyn Catalog>>,
    Path(id): Path<u64>,
) -> Result<Json<Vec<PackageVersion>>, JsonError> {
    let package = find_package(catalog.as_ref(), id).await?;
    Ok(Json(catalog.versions(package.id).await?))
}

#[tracing::instrument(skip(catalog))]
async fn delete_package(
    State(catalog): State<Arc<dyn Catalog>>,
    Path(id): Path<u64>,
) -> Result<StatusCode, JsonError> {
    let package = find_package(catalog.as_ref(), id).await?;
    catalog.delete_package(package.id).await?;
    tracing::info!(name = %package.name, ecosystem = %package.ecosystem, "Package deleted");
    Ok(StatusCode::NO_CONTENT)
}

#[tracing::instrument(skip(catalog))]
async fn delete_version(
    State(catalog): State<Arc<dyn Catalog>>,
    Path((id, version_id)): Path<(u64, u64)>,
) -> Result<StatusCode, JsonError> {
    let package = find_package(catalog.as_ref(), id).await?;
    let versions = catalog.versions(package.id).await?;
    let version = versions
        .iter()
        .find(|version| version.id == version_id)
        .ok_or_else(|| JsonError(RegistryError::VersionNotFound(version_id.to_string())))?;

    catalog.delete_version(package.id, version.id).await?;
    tracing::info!(name = %package.name, version = %version.version, "Version deleted");

    if package.latest_version.as_deref() == Some(version.version.as_str()) {
        let remaining: Vec<_> = versions.iter().filter(|v| v.id != version_id).collect();
        let latest = remaining
            .iter()
            .find(|v| v.tag.as_deref() == Some("latest"))
            .or_else(|| remaining.last())
            .map(|v| v.version.as_str());
        catalog.set_latest_version(package.id, latest).await?;
    }

    Ok(StatusCode::NO_CONTENT)
}
