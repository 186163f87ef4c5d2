//! Protocol adapters.
//!
//! Each adapter claims requests by path shape and translates them into
//! operations on the shared asset store, upload sessions and catalog.

use std::fmt;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;

use crate::assets::AssetStore;
use crate::catalog::{Catalog, Ecosystem};
use crate::error::{RegistryError, RegistryResult};
use crate::upload::UploadSessions;

mod container;
mod npm;
mod pypi;

pub use container::ContainerAdapter;
pub use npm::NpmAdapter;
pub use pypi::PypiAdapter;

/// The kind of work a request asks an adapter for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Serve stored bytes.
    Download,
    /// Accept new content.
    Upload,
    /// Describe a package.
    Metadata,
}

/// Identity of the caller, attached to requests by whatever authenticates them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal(pub String);

impl Principal {
    /// Name recorded as owner when no principal was attached.
    pub const ANONYMOUS: &'static str = "anonymous";

    pub(crate) fn of(request: &Request) -> String {
        request
            .extensions()
            .get::<Principal>()
            .map(|principal| principal.0.clone())
            .unwrap_or_else(|| Self::ANONYMOUS.to_owned())
    }
}

/// Handles shared by every adapter.
#[derive(Debug, Clone)]
pub struct Context {
    pub(crate) assets: AssetStore,
    pub(crate) uploads: UploadSessions,
    pub(crate) base_url: String,
}

impl Context {
    /// Build the shared handles over an asset store.
    ///
    /// `base_url` prefixes links handed out to clients, and may be empty.
    pub fn new(assets: AssetStore, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_owned();
        Self {
            uploads: UploadSessions::new(assets.clone()),
            assets,
            base_url,
        }
    }

    pub(crate) fn catalog(&self) -> &Arc<dyn Catalog> {
        self.assets.catalog()
    }
}

/// One package ecosystem's wire protocol.
#[async_trait::async_trait]
pub trait Adapter: fmt::Debug + Send + Sync {
    /// Ecosystem whose packages this adapter serves.
    fn ecosystem(&self) -> Ecosystem;

    /// Decide whether, and how, this adapter handles a request.
    fn classify(&self, method: &Method, path: &str) -> Option<Operation>;

    /// Whether this adapter claims the request at all.
    fn matches(&self, method: &Method, path: &str) -> bool {
        self.classify(method, path).is_some()
    }

    /// Package a request path refers to, when it names one.
    fn package_name(&self, path: &str) -> Option<String>;

    /// Serve package content.
    async fn download(&self, request: Request) -> RegistryResult<Response>;

    /// Publish package content.
    async fn upload(&self, request: Request) -> RegistryResult<Response>;

    /// Serve the package's index document or manifest.
    async fn metadata(&self, request: Request) -> RegistryResult<Response>;

    /// Render an error the way this ecosystem's clients expect.
    fn error_response(&self, error: RegistryError) -> Response {
        error.simple_response()
    }

    /// Route a request to the operation it was classified as.
    async fn handle(&self, request: Request) -> Response {
        let operation = self.classify(request.method(), request.uri().path());
        let result = match operation {
            Some(Operation::Download) => self.download(request).await,
            Some(Operation::Upload) => self.upload(request).await,
            Some(Operation::Metadata) => self.metadata(request).await,
            None => Err(RegistryError::InvalidInput(format!(
                "unsupported request: {} {}",
                request.method(),
                request.uri().path()
            ))),
        };

        result.unwrap_or_else(|error| self.error_response(error))
    }
}

/// The adapters sharing the registry's HTTP entry point, in dispatch order.
#[derive(Debug, Clone)]
pub struct Adapters {
    adapters: Arc<[Arc<dyn Adapter>]>,
}

impl Adapters {
    /// Dispatch among `adapters`, first match wins.
    pub fn new(adapters: Vec<Arc<dyn Adapter>>) -> Self {
        Self {
            adapters: adapters.into(),
        }
    }

    /// The adapter that claims a request, if any.
    pub fn find(&self, method: &Method, path: &str) -> Option<&Arc<dyn Adapter>> {
        self.adapters
            .iter()
            .find(|adapter| adapter.matches(method, path))
    }
}

/// Router fallback that hands each request to the adapter claiming it.
pub(crate) async fn dispatch(State(adapters): State<Adapters>, request: Request) -> Response {
    match adapters.find(request.method(), request.uri().path()) {
        Some(adapter) => {
            tracing::trace!(ecosystem = %adapter.ecosystem(), path = %request.uri().path(), "Dispatching");
            adapter.handle(request).await
        }
        None => (
            StatusCode::NOT_FOUND,
            axum::Json(serde_json::json!({ "error": "not found" })),
        )
            .into_response(),
    }
}

pub(crate) async fn read_body(body: Body) -> RegistryResult<Bytes> {
    axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|error| RegistryError::InvalidInput(format!("failed to read body: {error}")))
}

/// Path plus query, as forwarded upstream, with `prefix` removed from the path.
pub(crate) fn forwarded_path(request: &Request, prefix: &str) -> String {
    let path = request.uri().path();
    let path = path.strip_prefix(prefix).unwrap_or(path);
    match request.uri().query() {
        Some(query) => format!("{path}?{query}"),
        None => path.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn principal_defaults_to_anonymous() {
        let mut request = Request::new(Body::empty());
        assert_eq!(Principal::of(&request), "anonymous");

        request.extensions_mut().insert(Principal("alice".into()));
        assert_eq!(Principal::of(&request), "alice");
    }

    #[test]
    fn forwarded_path_keeps_query() {
        let request = Request::builder()
            .uri("/npm/@scope%2fname?write=true")
            .body(Body::empty())
            .unwrap();
        assert_eq!(forwarded_path(&request, "/npm"), "/@scope%2fname?write=true");
    }
}
