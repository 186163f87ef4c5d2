//! Forwarding cache misses to public registries.

use std::fmt;
use std::future::Future;

use axum::response::Response;
use http::header::{self, HeaderName};
use http::{HeaderMap, Method, Uri};
use tower::ServiceExt as _;
use tower::util::BoxCloneSyncService;

use crate::error::{RegistryError, RegistryResult};

/// The HTTP client used to reach a public registry.
pub type UpstreamService = BoxCloneSyncService<
    http::Request<hyperdriver::Body>,
    http::Response<hyperdriver::Body>,
    hyperdriver::client::Error,
>;

/// Headers that describe the inbound connection or caller, and never travel upstream.
const STRIPPED: [HeaderName; 9] = [
    header::AUTHORIZATION,
    header::HOST,
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// A public registry that requests can be forwarded to.
#[derive(Clone)]
pub struct Upstream {
    base: Uri,
    service: UpstreamService,
}

impl fmt::Debug for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Upstream").field("base", &self.base).finish()
    }
}

impl Upstream {
    /// Forward to `base` over HTTPS or HTTP.
    pub fn new(base: Uri) -> Self {
        let client = hyperdriver::Client::build_tcp_http()
            .with_default_tls()
            .build_service();
        Self::with_service(base, client)
    }

    /// Forward to `base` through an arbitrary client service.
    pub fn with_service<S>(base: Uri, service: S) -> Self
    where
        S: tower::Service<
                http::Request<hyperdriver::Body>,
                Response = http::Response<hyperdriver::Body>,
                Error = hyperdriver::client::Error,
            > + Clone
            + Send
            + Sync
            + 'static,
        S::Future: Send + 'static,
    {
        Self {
            base,
            service: BoxCloneSyncService::new(service),
        }
    }

    /// Base URL requests are forwarded to.
    pub fn base(&self) -> &Uri {
        &self.base
    }

    fn target(&self, path_and_query: &str) -> RegistryResult<Uri> {
        let base = self.base.to_string();
        let joined = format!("{}{}", base.trim_end_matches('/'), path_and_query);
        joined
            .parse()
            .map_err(|_| RegistryError::InvalidInput(format!("cannot forward to {joined}")))
    }

    /// Send a bodiless request upstream and return its response as is.
    ///
    /// Credentials and hop-by-hop headers are dropped first.
    #[tracing::instrument(skip(self, headers), fields(upstream = %self.base))]
    pub async fn forward(
        &self,
        method: &Method,
        headers: &HeaderMap,
        path_and_query: &str,
    ) -> RegistryResult<Response> {
        let uri = self.target(path_and_query)?;

        let mut forwarded = headers.clone();
        for name in &STRIPPED {
            forwarded.remove(name);
        }
        forwarded.remove(header::CONTENT_LENGTH);

        let mut request = http::Request::builder()
            .method(method.clone())
            .uri(uri)
            .body(hyperdriver::Body::empty())
            .map_err(|error| RegistryError::InvalidInput(error.to_string()))?;
        *request.headers_mut() = forwarded;

        let response = self
            .service
            .clone()
            .oneshot(request)
            .await
            .map_err(|error| {
                tracing::warn!(%error, "Upstream request failed");
                RegistryError::Upstream(error.to_string())
            })?;

        tracing::debug!(status = %response.status(), "Upstream responded");
        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, axum::body::Body::new(body)))
    }
}

/// Decides between answering locally and forwarding upstream.
///
/// Every adapter goes through [`Fallback::resolve`], so the proxy policy is
/// the same for all of them.
#[derive(Debug, Clone, Default)]
pub struct Fallback {
    upstream: Option<Upstream>,
}

impl Fallback {
    /// Fall back to `upstream` when one is configured.
    pub fn new(upstream: Option<Upstream>) -> Self {
        Self { upstream }
    }

    /// Never forward.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// The configured upstream, if any.
    pub fn upstream(&self) -> Option<&Upstream> {
        self.upstream.as_ref()
    }

    /// Run `local`, and forward the request when it reports a miss.
    pub async fn resolve<F>(
        &self,
        method: &Method,
        headers: &HeaderMap,
        path_and_query: &str,
        local: F,
    ) -> RegistryResult<Response>
    where
        F: Future<Output = RegistryResult<Response>>,
    {
        match (local.await, &self.upstream) {
            (Err(error), Some(upstream)) if error.is_not_found() => {
                tracing::debug!(%error, path = path_and_query, "Local miss, forwarding");
                upstream.forward(method, headers, path_and_query).await
            }
            (result, _) => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::response::IntoResponse as _;
    use bytes::Bytes;
    use http::StatusCode;

    use super::*;

    type Seen = Arc<parking_lot::Mutex<Vec<(Uri, HeaderMap)>>>;

    fn recording(seen: Seen) -> Upstream {
        let service = tower::service_fn(move |request: http::Request<hyperdriver::Body>| {
            let seen = seen.clone();
            async move {
                seen.lock()
                    .push((request.uri().clone(), request.headers().clone()));
                let response = http::Response::builder()
                    .status(StatusCode::OK)
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(hyperdriver::Body::from(Bytes::from_static(b"{\"upstream\":true}")))
                    .unwrap();
                Ok::<_, hyperdriver::client::Error>(response)
            }
        });
        Upstream::with_service("https://registry.example.org/".parse().unwrap(), service)
    }

    fn headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer secret".parse().unwrap());
        headers.insert(header::ACCEPT, "application/json".parse().unwrap());
        headers
    }

    #[tokio::test]
    async fn miss_is_forwarded_without_credentials() {
        let seen = Seen::default();
        let fallback = Fallback::new(Some(recording(seen.clone())));

        let response = fallback
            .resolve(&Method::GET, &headers(), "/left-pad?write=true", async {
                Err::<Response, _>(RegistryError::PackageNotFound("left-pad".into()))
            })
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"{\"upstream\":true}");

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        let (uri, headers) = &seen[0];
        assert_eq!(uri, "https://registry.example.org/left-pad?write=true");
        assert!(headers.get(header::AUTHORIZATION).is_none());
        assert_eq!(headers[header::ACCEPT], "application/json");
    }

    #[tokio::test]
    async fn hit_is_served_locally() {
        let seen = Seen::default();
        let fallback = Fallback::new(Some(recording(seen.clone())));

        let response = fallback
            .resolve(&Method::GET, &headers(), "/left-pad", async {
                Ok::<_, RegistryError>(StatusCode::NO_CONTENT.into_response())
            })
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(seen.lock().is_empty());
    }

    #[tokio::test]
    async fn other_errors_are_not_forwarded() {
        let seen = Seen::default();
        let fallback = Fallback::new(Some(recording(seen.clone())));

        let error = fallback
            .resolve(&Method::GET, &headers(), "/left-pad", async {
                Err::<Response, _>(RegistryError::InvalidInput("bad".into()))
            })
            .await
            .unwrap_err();

        assert!(matches!(error, RegistryError::InvalidInput(_)));
        assert!(seen.lock().is_empty());
    }

    #[tokio::test]
    async fn disabled_reports_the_miss() {
        let error = Fallback::disabled()
            .resolve(&Method::GET, &headers(), "/left-pad", async {
                Err::<Response, _>(RegistryError::PackageNotFound("left-pad".into()))
            })
            .await
            .unwrap_err();
        assert!(error.is_not_found());
    }
}
