//! Error types for the registry

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::catalog::CatalogError;
use crate::digest::DigestError;

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Error types for registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Package not found
    #[error("package not found: {0}")]
    PackageNotFound(String),

    /// Version not found
    #[error("version not found: {0}")]
    VersionNotFound(String),

    /// Blob not found
    #[error("blob not found: {0}")]
    BlobNotFound(String),

    /// Manifest not found
    #[error("manifest not found: {0}")]
    ManifestNotFound(String),

    /// Upload session not found, or no longer open
    #[error("upload session not found: {0}")]
    UploadNotFound(String),

    /// Invalid digest format
    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    /// Digest mismatch
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        /// Expected digest
        expected: String,
        /// Actual digest
        actual: String,
    },

    /// Invalid manifest
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    /// Unsupported manifest media type
    #[error("unsupported manifest type: {0}")]
    UnsupportedManifestType(String),

    /// A manifest references a blob that was never uploaded
    #[error("manifest references unknown blob: {0}")]
    ManifestBlobUnknown(String),

    /// Invalid repository or package name
    #[error("invalid repository name: {0}")]
    InvalidRepository(String),

    /// Malformed request
    #[error("invalid request: {0}")]
    InvalidInput(String),

    /// Blob upload invalid
    #[error("blob upload invalid: {0}")]
    BlobUploadInvalid(String),

    /// Storage error
    #[error("storage error: {0}")]
    Storage(#[from] storage::StorageError),

    /// Catalog error
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The public registry could not be reached
    #[error("upstream registry error: {0}")]
    Upstream(String),
}

impl From<DigestError> for RegistryError {
    fn from(value: DigestError) -> Self {
        RegistryError::InvalidDigest(value.0)
    }
}

impl RegistryError {
    /// Whether the request may be answered by the public registry instead.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            RegistryError::PackageNotFound(_)
                | RegistryError::VersionNotFound(_)
                | RegistryError::BlobNotFound(_)
                | RegistryError::ManifestNotFound(_)
        )
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            RegistryError::PackageNotFound(_)
            | RegistryError::VersionNotFound(_)
            | RegistryError::BlobNotFound(_)
            | RegistryError::ManifestNotFound(_)
            | RegistryError::UploadNotFound(_) => StatusCode::NOT_FOUND,
            RegistryError::InvalidDigest(_)
            | RegistryError::DigestMismatch { .. }
            | RegistryError::InvalidManifest(_)
            | RegistryError::ManifestBlobUnknown(_)
            | RegistryError::InvalidRepository(_)
            | RegistryError::InvalidInput(_)
            | RegistryError::BlobUploadInvalid(_) => StatusCode::BAD_REQUEST,
            RegistryError::UnsupportedManifestType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            RegistryError::Catalog(CatalogError::NotFound { .. }) => StatusCode::NOT_FOUND,
            RegistryError::Storage(_) | RegistryError::Catalog(_) | RegistryError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            RegistryError::Upstream(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Get the error code for OCI error responses
    pub fn error_code(&self) -> &'static str {
        match self {
            RegistryError::PackageNotFound(_) => "NAME_UNKNOWN",
            RegistryError::VersionNotFound(_) | RegistryError::ManifestNotFound(_) => {
                "MANIFEST_UNKNOWN"
            }
            RegistryError::BlobNotFound(_) => "BLOB_UNKNOWN",
            RegistryError::UploadNotFound(_) => "BLOB_UPLOAD_UNKNOWN",
            RegistryError::InvalidDigest(_) | RegistryError::DigestMismatch { .. } => {
                "DIGEST_INVALID"
            }
            RegistryError::InvalidManifest(_) | RegistryError::UnsupportedManifestType(_) => {
                "MANIFEST_INVALID"
            }
            RegistryError::ManifestBlobUnknown(_) => "MANIFEST_BLOB_UNKNOWN",
            RegistryError::InvalidRepository(_) => "NAME_INVALID",
            RegistryError::InvalidInput(_) => "UNSUPPORTED",
            RegistryError::BlobUploadInvalid(_) => "BLOB_UPLOAD_INVALID",
            RegistryError::Storage(_)
            | RegistryError::Catalog(_)
            | RegistryError::Io(_)
            | RegistryError::Upstream(_) => "UNKNOWN",
        }
    }

    /// Plain `{"error": "..."}` body used outside the container API.
    pub fn simple_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }

        let body = SimpleError {
            error: self.to_string(),
        };
        (status, axum::Json(body)).into_response()
    }
}

/// OCI error response format
#[derive(Debug, serde::Serialize)]
struct ErrorResponse {
    errors: Vec<ErrorDetail>,
}

#[derive(Debug, serde::Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

#[derive(Debug, serde::Serialize)]
struct SimpleError {
    error: String,
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code();
        let message = self.to_string();
        if status.is_server_error() {
            tracing::error!(error = %message, "Request failed");
        }

        let body = ErrorResponse {
            errors: vec![ErrorDetail { code, message }],
        };

        (status, axum::Json(body)).into_response()
    }
}

/// Wraps a [`RegistryError`] so handlers answer with the plain JSON body.
#[derive(Debug)]
pub(crate) struct JsonError(pub(crate) RegistryError);

impl<E> From<E> for JsonError
where
    RegistryError: From<E>,
{
    fn from(value: E) -> Self {
        JsonError(value.into())
    }
}

impl IntoResponse for JsonError {
    fn into_response(self) -> Response {
        self.0.simple_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes() {
        assert_eq!(
            RegistryError::ManifestBlobUnknown("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            RegistryError::UnsupportedManifestType("x".into()).status_code(),
            StatusCode::UNSUPPORTED_MEDIA_TYPE
        );
        assert_eq!(
            RegistryError::Upstream("refused".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert!(RegistryError::PackageNotFound("x".into()).is_not_found());
        assert!(!RegistryError::UploadNotFound("x".into()).is_not_found());
    }

    #[tokio::test]
    async fn oci_envelope() {
        let response = RegistryError::BlobNotFound("sha256:00".into()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["errors"][0]["code"], "BLOB_UNKNOWN");
    }

    #[tokio::test]
    async fn simple_body() {
        let response = RegistryError::InvalidInput("missing field `name`".into()).simple_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "invalid request: missing field `name`");
    }
}
