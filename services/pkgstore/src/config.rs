//! Server configuration.
//!
//! ```toml
//! listen = "0.0.0.0:8080"
//! bucket = "pkgstore"
//! base-url = "https://pkgs.example.org"
//!
//! [storage]
//! backend = "filesystem"
//! root = "data"
//!
//! [catalog]
//! backend = "file"
//! path = "data/catalog.json"
//!
//! [upstream]
//! npm = "https://registry.npmjs.org"
//! pypi = "https://pypi.org/simple"
//! proxy = true
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use http::Uri;
use serde::Deserialize;
use storage::StorageConfig;

use crate::api::DEFAULT_BUCKET;
use crate::catalog::{Catalog, CatalogError, JsonCatalog, MemoryCatalog};
use crate::upstream::Upstream;

/// Errors loading or applying configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The configuration file could not be read
    #[error("reading {path}: {source}")]
    Io {
        /// File being read
        path: Utf8PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid TOML for [`Config`]
    #[error("parsing {path}: {source}")]
    Parse {
        /// File being parsed
        path: Utf8PathBuf,
        /// Underlying error
        #[source]
        source: toml_edit::de::Error,
    },

    /// An upstream URL could not be parsed
    #[error("invalid upstream url {url:?}: {source}")]
    InvalidUpstream {
        /// The configured value
        url: String,
        /// Underlying error
        #[source]
        source: http::uri::InvalidUri,
    },
}

/// Top-level server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    /// Socket address the HTTP server binds
    pub listen: SocketAddr,

    /// Storage bucket holding every ecosystem's blobs
    pub bucket: String,

    /// External URL prefix used in generated links. Empty means relative links.
    pub base_url: String,

    /// Blob storage backend
    pub storage: StorageConfig,

    /// Catalog backend
    pub catalog: CatalogConfig,

    /// Upstream registries consulted on a local miss
    pub upstream: UpstreamConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
            bucket: DEFAULT_BUCKET.to_owned(),
            base_url: String::new(),
            storage: StorageConfig::Filesystem {
                root: Utf8PathBuf::from("data"),
            },
            catalog: CatalogConfig::default(),
            upstream: UpstreamConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, or the defaults when `path` is `None`.
    pub fn load(path: Option<&Utf8Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;

        Self::parse(&text).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })
    }

    /// Parse configuration from TOML text.
    pub fn parse(text: &str) -> Result<Self, toml_edit::de::Error> {
        toml_edit::de::from_str(text)
    }
}

/// Selects the catalog backend
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "backend", rename_all = "kebab-case")]
pub enum CatalogConfig {
    /// Process-local catalog, lost on exit
    Memory,

    /// JSON snapshot rewritten after every change
    File {
        /// Snapshot file
        path: Utf8PathBuf,
    },
}

impl Default for CatalogConfig {
    fn default() -> Self {
        CatalogConfig::File {
            path: Utf8PathBuf::from("data/catalog.json"),
        }
    }
}

impl CatalogConfig {
    /// Open the configured catalog.
    #[tracing::instrument]
    pub async fn build(self) -> Result<Arc<dyn Catalog>, CatalogError> {
        let catalog: Arc<dyn Catalog> = match self {
            CatalogConfig::Memory => Arc::new(MemoryCatalog::new()),
            CatalogConfig::File { path } => Arc::new(JsonCatalog::open(path).await?),
        };
        tracing::debug!(?catalog, "Configured catalog");
        Ok(catalog)
    }
}

/// Upstream registries for proxy fallback
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// npm registry base URL
    pub npm: Option<String>,

    /// PyPI simple index base URL
    pub pypi: Option<String>,

    /// Forward local misses upstream at all
    pub proxy: bool,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            npm: Some("https://registry.npmjs.org".to_owned()),
            pypi: Some("https://pypi.org/simple".to_owned()),
            proxy: true,
        }
    }
}

impl UpstreamConfig {
    /// The npm upstream, if proxying is enabled.
    pub fn npm(&self) -> Result<Option<Upstream>, ConfigError> {
        self.build(self.npm.as_deref())
    }

    /// The PyPI upstream, if proxying is enabled.
    pub fn pypi(&self) -> Result<Option<Upstream>, ConfigError> {
        self.build(self.pypi.as_deref())
    }

    fn build(&self, url: Option<&str>) -> Result<Option<Upstream>, ConfigError> {
        let Some(url) = url.filter(|url| self.proxy && !url.is_empty()) else {
            return Ok(None);
        };

        let base: Uri = url.parse().map_err(|source| ConfigError::InvalidUpstream {
            url: url.to_owned(),
            source,
        })?;
        Ok(Some(Upstream::new(base)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.listen, "0.0.0.0:8080".parse().unwrap());
        assert_eq!(config.bucket, "pkgstore");
        assert!(matches!(config.storage, StorageConfig::Filesystem { ref root } if root == "data"));
        assert_eq!(config.catalog, CatalogConfig::default());
        assert!(config.upstream.proxy);
    }

    #[test]
    fn parse_full() {
        let config = Config::parse(
            r#"
            listen = "127.0.0.1:9000"
            base-url = "https://pkgs.example.org"

            [storage]
            backend = "memory"

            [catalog]
            backend = "memory"

            [upstream]
            npm = "https://npm.example.org"
            proxy = false
            "#,
        )
        .unwrap();

        assert_eq!(config.listen, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.base_url, "https://pkgs.example.org");
        assert!(matches!(config.storage, StorageConfig::Memory));
        assert_eq!(config.catalog, CatalogConfig::Memory);
        assert_eq!(config.upstream.npm.as_deref(), Some("https://npm.example.org"));
        assert_eq!(
            config.upstream.pypi.as_deref(),
            Some("https://pypi.org/simple")
        );
    }

    #[test]
    fn proxy_disabled_builds_no_upstreams() {
        let upstream = UpstreamConfig {
            proxy: false,
            ..Default::default()
        };
        assert!(upstream.npm().unwrap().is_none());
        assert!(upstream.pypi().unwrap().is_none());
    }

    #[test]
    fn rejects_unknown_backend() {
        let error = Config::parse("[catalog]\nbackend = \"postgres\"\n").unwrap_err();
        assert!(error.to_string().contains("postgres"), "{error}");
    }

    #[test]
    fn missing_file() {
        let error = Config::load(Some(Utf8Path::new("does/not/exist.toml"))).unwrap_err();
        assert!(matches!(error, ConfigError::Io { .. }));
    }

    #[tokio::test]
    async fn memory_catalog_builds() {
        let catalog = CatalogConfig::Memory.build().await.unwrap();
        assert!(catalog.list_packages().await.unwrap().is_empty());
    }
}
