//! # pkgstore
//!
//! A multi-protocol artifact registry. One HTTP server speaks three package
//! protocols over a shared content-addressed blob store:
//!
//! - npm: publish and install, with tarball downloads
//! - PyPI: legacy multipart uploads and the PEP 503 simple index
//! - OCI: the distribution API, including chunked blob uploads
//!
//! Blobs are keyed by their SHA-256 digest and stored once per ecosystem.
//! Package and version rows live in a [`catalog::Catalog`]. npm and PyPI
//! misses can be forwarded to an upstream registry.
//!
//! ## Example
//!
//! ```no_run
//! use pkgstore::RegistryBuilder;
//! use storage::MemoryStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let storage = MemoryStorage::with_buckets(&["pkgstore"]);
//! let registry = RegistryBuilder::new()
//!     .storage(storage.into())
//!     .bucket("pkgstore")
//!     .build();
//!
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:8080").await?;
//! axum::serve(listener, registry).await?;
//! # Ok(())
//! # }
//! ```

pub mod adapters;
mod api;
pub mod assets;
pub mod catalog;
pub mod config;
mod digest;
mod error;
pub mod gc;
mod hashing;
pub mod upload;
pub mod upstream;

pub use api::{DEFAULT_BUCKET, RegistryBuilder};
pub use digest::{Digest, DigestError};
pub use error::{RegistryError, RegistryResult};
