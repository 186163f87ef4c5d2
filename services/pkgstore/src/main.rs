//! pkgstore server and maintenance commands.

use std::net::{AddrParseError, SocketAddr};

use camino::Utf8PathBuf;
use clap::{Parser, Subcommand, ValueEnum};
use eyre::WrapErr;
use pkgstore::RegistryBuilder;
use pkgstore::config::Config;
use pkgstore::gc::GarbageCollector;
use storage::{S3Config, StorageConfig};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// A multi-protocol package registry for npm, PyPI and OCI images
#[derive(Debug, Parser)]
#[command(name = "pkgstore", version, about)]
struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "PKGSTORE_CONFIG")]
    config: Option<Utf8PathBuf>,

    /// Address to listen on, `:8080` binds every interface
    #[arg(long, env = "LISTEN_ADDRESS", value_parser = listen_address)]
    listen: Option<SocketAddr>,

    /// Storage backend, overriding the configuration file
    #[arg(long, env = "STORAGE_BACKEND", value_enum)]
    storage_backend: Option<Backend>,

    /// Root directory for the filesystem backend
    #[arg(long, env = "STORAGE_BACKEND_FILESYSTEM_ROOT")]
    filesystem_root: Option<Utf8PathBuf>,

    /// S3 endpoint, for S3-compatible stores
    #[arg(long, env = "STORAGE_BACKEND_S3_ENDPOINT")]
    s3_endpoint: Option<String>,

    /// S3 region
    #[arg(long, env = "STORAGE_BACKEND_S3_REGION")]
    s3_region: Option<String>,

    /// S3 access key id
    #[arg(long, env = "STORAGE_BACKEND_S3_ACCESS_KEY", hide_env_values = true)]
    s3_access_key: Option<String>,

    /// S3 secret access key
    #[arg(long, env = "STORAGE_BACKEND_S3_SECRET_KEY", hide_env_values = true)]
    s3_secret_key: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    Memory,
    Filesystem,
    S3,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the HTTP server (the default)
    Serve,

    /// Remove blobs and uploads no package version references
    Cleanup {
        /// `dryrun` reports what would be removed without deleting it
        #[arg(value_enum)]
        mode: Option<CleanupMode>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum CleanupMode {
    Dryrun,
}

fn listen_address(value: &str) -> Result<SocketAddr, AddrParseError> {
    match value.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{port}").parse(),
        None => value.parse(),
    }
}

impl Args {
    /// Layer command line and environment overrides over the file configuration.
    fn apply(&self, config: &mut Config) {
        if let Some(listen) = self.listen {
            config.listen = listen;
        }

        let backend = self.storage_backend.or_else(|| {
            self.filesystem_root.as_ref().map(|_| Backend::Filesystem)
        });

        match backend {
            Some(Backend::Memory) => config.storage = StorageConfig::Memory,
            Some(Backend::Filesystem) => {
                let root = match (&self.filesystem_root, &config.storage) {
                    (Some(root), _) => root.clone(),
                    (None, StorageConfig::Filesystem { root }) => root.clone(),
                    (None, _) => Utf8PathBuf::from("data"),
                };
                config.storage = StorageConfig::Filesystem { root };
            }
            Some(Backend::S3) => {
                let mut s3 = match &config.storage {
                    StorageConfig::S3(s3) => s3.clone(),
                    _ => S3Config::default(),
                };
                if self.s3_endpoint.is_some() {
                    s3.endpoint = self.s3_endpoint.clone();
                    s3.force_path_style = true;
                }
                if self.s3_region.is_some() {
                    s3.region = self.s3_region.clone();
                }
                if self.s3_access_key.is_some() {
                    s3.access_key = self.s3_access_key.clone();
                }
                if self.s3_secret_key.is_some() {
                    s3.secret_key = self.s3_secret_key.clone();
                }
                config.storage = StorageConfig::S3(s3);
            }
            None => {}
        }
    }
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_error::ErrorLayer::default())
        .init();

    let args = Args::parse();

    let mut config = Config::load(args.config.as_deref()).wrap_err("loading configuration")?;
    args.apply(&mut config);
    tracing::debug!(listen = %config.listen, bucket = %config.bucket, catalog = ?config.catalog, "Configuration");

    let storage = config
        .storage
        .clone()
        .build()
        .await
        .wrap_err("configuring storage")?;
    let catalog = config
        .catalog
        .clone()
        .build()
        .await
        .wrap_err("opening catalog")?;

    match args.command.unwrap_or(Command::Serve) {
        Command::Cleanup { mode } => {
            let dry_run = mode == Some(CleanupMode::Dryrun);
            let collector = GarbageCollector::new(storage.bucket(&config.bucket), catalog);
            let garbage = collector
                .cleanup_assets(dry_run)
                .await
                .wrap_err("collecting garbage")?;
            for item in &garbage {
                tracing::info!(%item, dry_run, "Garbage");
            }
            println!("Found {} assets to cleanup", garbage.len());
        }
        Command::Serve => {
            let mut builder = RegistryBuilder::new()
                .storage(storage)
                .bucket(config.bucket.clone())
                .catalog(catalog)
                .base_url(config.base_url.clone());
            if let Some(upstream) = config.upstream.npm().wrap_err("npm upstream")? {
                builder = builder.npm_upstream(upstream);
            }
            if let Some(upstream) = config.upstream.pypi().wrap_err("pypi upstream")? {
                builder = builder.pypi_upstream(upstream);
            }
            let app = builder.build();

            let listener = tokio::net::TcpListener::bind(config.listen)
                .await
                .wrap_err_with(|| format!("binding {}", config.listen))?;
            tracing::info!(address = %config.listen, "Listening");

            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown())
                .await
                .wrap_err("serving")?;
        }
    }

    Ok(())
}

async fn shutdown() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(%error, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}
