use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::TryStreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::buffered::BufWriter;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::{path::Path as ObjPath, ObjectStore};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio_util::io::StreamReader;

use crate::utils::config::{AppConfig, StorageKind};

pub type DynStore = Arc<dyn ObjectStore>;
pub type ByteStream = BoxStream<'static, object_store::Result<Bytes>>;

/// Bucket/key pair naming one object in the hot tier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectLocation {
    pub bucket: String,
    pub key: String,
}

impl ObjectLocation {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    fn object_path(&self) -> ObjPath {
        ObjPath::from(format!("{}/{}", self.bucket, self.key))
    }
}

impl fmt::Display for ObjectLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

/// Hot tier access. Buckets are the first path segment inside one object store.
#[derive(Clone)]
pub struct StorageManager {
    store: DynStore,
    backend_kind: StorageKind,
}

impl StorageManager {
    /// Create a new StorageManager with the backend named in the configuration.
    pub async fn new(cfg: &AppConfig) -> object_store::Result<Self> {
        let backend_kind = cfg.storage.clone();
        let store = create_storage_backend(cfg).await?;

        Ok(Self {
            store,
            backend_kind,
        })
    }

    /// Create a StorageManager around an existing backend.
    pub fn with_backend(store: DynStore, backend_kind: StorageKind) -> Self {
        Self {
            store,
            backend_kind,
        }
    }

    pub fn backend_kind(&self) -> &StorageKind {
        &self.backend_kind
    }

    pub async fn put(&self, location: &ObjectLocation, data: Bytes) -> object_store::Result<()> {
        let payload = object_store::PutPayload::from_bytes(data);
        self.store
            .put(&location.object_path(), payload)
            .await
            .map(|_| ())
    }

    /// Retrieve the full object buffered in memory.
    pub async fn get(&self, location: &ObjectLocation) -> object_store::Result<Bytes> {
        let result = self.store.get(&location.object_path()).await?;
        result.bytes().await
    }

    /// Get a streaming handle for large objects.
    pub async fn get_stream(&self, location: &ObjectLocation) -> object_store::Result<ByteStream> {
        let result = self.store.get(&location.object_path()).await?;
        Ok(result.into_stream())
    }

    /// Write a byte stream without buffering it whole; large inputs go multipart.
    pub async fn put_stream(
        &self,
        location: &ObjectLocation,
        stream: ByteStream,
    ) -> object_store::Result<u64> {
        let mut reader = StreamReader::new(stream.map_err(std::io::Error::other));
        let mut writer = BufWriter::new(Arc::clone(&self.store), location.object_path());

        let written = tokio::io::copy(&mut reader, &mut writer)
            .await
            .map_err(|err| io_error("BufWriter", err))?;
        writer
            .shutdown()
            .await
            .map_err(|err| io_error("BufWriter", err))?;

        Ok(written)
    }

    /// Delete one object. Deleting an object that is already gone succeeds.
    pub async fn delete(&self, location: &ObjectLocation) -> object_store::Result<()> {
        match self.store.delete(&location.object_path()).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// List objects in a bucket below the key prefix.
    pub async fn list(
        &self,
        bucket: &str,
        key_prefix: &str,
    ) -> object_store::Result<Vec<object_store::ObjectMeta>> {
        let prefix = ObjPath::from(format!("{bucket}/{key_prefix}"));
        self.store.list(Some(&prefix)).try_collect().await
    }

    /// Check if an object exists at the specified location.
    pub async fn exists(&self, location: &ObjectLocation) -> object_store::Result<bool> {
        self.store
            .head(&location.object_path())
            .await
            .map(|_| true)
            .or_else(|e| match e {
                object_store::Error::NotFound { .. } => Ok(false),
                _ => Err(e),
            })
    }
}

fn io_error(store: &'static str, err: std::io::Error) -> object_store::Error {
    object_store::Error::Generic {
        store,
        source: err.into(),
    }
}

/// Create a storage backend based on configuration.
async fn create_storage_backend(cfg: &AppConfig) -> object_store::Result<DynStore> {
    match cfg.storage {
        StorageKind::Local => {
            let base = resolve_base_dir(cfg);
            if !base.exists() {
                tokio::fs::create_dir_all(&base)
                    .await
                    .map_err(|e| io_error("LocalFileSystem", e))?;
            }
            let store = LocalFileSystem::new_with_prefix(base)?.with_automatic_cleanup(true);
            Ok(Arc::new(store))
        }
        StorageKind::Memory => {
            Ok(Arc::new(InMemory::new()))
        }
        StorageKind::S3 => {
            let bucket = cfg.s3_bucket.as_deref().ok_or_else(|| object_store::Error::Generic {
                store: "S3",
                source: "s3_bucket must be set when storage = \"s3\"".into(),
            })?;
            let store = AmazonS3Builder::from_env()
                .with_bucket_name(bucket)
                .build()?;
            Ok(Arc::new(store))
        }
    }
}

/// Resolve the absolute base directory used for local storage from config.
///
/// If `data_dir` is relative, it is resolved against the current working directory.
pub fn resolve_base_dir(cfg: &AppConfig) -> PathBuf {
    if cfg.data_dir.starts_with('/') {
        PathBuf::from(&cfg.data_dir)
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(&cfg.data_dir)
    }
}

/// Testing utilities for storage operations.
#[cfg(any(test, feature = "test-utils"))]
pub mod testing {
    use super::*;

    pub fn test_config_memory() -> AppConfig {
        AppConfig {
            storage: StorageKind::Memory,
            data_dir: "/tmp/unused".into(), // Ignored for memory storage
            ..Default::default()
        }
    }

    /// In-memory hot tier for tests.
    pub fn memory_storage() -> StorageManager {
        StorageManager::with_backend(Arc::new(InMemory::new()), StorageKind::Memory)
    }
}
