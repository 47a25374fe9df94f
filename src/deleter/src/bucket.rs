//! The object store capability the block lifecycle runs against.

use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use std::fmt;
use std::sync::Arc;

use crate::error::BucketError;

/// Byte-blob store keyed by `/`-separated paths.
///
/// `delete` of a key that does not exist succeeds, so cleanup can be retried
/// and run concurrently without special casing.
#[async_trait]
pub trait Bucket: Send + Sync + fmt::Debug {
    /// Names of the top-level directories.
    async fn list_dirs(&self) -> Result<Vec<String>, BucketError>;

    /// All keys under `prefix`, recursively.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, BucketError>;

    async fn get(&self, key: &str) -> Result<Bytes, BucketError>;

    async fn exists(&self, key: &str) -> Result<bool, BucketError>;

    async fn put(&self, key: &str, data: Bytes) -> Result<(), BucketError>;

    async fn delete(&self, key: &str) -> Result<(), BucketError>;
}

/// [`Bucket`] backed by any `object_store` implementation.
#[derive(Clone)]
pub struct ObjectStoreBucket {
    store: Arc<dyn ObjectStore>,
}

impl ObjectStoreBucket {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }
}

impl fmt::Debug for ObjectStoreBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectStoreBucket({})", self.store)
    }
}

fn store_error(op: &'static str, key: &str, source: object_store::Error) -> BucketError {
    match source {
        object_store::Error::NotFound { .. } => BucketError::NotFound {
            key: key.to_string(),
        },
        source => BucketError::Store {
            op,
            key: key.to_string(),
            source,
        },
    }
}

#[async_trait]
impl Bucket for ObjectStoreBucket {
    async fn list_dirs(&self) -> Result<Vec<String>, BucketError> {
        let listing = self
            .store
            .list_with_delimiter(None)
            .await
            .map_err(|e| store_error("list", "/", e))?;

        Ok(listing
            .common_prefixes
            .into_iter()
            .map(|p| p.to_string())
            .collect())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, BucketError> {
        let path = ObjectPath::from(prefix);
        self.store
            .list(Some(&path))
            .map_ok(|meta| meta.location.to_string())
            .try_collect::<Vec<String>>()
            .await
            .map_err(|e| store_error("list", prefix, e))
    }

    async fn get(&self, key: &str) -> Result<Bytes, BucketError> {
        let path = ObjectPath::from(key);
        let result = self
            .store
            .get(&path)
            .await
            .map_err(|e| store_error("get", key, e))?;

        result.bytes().await.map_err(|e| store_error("get", key, e))
    }

    async fn exists(&self, key: &str) -> Result<bool, BucketError> {
        match self.store.head(&ObjectPath::from(key)).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(store_error("head", key, e)),
        }
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<(), BucketError> {
        self.store
            .put(&ObjectPath::from(key), PutPayload::from_bytes(data))
            .await
            .map(|_| ())
            .map_err(|e| store_error("put", key, e))
    }

    async fn delete(&self, key: &str) -> Result<(), BucketError> {
        match self.store.delete(&ObjectPath::from(key)).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(store_error("delete", key, e)),
        }
    }
}
