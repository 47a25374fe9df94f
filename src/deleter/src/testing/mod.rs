//! Test support: an in-memory bucket, block fixtures and a fault-injecting
//! bucket wrapper.
//!
//! Compiled for the crate's own tests and, behind the `testing` feature, for
//! integration tests of dependent crates.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use object_store::memory::InMemory;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::block::{BlockId, BlockMeta};
use crate::bucket::{Bucket, ObjectStoreBucket};
use crate::deletion_mark::DeletionMark;
use crate::error::BucketError;

/// A fresh bucket backed by `object_store::memory::InMemory`.
pub fn memory_bucket() -> Arc<dyn Bucket> {
    Arc::new(ObjectStoreBucket::new(Arc::new(InMemory::new())))
}

/// Upload a complete block: two data objects and its meta.json.
pub async fn upload_block(bucket: &dyn Bucket, meta: &BlockMeta) {
    let id = meta.ulid;
    bucket
        .put(&format!("{id}/chunks/000001"), Bytes::from_static(b"chunk"))
        .await
        .expect("upload chunk");
    bucket
        .put(&format!("{id}/index"), Bytes::from_static(b"index"))
        .await
        .expect("upload index");
    bucket
        .put(
            &id.meta_path(),
            Bytes::from(serde_json::to_vec(meta).expect("encode meta")),
        )
        .await
        .expect("upload meta");
}

/// Write a deletion mark for `id` as if it had been marked at `marked_at`.
pub async fn write_deletion_mark(
    bucket: &dyn Bucket,
    id: BlockId,
    marked_at: DateTime<Utc>,
) -> DeletionMark {
    let mark = DeletionMark::new(id, marked_at, None);
    bucket
        .put(
            &id.deletion_mark_path(),
            Bytes::from(serde_json::to_vec(&mark).expect("encode mark")),
        )
        .await
        .expect("upload mark");
    mark
}

/// Every key stored under the block's directory, sorted.
pub async fn block_keys(bucket: &dyn Bucket, id: BlockId) -> Vec<String> {
    let mut keys = bucket.list(&id.dir()).await.expect("list block");
    keys.sort();
    keys
}

/// Wraps a bucket and fails selected operations.
///
/// Failures are injected per operation for keys starting with a configured
/// prefix. Deletes that reach the inner bucket are recorded in call order,
/// and the peak number of concurrent `get` calls is tracked.
#[derive(Debug)]
pub struct FaultyBucket {
    inner: Arc<dyn Bucket>,
    fail_list_dirs: bool,
    fail_list_prefixes: Vec<String>,
    fail_get: Vec<String>,
    fail_put: Vec<String>,
    fail_delete: Vec<String>,
    get_latency: Option<Duration>,
    gets_in_flight: AtomicUsize,
    max_gets_in_flight: AtomicUsize,
    deleted: Mutex<Vec<String>>,
}

impl FaultyBucket {
    pub fn new(inner: Arc<dyn Bucket>) -> Self {
        Self {
            inner,
            fail_list_dirs: false,
            fail_list_prefixes: Vec::new(),
            fail_get: Vec::new(),
            fail_put: Vec::new(),
            fail_delete: Vec::new(),
            get_latency: None,
            gets_in_flight: AtomicUsize::new(0),
            max_gets_in_flight: AtomicUsize::new(0),
            deleted: Mutex::new(Vec::new()),
        }
    }

    /// Fail listing the top-level directories.
    pub fn fail_list(mut self) -> Self {
        self.fail_list_dirs = true;
        self
    }

    /// Fail recursive listings under `prefix`.
    pub fn fail_list_under(mut self, prefix: &str) -> Self {
        self.fail_list_prefixes.push(prefix.to_string());
        self
    }

    pub fn fail_get(mut self, prefix: &str) -> Self {
        self.fail_get.push(prefix.to_string());
        self
    }

    pub fn fail_put(mut self, prefix: &str) -> Self {
        self.fail_put.push(prefix.to_string());
        self
    }

    pub fn fail_delete(mut self, prefix: &str) -> Self {
        self.fail_delete.push(prefix.to_string());
        self
    }

    /// Sleep this long inside every `get`.
    pub fn with_get_latency(mut self, latency: Duration) -> Self {
        self.get_latency = Some(latency);
        self
    }

    pub fn max_in_flight_gets(&self) -> usize {
        self.max_gets_in_flight.load(Ordering::SeqCst)
    }

    /// Keys passed to a successful `delete`, in call order.
    pub fn deleted_keys(&self) -> Vec<String> {
        self.deleted.lock().map(|d| d.clone()).unwrap_or_default()
    }

    fn injected(op: &'static str, key: &str) -> BucketError {
        BucketError::Store {
            op,
            key: key.to_string(),
            source: object_store::Error::Generic {
                store: "faulty",
                source: "injected failure".into(),
            },
        }
    }

    fn matches(prefixes: &[String], key: &str) -> bool {
        prefixes.iter().any(|p| key.starts_with(p.as_str()))
    }
}

#[async_trait]
impl Bucket for FaultyBucket {
    async fn list_dirs(&self) -> Result<Vec<String>, BucketError> {
        if self.fail_list_dirs {
            return Err(Self::injected("list", "/"));
        }
        self.inner.list_dirs().await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, BucketError> {
        if Self::matches(&self.fail_list_prefixes, prefix) {
            return Err(Self::injected("list", prefix));
        }
        self.inner.list(prefix).await
    }

    async fn get(&self, key: &str) -> Result<Bytes, BucketError> {
        let in_flight = self.gets_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_gets_in_flight.fetch_max(in_flight, Ordering::SeqCst);

        if let Some(latency) = self.get_latency {
            tokio::time::sleep(latency).await;
        }

        let result = if Self::matches(&self.fail_get, key) {
            Err(Self::injected("get", key))
        } else {
            self.inner.get(key).await
        };

        self.gets_in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn exists(&self, key: &str) -> Result<bool, BucketError> {
        if Self::matches(&self.fail_get, key) {
            return Err(Self::injected("head", key));
        }
        self.inner.exists(key).await
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<(), BucketError> {
        if Self::matches(&self.fail_put, key) {
            return Err(Self::injected("put", key));
        }
        self.inner.put(key, data).await
    }

    async fn delete(&self, key: &str) -> Result<(), BucketError> {
        if Self::matches(&self.fail_delete, key) {
            return Err(Self::injected("delete", key));
        }
        self.inner.delete(key).await?;
        if let Ok(mut deleted) = self.deleted.lock() {
            deleted.push(key.to_string());
        }
        Ok(())
    }
}
