use anyhow::{Context, Result};
use object_store::{
    ObjectStore, aws::AmazonS3Builder, local::LocalFileSystem, memory::InMemory, path::Path,
    prefix::PrefixStore,
};
use std::sync::Arc;
use url::Url;

use crate::config::StorageConfig;

/// Create the object store holding the blocks, rooted under the configured prefix.
pub fn create_object_store(storage_config: &StorageConfig) -> Result<Arc<dyn ObjectStore>> {
    let store = create_object_store_from_dsn(&storage_config.dsn)?;

    let prefix = storage_config.prefix.trim_matches('/');
    if prefix.is_empty() {
        return Ok(store);
    }

    tracing::debug!(prefix = %prefix, "Rooting object store under prefix");
    Ok(Arc::new(PrefixStore::new(store, Path::from(prefix))))
}

/// Create an object store from a DSN string
pub fn create_object_store_from_dsn(dsn: &str) -> Result<Arc<dyn ObjectStore>> {
    let url = Url::parse(dsn).with_context(|| format!("Invalid storage DSN '{dsn}'"))?;

    match url.scheme() {
        "file" => {
            let path = url.path();
            if path.is_empty() || path == "/" {
                anyhow::bail!("File DSN must specify a path: file:///path/to/blocks");
            }
            // file:///.data/blocks refers to a directory relative to the working directory
            let path = path.strip_prefix("/.").map_or(path.to_string(), |rest| format!(".{rest}"));
            std::fs::create_dir_all(&path)
                .with_context(|| format!("Failed to create storage directory '{path}'"))?;
            Ok(Arc::new(LocalFileSystem::new_with_prefix(&path)?))
        }
        "memory" => Ok(Arc::new(InMemory::new())),
        "s3" => {
            let builder = create_s3_builder_from_dsn(&url)?;
            Ok(Arc::new(builder.build()?))
        }
        scheme => anyhow::bail!("Unsupported storage scheme: {scheme}. Supported: file, memory, s3"),
    }
}

/// Create an S3 builder from a DSN
/// DSN format: s3://[access_key:secret_key@]host[:port]/bucket
pub fn create_s3_builder_from_dsn(dsn: &Url) -> Result<AmazonS3Builder> {
    let host = dsn.host_str().context("Missing S3 host in DSN")?;
    let port = dsn.port();
    let bucket = dsn.path().trim_start_matches('/');

    if bucket.is_empty() {
        anyhow::bail!("S3 DSN must specify a bucket: s3://host/bucket");
    }

    // Region and credentials come from the AWS_* environment unless the DSN carries keys
    let mut builder = AmazonS3Builder::from_env().with_bucket_name(bucket);

    let access_key = dsn.username();
    if !access_key.is_empty() {
        builder = builder
            .with_access_key_id(access_key)
            .with_secret_access_key(dsn.password().unwrap_or(""));
    }

    // S3-compatible stores (MinIO etc) need an explicit, path-style endpoint
    if !host.contains("amazonaws.com") {
        let scheme = if port == Some(443) { "https" } else { "http" };
        let endpoint = match port {
            Some(p) => format!("{scheme}://{host}:{p}"),
            None => format!("{scheme}://{host}"),
        };
        builder = builder
            .with_endpoint(endpoint)
            .with_allow_http(true)
            .with_virtual_hosted_style_request(false);
    }

    Ok(builder)
}
