//! The object-store collaborator used by bucket-backed drivers and by
//! `s3://` sources of the streaming adapter.

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};

pub mod memory;
pub mod s3;

pub use memory::MemoryStore;
pub use s3::S3Store;

/// A readable object body.
pub type ObjectReader = Pin<Box<dyn AsyncRead + Send>>;

/// Listing page size requested from stores.
pub const LIST_PAGE_SIZE: i32 = 1000;

/// One listed object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectEntry {
    pub key: String,
    pub size: u64,
}

/// One page of a listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListPage {
    pub entries: Vec<ObjectEntry>,
    /// Marker to pass to the next `list` call while `truncated`.
    pub next_marker: Option<String>,
    pub truncated: bool,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// List objects under `prefix` strictly after `marker`, in key order.
    async fn list(&self, bucket: &str, prefix: &str, marker: Option<&str>) -> Result<ListPage>;

    async fn get(&self, bucket: &str, key: &str) -> Result<ObjectReader>;

    async fn put(&self, bucket: &str, key: &str, body: Bytes) -> Result<()>;

    async fn delete(&self, bucket: &str, key: &str) -> Result<()>;

    /// Read a whole object into memory.
    async fn get_bytes(&self, bucket: &str, key: &str) -> Result<Bytes> {
        let mut reader = self.get(bucket, key).await?;
        let mut content = Vec::new();
        reader.read_to_end(&mut content).await?;
        Ok(Bytes::from(content))
    }
}

/// Split `s3://bucket/key` into its parts.
pub fn parse_s3_url(url: &str) -> Result<(String, String)> {
    let rest = url
        .strip_prefix("s3://")
        .ok_or_else(|| Error::Input(url.to_string()))?;
    match rest.split_once('/') {
        Some((bucket, key)) if !bucket.is_empty() => Ok((bucket.to_string(), key.to_string())),
        None if !rest.is_empty() => Ok((rest.to_string(), String::new())),
        _ => Err(Error::Input(url.to_string())),
    }
}
