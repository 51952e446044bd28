//! [`ObjectStore`] over the AWS S3 API (S3 itself, or MinIO and friends).

use async_trait::async_trait;
use aws_config::Region;
use aws_sdk_s3::config::{Builder, Credentials};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;
use tracing::trace;

use super::{ListPage, ObjectEntry, ObjectReader, ObjectStore, LIST_PAGE_SIZE};
use crate::error::{Error, Result};

#[derive(Clone, Debug)]
pub struct S3Store {
    client: Client,
}

fn store_error(op: &str, bucket: &str, key: &str, err: impl std::error::Error) -> Error {
    Error::Store(format!("{op} {bucket}/{key}: {}", DisplayErrorContext(err)))
}

impl S3Store {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Credentials, region and endpoint from the environment.
    pub async fn from_env() -> Self {
        let config = aws_config::load_from_env().await;
        Self::new(Client::new(&config))
    }

    /// A client for an S3-compatible server at `base_url`, e.g. a local MinIO.
    pub fn with_endpoint(base_url: &str, access_id: &str, access_key: &str) -> Self {
        let credentials = Credentials::new(access_id, access_key, None, None, "mrstream");
        let config = Builder::new()
            .region(Region::new("us-east-1"))
            .endpoint_url(base_url)
            .credentials_provider(credentials)
            .force_path_style(true)
            .behavior_version(aws_sdk_s3::config::BehaviorVersion::latest())
            .build();
        Self::new(Client::from_conf(config))
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn list(&self, bucket: &str, prefix: &str, marker: Option<&str>) -> Result<ListPage> {
        trace!("list:   {bucket}/{prefix} after {marker:?}");
        let mut request = self
            .client
            .list_objects_v2()
            .bucket(bucket)
            .prefix(prefix)
            .max_keys(LIST_PAGE_SIZE);
        if let Some(marker) = marker {
            request = request.start_after(marker);
        }
        let resp = request
            .send()
            .await
            .map_err(|e| store_error("list", bucket, prefix, e))?;

        let entries: Vec<ObjectEntry> = resp
            .contents
            .unwrap_or_default()
            .into_iter()
            .map(|object| ObjectEntry {
                key: object.key.unwrap_or_default(),
                size: object.size.and_then(|s| u64::try_from(s).ok()).unwrap_or(0),
            })
            .collect();
        let truncated = resp.is_truncated.unwrap_or(false);
        let next_marker = if truncated {
            entries.last().map(|e| e.key.clone())
        } else {
            None
        };
        Ok(ListPage {
            entries,
            next_marker,
            truncated,
        })
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<ObjectReader> {
        trace!("get:    {bucket}/{key}");
        let object = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| store_error("get", bucket, key, e))?;
        Ok(Box::pin(object.body.into_async_read()))
    }

    async fn put(&self, bucket: &str, key: &str, body: Bytes) -> Result<()> {
        trace!("put:    {bucket}/{key} ({} bytes)", body.len());
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| store_error("put", bucket, key, e))?;
        Ok(())
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        trace!("delete: {bucket}/{key}");
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| store_error("delete", bucket, key, e))?;
        Ok(())
    }
}
