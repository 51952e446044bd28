//! Command-line arguments of the binaries.

use std::sync::Arc;

use clap::Args as ClapArgs;
use tracing::debug;

use crate::store::{ObjectStore, S3Store};

pub mod local;
pub mod stream;

/// Where `s3://` inputs are served from.
#[derive(ClapArgs, Debug, Clone, Default)]
pub struct StoreArgs {
    /// S3-compatible endpoint, e.g. a local MinIO. Without it, region and
    /// credentials come from the AWS environment.
    #[arg(long)]
    pub endpoint: Option<String>,

    /// Access key id for `--endpoint`
    #[arg(long, default_value = "minioadmin")]
    pub access_id: String,

    /// Secret access key for `--endpoint`
    #[arg(long, default_value = "minioadmin")]
    pub access_key: String,
}

impl StoreArgs {
    pub async fn open(&self) -> Arc<dyn ObjectStore> {
        match &self.endpoint {
            Some(endpoint) => {
                debug!(%endpoint, "using S3-compatible endpoint");
                Arc::new(S3Store::with_endpoint(endpoint, &self.access_id, &self.access_key))
            }
            None => Arc::new(S3Store::from_env().await),
        }
    }
}
