use std::sync::Arc;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, trace};

use super::{send, Driver, RecordSender};
use crate::error::{Error, Result};
use crate::retry::RetryPolicy;
use crate::store::ObjectStore;
use crate::{KeyValue, Value};

/// One record per object under a bucket prefix.
///
/// Listing pages are walked with a continuation marker and fed to a pool of
/// loader tasks. Each page may be shuffled first so that neighbouring, and
/// often similarly hot, keys are not fetched together.
pub struct BucketDriver {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    prefix: String,
    loaders: usize,
    shuffle: bool,
    retry: RetryPolicy,
}

impl BucketDriver {
    pub fn new(store: Arc<dyn ObjectStore>, bucket: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            bucket: bucket.into(),
            prefix: prefix.into(),
            loaders: 4,
            shuffle: false,
            retry: RetryPolicy::default(),
        }
    }

    pub fn loaders(mut self, loaders: usize) -> Self {
        self.loaders = loaders.max(1);
        self
    }

    /// Randomize the order within each listing page.
    pub fn shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

#[async_trait]
impl Driver for BucketDriver {
    async fn drive(self: Box<Self>, output: RecordSender) -> Result<()> {
        let (keys_tx, keys_rx) = mpsc::channel::<String>(1000);
        let keys_rx = Arc::new(Mutex::new(keys_rx));

        let mut loaders = JoinSet::new();
        for _ in 0..self.loaders {
            let keys = Arc::clone(&keys_rx);
            let store = Arc::clone(&self.store);
            let bucket = self.bucket.clone();
            let retry = self.retry.clone();
            let output = output.clone();
            loaders.spawn(async move {
                loop {
                    let Some(key) = keys.lock().await.recv().await else {
                        return Ok::<_, Error>(());
                    };
                    let body = retry
                        .run("get", || store.get_bytes(&bucket, &key))
                        .await?;
                    trace!(%key, bytes = body.len(), "loaded object");
                    send(&output, KeyValue::new(key, Value::content(body))).await?;
                }
            });
        }
        drop(output);
        drop(keys_rx);

        let mut listing = std::pin::pin!(list_into(
            &*self.store,
            &self.bucket,
            &self.prefix,
            self.shuffle,
            keys_tx,
        ));
        let mut listed = None;
        let mut failed = None;
        // the first loader failure ends the listing and the rest of the pool
        while failed.is_none() {
            tokio::select! {
                result = listing.as_mut(), if listed.is_none() => listed = Some(result),
                joined = loaders.join_next() => match joined {
                    None => break,
                    Some(Ok(Ok(()))) => {}
                    Some(Ok(Err(err))) => failed = Some(err),
                    Some(Err(err)) if err.is_cancelled() => {}
                    Some(Err(err)) => failed = Some(err.into()),
                },
            }
        }
        if let Some(err) = failed {
            loaders.abort_all();
            while loaders.join_next().await.is_some() {}
            return Err(err);
        }
        let objects = match listed {
            Some(listed) => listed?,
            None => listing.await?,
        };
        debug!(bucket = %self.bucket, prefix = %self.prefix, objects, "bucket drained");
        Ok(())
    }
}

/// Page through a listing, pushing every key into `keys`.
async fn list_into(
    store: &dyn ObjectStore,
    bucket: &str,
    prefix: &str,
    shuffle: bool,
    keys: mpsc::Sender<String>,
) -> Result<usize> {
    let mut marker: Option<String> = None;
    let mut total = 0;
    loop {
        let page = store.list(bucket, prefix, marker.as_deref()).await?;
        let mut entries = page.entries;
        if shuffle {
            entries.shuffle(&mut rand::rng());
        }
        total += entries.len();
        for entry in entries {
            keys.send(entry.key).await.map_err(|_| Error::Closed)?;
        }
        match page.next_marker {
            Some(next) if page.truncated => marker = Some(next),
            _ => break,
        }
    }
    Ok(total)
}
