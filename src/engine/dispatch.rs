//! Turns a key-ordered record sequence into reduce jobs.

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::ReduceJob;
use crate::error::{Error, Result};
use crate::handoff;
use crate::{KeyValue, Value};

/// Jobs and values handed over by a dispatcher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub jobs: u64,
    pub values: u64,
}

/// Incremental boundary scan over key-ordered input.
///
/// Identical keys must arrive contiguously. Both the jobs queue and each
/// job's values queue are synchronous, so a reducer has taken every value of
/// one key before the dispatcher can offer the next job.
pub struct Dispatcher {
    /// Open values queue of the current key. Dropping it closes the queue.
    current: Option<(Bytes, handoff::Sender<Value>)>,
    jobs: handoff::Sender<ReduceJob>,
    stats: DispatchStats,
}

impl Dispatcher {
    pub fn new(jobs: handoff::Sender<ReduceJob>) -> Self {
        Self {
            current: None,
            jobs,
            stats: DispatchStats::default(),
        }
    }

    /// Offer the next record, opening a new job on a key boundary.
    ///
    /// Waits until a reducer has accepted the job (if a new one was opened)
    /// and has taken the value.
    pub async fn offer(&mut self, key: Bytes, value: Value) -> Result<()> {
        let same_key = matches!(&self.current, Some((last, _)) if *last == key);
        if !same_key {
            // close the previous job's values before its successor exists
            self.current = None;
            let (values_tx, values_rx) = handoff::channel();
            trace!(key = %String::from_utf8_lossy(&key), "new reduce job");
            self.jobs
                .send(ReduceJob::new(key.clone(), values_rx))
                .await
                .map_err(|_| Error::Closed)?;
            self.current = Some((key, values_tx));
            self.stats.jobs += 1;
        }
        if let Some((_, values)) = &self.current {
            values.send(value).await.map_err(|_| Error::Closed)?;
            self.stats.values += 1;
        }
        Ok(())
    }

    /// Close the last values queue, then the jobs queue.
    pub fn finish(mut self) -> DispatchStats {
        self.current = None;
        self.stats
    }
}

/// Dispatch a whole key-ordered sequence, stopping early on cancellation.
pub async fn dispatch_all<I>(
    records: I,
    jobs: handoff::Sender<ReduceJob>,
    cancel: &CancellationToken,
) -> Result<DispatchStats>
where
    I: IntoIterator<Item = KeyValue>,
{
    let mut dispatcher = Dispatcher::new(jobs);
    for KeyValue { key, value } in records {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            offered = dispatcher.offer(key, value) => offered?,
        }
    }
    Ok(dispatcher.finish())
}

/// Like [`dispatch_all`], over records that are still arriving. Only the
/// current key is held in memory.
pub async fn dispatch_stream(
    mut records: mpsc::Receiver<KeyValue>,
    jobs: handoff::Sender<ReduceJob>,
    cancel: &CancellationToken,
) -> Result<DispatchStats> {
    let mut dispatcher = Dispatcher::new(jobs);
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            next = records.recv() => next,
        };
        let Some(KeyValue { key, value }) = next else {
            break;
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            offered = dispatcher.offer(key, value) => offered?,
        }
    }
    Ok(dispatcher.finish())
}
