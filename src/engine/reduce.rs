//! The reducer pool.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::ReduceJob;
use crate::counters::{CounterSender, ENGINE_GROUP};
use crate::error::{Error, Result};
use crate::handoff;
use crate::{KeyValue, ReduceFn, TaskContext};

/// Start `reducers` workers taking jobs from `jobs`.
///
/// Records emitted by the reduce function go to `output`. The returned
/// handle resolves once every worker has finished and `output` is closed.
#[allow(clippy::too_many_arguments)]
pub(crate) fn spawn_reduce_stage(
    reducers: usize,
    capacity: usize,
    reduce_fn: ReduceFn,
    aux: Bytes,
    jobs: handoff::Receiver<ReduceJob>,
    output: mpsc::Sender<KeyValue>,
    counters: CounterSender,
    cancel: CancellationToken,
) -> JoinHandle<Result<()>> {
    let mut workers: JoinSet<Result<()>> = JoinSet::new();
    for worker in 0..reducers {
        let (per_tx, mut per_rx) = mpsc::channel::<KeyValue>(capacity);
        let forward_to = output.clone();
        workers.spawn(async move {
            while let Some(kv) = per_rx.recv().await {
                if forward_to.send(kv).await.is_err() {
                    break;
                }
            }
            Ok::<_, Error>(())
        });

        let jobs = jobs.clone();
        let reduce_fn = Arc::clone(&reduce_fn);
        let ctx = TaskContext::new(worker, aux.clone(), counters.clone());
        let cancel = cancel.clone();
        workers.spawn(async move {
            loop {
                let job = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    job = jobs.recv() => match job {
                        Some(job) => job,
                        None => break,
                    },
                };
                let reduce_fn = Arc::clone(&reduce_fn);
                let ctx = ctx.clone();
                let per_tx = per_tx.clone();
                let delivered =
                    tokio::task::spawn_blocking(move || reduce_job(job, &reduce_fn, &ctx, &per_tx))
                        .await?;
                if !delivered {
                    break;
                }
            }
            Ok::<_, Error>(())
        });
    }
    drop(jobs);

    tokio::spawn(async move {
        let mut result = Ok(());
        while let Some(joined) = workers.join_next().await {
            let failed = match joined {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => err,
                Err(err) => Error::from(err),
            };
            error!(%failed, "reduce worker failed");
            if result.is_ok() {
                result = Err(failed);
            }
        }
        debug!(reducers, "reduce stage finished");
        drop(output);
        result
    })
}

/// Run the reduce function over one job. Returns `false` once the output
/// queue is gone.
fn reduce_job(
    mut job: ReduceJob,
    reduce_fn: &ReduceFn,
    ctx: &TaskContext,
    output: &mpsc::Sender<KeyValue>,
) -> bool {
    // held across the call: the function may move `job.values` out and drop it
    let remaining = job.values.receiver();
    let mut delivered = true;
    match reduce_fn(&mut job, ctx) {
        Ok(items) => {
            for item in items {
                match item {
                    Ok(kv) => {
                        if output.blocking_send(kv).is_err() {
                            delivered = false;
                            break;
                        }
                    }
                    Err(err) => {
                        warn!(key = %job.key_lossy(), "reduce emitted an error: {err:#}");
                        ctx.count(ENGINE_GROUP, "reduce errors", 1);
                    }
                }
            }
        }
        Err(err) => {
            warn!(key = %job.key_lossy(), "reduce failed: {err:#}");
            ctx.count(ENGINE_GROUP, "reduce errors", 1);
        }
    }

    // the dispatcher cannot move on until every value is taken
    let mut leftover = 0u64;
    while remaining.blocking_recv().is_some() {
        leftover += 1;
    }
    if leftover > 0 {
        warn!(key = %job.key_lossy(), leftover, "reduce returned before taking every value");
    }
    ctx.count(ENGINE_GROUP, "reduce jobs", 1);
    delivered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counters;
    use crate::engine::dispatch::dispatch_all;

    #[tokio::test]
    async fn sums_each_job_once() {
        let (counters, sink) = counters::channel();
        let totals = tokio::spawn(sink.aggregate());
        let (jobs_tx, jobs_rx) = handoff::channel();
        let (out_tx, mut out_rx) = mpsc::channel(8);

        let reduce_fn: ReduceFn = Arc::new(|job: &mut ReduceJob, _ctx: &TaskContext| {
            let sum: i64 = job
                .values
                .by_ref()
                .filter_map(|v| v.as_text().and_then(|s| s.parse::<i64>().ok()))
                .sum();
            crate::emit([KeyValue::new(job.key.clone(), sum.to_string())])
        });
        let done = spawn_reduce_stage(
            4,
            8,
            reduce_fn,
            Bytes::new(),
            jobs_rx,
            out_tx,
            counters,
            CancellationToken::new(),
        );

        let records = vec![
            KeyValue::new("a", "1"),
            KeyValue::new("a", "2"),
            KeyValue::new("b", "3"),
            KeyValue::new("c", "4"),
            KeyValue::new("c", "5"),
        ];
        let stats = dispatch_all(records, jobs_tx, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(stats.jobs, 3);

        let mut results = Vec::new();
        while let Some(kv) = out_rx.recv().await {
            results.push((kv.key_lossy(), kv.value.as_text().unwrap().to_string()));
        }
        done.await.unwrap().unwrap();
        results.sort();
        assert_eq!(
            results,
            vec![
                ("a".to_string(), "3".to_string()),
                ("b".to_string(), "3".to_string()),
                ("c".to_string(), "9".to_string()),
            ]
        );
        assert_eq!(totals.await.unwrap().get(ENGINE_GROUP, "reduce jobs"), 3);
    }

    #[tokio::test]
    async fn untaken_values_are_drained() {
        let (counters, sink) = counters::channel();
        let totals = tokio::spawn(sink.aggregate());
        let (jobs_tx, jobs_rx) = handoff::channel();
        let (out_tx, mut out_rx) = mpsc::channel(8);

        // looks at the first value only
        let reduce_fn: ReduceFn = Arc::new(|job: &mut ReduceJob, _ctx: &TaskContext| {
            let first = job.values.next().unwrap_or_default();
            crate::emit([KeyValue::new(job.key.clone(), first)])
        });
        let done = spawn_reduce_stage(
            1,
            8,
            reduce_fn,
            Bytes::new(),
            jobs_rx,
            out_tx,
            counters,
            CancellationToken::new(),
        );

        let records = (0..5)
            .map(|i| KeyValue::new("k", i.to_string()))
            .chain([KeyValue::new("l", "x")]);
        dispatch_all(records, jobs_tx, &CancellationToken::new())
            .await
            .unwrap();

        let mut results = Vec::new();
        while let Some(kv) = out_rx.recv().await {
            results.push(kv);
        }
        done.await.unwrap().unwrap();
        assert_eq!(
            results,
            vec![KeyValue::new("k", "0"), KeyValue::new("l", "x")]
        );
        assert_eq!(totals.await.unwrap().get(ENGINE_GROUP, "reduce jobs"), 2);
    }

    #[tokio::test]
    async fn moved_values_are_drained_after_an_early_stop() {
        let (counters, sink) = counters::channel();
        let totals = tokio::spawn(sink.aggregate());
        let (jobs_tx, jobs_rx) = handoff::channel();
        let (out_tx, mut out_rx) = mpsc::channel(8);

        // takes the values lazily and stops after the first
        let reduce_fn: ReduceFn = Arc::new(|job: &mut ReduceJob, _ctx: &TaskContext| -> crate::MapOutput {
            let key = job.key.clone();
            let values = std::mem::take(&mut job.values);
            Ok(Box::new(
                values
                    .take(1)
                    .map(move |v| Ok::<_, anyhow::Error>(KeyValue::new(key.clone(), v))),
            ))
        });
        let done = spawn_reduce_stage(
            1,
            8,
            reduce_fn,
            Bytes::new(),
            jobs_rx,
            out_tx,
            counters,
            CancellationToken::new(),
        );

        let records = ["1", "2", "3"]
            .into_iter()
            .map(|v| KeyValue::new("k", v))
            .chain([KeyValue::new("m", "4"), KeyValue::new("m", "5")]);
        let stats = dispatch_all(records, jobs_tx, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(stats.values, 5);

        let mut results = Vec::new();
        while let Some(kv) = out_rx.recv().await {
            results.push(kv);
        }
        done.await.unwrap().unwrap();
        assert_eq!(
            results,
            vec![KeyValue::new("k", "1"), KeyValue::new("m", "4")]
        );
        assert_eq!(totals.await.unwrap().get(ENGINE_GROUP, "reduce jobs"), 2);
    }

    #[tokio::test]
    async fn reduce_errors_are_counted() {
        let (counters, sink) = counters::channel();
        let totals = tokio::spawn(sink.aggregate());
        let (jobs_tx, jobs_rx) = handoff::channel();
        let (out_tx, mut out_rx) = mpsc::channel(8);

        let reduce_fn: ReduceFn = Arc::new(|job: &mut ReduceJob, _ctx: &TaskContext| -> crate::MapOutput {
            anyhow::bail!("no reducer for {}", job.key_lossy())
        });
        let done = spawn_reduce_stage(
            2,
            8,
            reduce_fn,
            Bytes::new(),
            jobs_rx,
            out_tx,
            counters,
            CancellationToken::new(),
        );
        dispatch_all(
            vec![KeyValue::new("a", "1"), KeyValue::new("b", "2")],
            jobs_tx,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(out_rx.recv().await.is_none());
        done.await.unwrap().unwrap();
        let totals = totals.await.unwrap();
        assert_eq!(totals.get(ENGINE_GROUP, "reduce errors"), 2);
        assert_eq!(totals.get(ENGINE_GROUP, "reduce jobs"), 2);
    }
}
