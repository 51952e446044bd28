//! The mapper pool.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::counters::{CounterSender, ENGINE_GROUP};
use crate::error::{Error, Result};
use crate::{KeyValue, MapFn, TaskContext};

pub(crate) struct MapStage {
    /// Every emitted record, closed once all mappers and forwarders finish.
    pub collected: mpsc::Receiver<KeyValue>,
    /// Completion barrier of the pool.
    pub done: JoinHandle<Result<()>>,
}

/// Start `mappers` workers pulling from `input`.
///
/// Each worker waits for records on the runtime and runs the map function
/// on the blocking pool, emitting into its own queue; a forwarder per worker
/// copies that queue into the shared collector.
pub(crate) fn spawn_map_stage(
    mappers: usize,
    capacity: usize,
    map_fn: MapFn,
    aux: Bytes,
    input: mpsc::Receiver<KeyValue>,
    counters: CounterSender,
    cancel: CancellationToken,
) -> MapStage {
    let input = Arc::new(Mutex::new(input));
    let (collector, collected) = mpsc::channel(capacity);

    let mut workers: JoinSet<Result<()>> = JoinSet::new();
    for worker in 0..mappers {
        let (per_tx, mut per_rx) = mpsc::channel::<KeyValue>(capacity);
        let forward_to = collector.clone();
        workers.spawn(async move {
            while let Some(kv) = per_rx.recv().await {
                if forward_to.send(kv).await.is_err() {
                    break;
                }
            }
            Ok::<_, Error>(())
        });

        let input = Arc::clone(&input);
        let map_fn = Arc::clone(&map_fn);
        let ctx = TaskContext::new(worker, aux.clone(), counters.clone());
        let cancel = cancel.clone();
        workers.spawn(async move {
            let (mut records, mut emitted) = (0, 0);
            loop {
                let kv = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    kv = async { input.lock().await.recv().await } => match kv {
                        Some(kv) => kv,
                        None => break,
                    },
                };
                records += 1;
                let map_fn = Arc::clone(&map_fn);
                let task_ctx = ctx.clone();
                let per_tx = per_tx.clone();
                let mapped =
                    tokio::task::spawn_blocking(move || map_record(kv, &map_fn, &task_ctx, &per_tx))
                        .await?;
                emitted += mapped.emitted;
                if !mapped.delivered {
                    break;
                }
            }
            ctx.count(ENGINE_GROUP, "map input records", records);
            ctx.count(ENGINE_GROUP, "map output records", emitted);
            Ok::<_, Error>(())
        });
    }

    let done = tokio::spawn(async move {
        let mut result = Ok(());
        while let Some(joined) = workers.join_next().await {
            let failed = match joined {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => err,
                Err(err) => Error::from(err),
            };
            error!(%failed, "map worker failed");
            if result.is_ok() {
                result = Err(failed);
            }
        }
        debug!(mappers, "map stage finished");
        drop(collector);
        result
    });

    MapStage { collected, done }
}

struct Mapped {
    emitted: i64,
    /// The worker's queue was still open after the last emission.
    delivered: bool,
}

fn map_record(
    kv: KeyValue,
    map_fn: &MapFn,
    ctx: &TaskContext,
    output: &mpsc::Sender<KeyValue>,
) -> Mapped {
    let mut mapped = Mapped {
        emitted: 0,
        delivered: true,
    };
    let items = match map_fn(kv, ctx) {
        Ok(items) => items,
        Err(err) => {
            warn!(worker = ctx.worker(), "map failed, skipping record: {err:#}");
            ctx.count(ENGINE_GROUP, "map errors", 1);
            return mapped;
        }
    };
    for item in items {
        match item {
            Ok(kv) => {
                if output.blocking_send(kv).is_err() {
                    mapped.delivered = false;
                    break;
                }
                mapped.emitted += 1;
            }
            Err(err) => {
                warn!(worker = ctx.worker(), "map emitted an error: {err:#}");
                ctx.count(ENGINE_GROUP, "map errors", 1);
            }
        }
    }
    mapped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counters;
    use std::sync::Arc;

    #[tokio::test]
    async fn every_emission_reaches_the_collector() {
        let (input_tx, input_rx) = mpsc::channel(4);
        let (counters, sink) = counters::channel();
        let totals = tokio::spawn(sink.aggregate());

        let map_fn: MapFn = Arc::new(|kv: KeyValue, _ctx: &TaskContext| {
            crate::emit(vec![kv.clone(), kv])
        });
        let mut stage = spawn_map_stage(
            3,
            2,
            map_fn,
            Bytes::new(),
            input_rx,
            counters,
            CancellationToken::new(),
        );

        tokio::spawn(async move {
            for i in 0..50 {
                input_tx.send(KeyValue::new(format!("k{i}"), "v")).await.unwrap();
            }
        });

        let mut collected = 0;
        while stage.collected.recv().await.is_some() {
            collected += 1;
        }
        stage.done.await.unwrap().unwrap();
        assert_eq!(collected, 100);

        let totals = totals.await.unwrap();
        assert_eq!(totals.get(ENGINE_GROUP, "map input records"), 50);
        assert_eq!(totals.get(ENGINE_GROUP, "map output records"), 100);
    }

    #[tokio::test]
    async fn failing_records_are_counted_and_skipped() {
        let (input_tx, input_rx) = mpsc::channel(4);
        let (counters, sink) = counters::channel();
        let totals = tokio::spawn(sink.aggregate());

        let map_fn: MapFn = Arc::new(|kv: KeyValue, _ctx: &TaskContext| {
            if kv.key.as_ref() == b"bad" {
                anyhow::bail!("cannot map {}", kv.key_lossy());
            }
            crate::emit([kv])
        });
        let mut stage = spawn_map_stage(
            1,
            4,
            map_fn,
            Bytes::new(),
            input_rx,
            counters,
            CancellationToken::new(),
        );
        for key in ["ok", "bad", "ok2"] {
            input_tx.send(KeyValue::new(key, "v")).await.unwrap();
        }
        drop(input_tx);

        let mut keys = Vec::new();
        while let Some(kv) = stage.collected.recv().await {
            keys.push(kv.key_lossy());
        }
        stage.done.await.unwrap().unwrap();
        assert_eq!(keys, vec!["ok", "ok2"]);
        assert_eq!(totals.await.unwrap().get(ENGINE_GROUP, "map errors"), 1);
    }
}
