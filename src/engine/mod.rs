//! The local MapReduce engine.
//!
//! A run flows through four stages:
//!
//! 1. the driver pushes input records onto a bounded queue,
//! 2. a pool of mappers applies the map function, each emitting through its
//!    own queue into a shared collector,
//! 3. the collector is buffered in memory and stably sorted by key,
//! 4. a dispatcher walks the sorted records and hands each distinct key to
//!    exactly one reducer of a pool, over synchronous queues.
//!
//! Reduce output is delivered on [`Run::recv`] in completion order. Nothing
//! is ordered across keys.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::counters::{self, CounterTotals};
use crate::driver::Driver;
use crate::error::{Error, Result};
use crate::{handoff, KeyValue, Workload};

pub mod dispatch;
mod job;
pub(crate) mod map;
pub(crate) mod reduce;
pub mod shuffle;

pub use dispatch::{DispatchStats, Dispatcher};
pub use job::{ReduceJob, Values};

/// What a finished run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub run_id: Uuid,
    /// Distinct keys handed to reducers.
    pub jobs: u64,
    /// Intermediate values handed to reducers.
    pub values: u64,
    pub counters: CounterTotals,
}

pub struct Engine {
    config: EngineConfig,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Start a run of `workload` over the records `driver` produces.
    ///
    /// Must be called within a tokio runtime. Reduce output has to be
    /// consumed (see [`Run::recv`], [`Run::collect`] and [`Run::wait`]) or
    /// the run stalls once the output queue is full.
    pub fn run<D>(&self, workload: Workload, driver: D) -> Result<Run>
    where
        D: Driver + 'static,
    {
        self.config.validate()?;
        let aux = self.config.aux()?;
        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let (output_tx, output) = mpsc::channel(self.config.capacity);

        let plan = Plan {
            id,
            config: self.config.clone(),
            workload,
            aux,
            cancel: cancel.clone(),
        };
        let span = info_span!("run", run_id = %id);
        let task = tokio::spawn(plan.execute(Box::new(driver), output_tx).instrument(span));

        Ok(Run {
            id,
            output,
            task,
            cancel,
        })
    }
}

/// Handle to an active run.
pub struct Run {
    id: Uuid,
    output: mpsc::Receiver<KeyValue>,
    task: JoinHandle<Result<RunSummary>>,
    cancel: CancellationToken,
}

impl Run {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The next reduce output record. `None` once every reducer has finished.
    pub async fn recv(&mut self) -> Option<KeyValue> {
        self.output.recv().await
    }

    /// Ask every stage to stop. The run then finishes with
    /// [`Error::Cancelled`].
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Discard remaining output and wait for the run to finish.
    pub async fn wait(mut self) -> Result<RunSummary> {
        while self.output.recv().await.is_some() {}
        self.task.await?
    }

    /// Gather all remaining output, then wait for the run to finish.
    pub async fn collect(mut self) -> Result<(Vec<KeyValue>, RunSummary)> {
        let mut records = Vec::new();
        while let Some(kv) = self.output.recv().await {
            records.push(kv);
        }
        let summary = self.task.await??;
        Ok((records, summary))
    }
}

struct Plan {
    id: Uuid,
    config: EngineConfig,
    workload: Workload,
    aux: bytes::Bytes,
    cancel: CancellationToken,
}

impl Plan {
    async fn execute(
        self,
        driver: Box<dyn Driver>,
        output: mpsc::Sender<KeyValue>,
    ) -> Result<RunSummary> {
        let Plan {
            id,
            config,
            workload,
            aux,
            cancel,
        } = self;
        info!(
            mappers = config.mappers,
            reducers = config.reducers,
            capacity = config.capacity,
            "run started"
        );

        let (counters, sink) = counters::channel();
        let totals = tokio::spawn(sink.aggregate());

        // map phase
        let (input_tx, input_rx) = mpsc::channel(config.capacity);
        let driving = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let guard = input_tx.clone();
                let result = tokio::select! {
                    _ = cancel.cancelled() => Err(Error::Cancelled),
                    result = driver.drive(input_tx) => result,
                };
                if result.is_err() {
                    // mappers must not see a closed input as a clean end
                    cancel.cancel();
                }
                drop(guard);
                result
            })
        };
        let map_stage = map::spawn_map_stage(
            config.mappers,
            config.capacity,
            workload.map_fn.clone(),
            aux.clone(),
            input_rx,
            counters.clone(),
            cancel.clone(),
        );
        let records =
            shuffle::collect_sorted(map_stage.collected, workload.value_order.as_ref()).await;

        let driven = driving.await?;
        map_stage.done.await??;
        match driven {
            Ok(()) => {}
            Err(Error::Cancelled) | Err(Error::Closed) => return Err(Error::Cancelled),
            Err(err) => {
                warn!(%err, "driver failed, run cancelled");
                return Err(Error::driver(err));
            }
        }
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        debug!(records = records.len(), "map phase finished");

        // reduce phase
        let (jobs_tx, jobs_rx) = handoff::channel();
        let reduce_stage = reduce::spawn_reduce_stage(
            config.reducers,
            config.capacity,
            workload.reduce_fn.clone(),
            aux,
            jobs_rx,
            output,
            counters.clone(),
            cancel.clone(),
        );
        let dispatched = dispatch::dispatch_all(records, jobs_tx, &cancel).await;
        let reduced = reduce_stage.await?;
        reduced?;
        let stats = dispatched?;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        drop(counters);
        let counters = totals.await?;
        let summary = RunSummary {
            run_id: id,
            jobs: stats.jobs,
            values: stats.values,
            counters,
        };
        info!(jobs = summary.jobs, values = summary.values, "run finished");
        Ok(summary)
    }
}
