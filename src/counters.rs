//! Counter events, their aggregation, and the `reporter:counter:` protocol.
//!
//! Counters travel on an unbounded queue with a single consumer, so
//! emitting one never blocks record flow and aggregation needs no locks.

use std::time::Duration;

use fnv::FnvHashMap;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Group used for counters the engine itself maintains.
pub const ENGINE_GROUP: &str = "mrstream";
/// Group used by the heartbeat task.
pub const HEARTBEAT_GROUP: &str = "heartbeat";

/// A single counter event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Count {
    pub group: String,
    pub counter: String,
    pub amount: i64,
}

impl Count {
    pub fn new(group: impl Into<String>, counter: impl Into<String>, amount: i64) -> Self {
        Self {
            group: group.into(),
            counter: counter.into(),
            amount,
        }
    }

    /// Strip commas, which would break the reporter line, and fill in
    /// empty names.
    pub fn sanitized(self) -> Self {
        let group = self.group.replace(',', "");
        let counter = self.counter.replace(',', "");
        Self {
            group: if group.is_empty() { "global".to_string() } else { group },
            counter: if counter.is_empty() { "job".to_string() } else { counter },
            amount: self.amount,
        }
    }

    /// Format as a reporter line. Assumes the count is already sanitized.
    pub fn reporter_line(&self) -> String {
        format!(
            "reporter:counter:{},{},{}\n",
            self.group, self.counter, self.amount
        )
    }
}

/// Cloneable, non-blocking counter emitter.
#[derive(Clone, Debug)]
pub struct CounterSender {
    tx: mpsc::UnboundedSender<Count>,
}

impl CounterSender {
    pub fn add(&self, group: &str, counter: &str, amount: i64) {
        self.send(Count::new(group, counter, amount));
    }

    pub fn increment(&self, group: &str, counter: &str) {
        self.add(group, counter, 1);
    }

    pub fn send(&self, count: Count) {
        // nobody aggregating any more; counts after shutdown are dropped
        let _ = self.tx.send(count);
    }
}

/// The single consumer of counter events.
pub struct CounterSink {
    rx: mpsc::UnboundedReceiver<Count>,
}

/// Create a counter queue.
pub fn channel() -> (CounterSender, CounterSink) {
    let (tx, rx) = mpsc::unbounded_channel();
    (CounterSender { tx }, CounterSink { rx })
}

impl CounterSink {
    /// Sum every event until all senders are dropped.
    pub async fn aggregate(mut self) -> CounterTotals {
        let mut totals = CounterTotals::default();
        while let Some(count) = self.rx.recv().await {
            totals.record(count.sanitized());
        }
        totals
    }

    /// Like [`CounterSink::aggregate`], also writing each event to `writer`
    /// as a reporter line.
    pub async fn report<W>(mut self, mut writer: W) -> std::io::Result<CounterTotals>
    where
        W: AsyncWrite + Unpin,
    {
        let mut totals = CounterTotals::default();
        while let Some(count) = self.rx.recv().await {
            let count = count.sanitized();
            trace!(group = %count.group, counter = %count.counter, amount = count.amount, "counter");
            writer.write_all(count.reporter_line().as_bytes()).await?;
            writer.flush().await?;
            totals.record(count);
        }
        Ok(totals)
    }
}

/// Aggregated counter values keyed by (group, counter).
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CounterTotals {
    totals: FnvHashMap<(String, String), i64>,
}

impl CounterTotals {
    fn record(&mut self, count: Count) {
        *self.totals.entry((count.group, count.counter)).or_insert(0) += count.amount;
    }

    /// Total for a counter, looked up by its sanitized name.
    pub fn get(&self, group: &str, counter: &str) -> i64 {
        let key = Count::new(group, counter, 0).sanitized();
        self.totals
            .get(&(key.group, key.counter))
            .copied()
            .unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, i64)> {
        self.totals
            .iter()
            .map(|((group, counter), amount)| (group.as_str(), counter.as_str(), *amount))
    }

    pub fn is_empty(&self) -> bool {
        self.totals.is_empty()
    }
}

/// Periodically emit a zero-amount counter so a long, silent reduce is not
/// mistaken for a stall by an external scheduler.
///
/// Ticks once immediately, then every `period` until `cancel` fires, and
/// finally reports `heartbeat,done,1`.
pub fn spawn_heartbeat(
    counters: CounterSender,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                biased;
                _ = interval.tick() => {
                    debug!("heartbeat");
                    counters.add(HEARTBEAT_GROUP, "ticks", 0);
                }
                _ = cancel.cancelled() => break,
            }
        }
        counters.increment(HEARTBEAT_GROUP, "done");
    })
}
