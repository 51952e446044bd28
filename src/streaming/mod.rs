//! The streaming adapter: map and reduce steps over the line protocol.
//!
//! This is how a workload runs as one step of an externally scheduled
//! batch. The scheduler sorts map output by key between the steps, so the
//! reduce step groups keys with an incremental boundary scan and never
//! holds more than the current key in memory. Counters go to a diagnostic
//! stream as `reporter:counter:` lines, together with a periodic heartbeat.
//!
//! Input is either a source of records (stdin, a file, an `http(s)` URL or
//! an `s3://` object, optionally compressed) or, in indirect mode, a source
//! of JSON lines naming such sources.

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::StreamingConfig;
use crate::counters::{self, spawn_heartbeat, CounterSender, CounterTotals, ENGINE_GROUP};
use crate::engine::dispatch::dispatch_stream;
use crate::engine::{map, reduce};
use crate::error::{Error, Result};
use crate::{handoff, sink, KeyValue, MapFn, ReduceFn};

pub mod protocol;
pub mod scan;
pub mod source;

pub use source::{Encoding, Fetcher, InputSource};

/// One line of an indirect input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndirectEntry {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<Encoding>,
}

/// What a streaming step reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Input {
    pub source: InputSource,
    /// Overrides the encoding guessed for `source`.
    pub encoding: Option<Encoding>,
    /// `source` holds [`IndirectEntry`] lines rather than records.
    pub indirect: bool,
}

impl Input {
    pub fn direct(source: InputSource) -> Self {
        Self {
            source,
            encoding: None,
            indirect: false,
        }
    }

    pub fn indirect(source: InputSource) -> Self {
        Self {
            source,
            encoding: None,
            indirect: true,
        }
    }

    pub fn with_encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = Some(encoding);
        self
    }
}

/// What a streaming step did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSummary {
    /// Input records read.
    pub records: u64,
    /// Reduce jobs opened; zero for a map step.
    pub jobs: u64,
    /// Lines written to the output.
    pub written: u64,
    pub counters: CounterTotals,
}

/// Counter reporting and heartbeat for the duration of a step.
struct Reporting {
    counters: CounterSender,
    reporter: JoinHandle<std::io::Result<CounterTotals>>,
    heartbeat: JoinHandle<()>,
    stop: CancellationToken,
}

impl Reporting {
    fn start<D>(diagnostics: D, heartbeat: std::time::Duration) -> Self
    where
        D: AsyncWrite + Unpin + Send + 'static,
    {
        let (counters, sink) = counters::channel();
        let stop = CancellationToken::new();
        Self {
            heartbeat: spawn_heartbeat(counters.clone(), heartbeat, stop.clone()),
            reporter: tokio::spawn(sink.report(diagnostics)),
            counters,
            stop,
        }
    }

    async fn finish(self) -> Result<CounterTotals> {
        self.stop.cancel();
        self.heartbeat.await?;
        drop(self.counters);
        Ok(self.reporter.await??)
    }
}

/// Runs map and reduce steps over the line protocol.
pub struct Streaming {
    config: StreamingConfig,
    fetcher: Fetcher,
}

impl Streaming {
    pub fn new(config: StreamingConfig, fetcher: Fetcher) -> Self {
        Self { config, fetcher }
    }

    /// Map every input record, writing the map output unsorted.
    pub async fn map<W, D>(
        &self,
        map_fn: MapFn,
        input: &Input,
        output: W,
        diagnostics: D,
    ) -> Result<StreamSummary>
    where
        W: AsyncWrite + Unpin,
        D: AsyncWrite + Unpin + Send + 'static,
    {
        self.config.validate()?;
        let reporting = Reporting::start(diagnostics, self.config.heartbeat);
        let outcome = self
            .map_step(map_fn, input, output, reporting.counters.clone())
            .await;
        let counters = reporting.finish().await;
        let (records, written) = outcome?;
        let summary = StreamSummary {
            records,
            jobs: 0,
            written,
            counters: counters?,
        };
        info!(records, written, "map step finished");
        Ok(summary)
    }

    async fn map_step<W>(
        &self,
        map_fn: MapFn,
        input: &Input,
        output: W,
        counters: CounterSender,
    ) -> Result<(u64, u64)>
    where
        W: AsyncWrite + Unpin,
    {
        let cancel = CancellationToken::new();
        let (records_tx, records_rx) = mpsc::channel(self.config.capacity);
        let stage = map::spawn_map_stage(
            self.config.mappers,
            self.config.capacity,
            map_fn,
            self.config.aux()?,
            records_rx,
            counters.clone(),
            cancel.clone(),
        );
        let (fed, written) = tokio::join!(
            self.feed_cancelling(input, records_tx, &counters, &cancel),
            sink::write_lines(stage.collected, output),
        );
        stage.done.await??;

        let records = settle_feed(fed)?;
        let written = written?;
        Ok((records.ok_or(Error::Closed)?, written))
    }

    /// Reduce key-ordered input, one job per run of identical keys.
    pub async fn reduce<W, D>(
        &self,
        reduce_fn: ReduceFn,
        input: &Input,
        output: W,
        diagnostics: D,
    ) -> Result<StreamSummary>
    where
        W: AsyncWrite + Unpin,
        D: AsyncWrite + Unpin + Send + 'static,
    {
        self.config.validate()?;
        let reporting = Reporting::start(diagnostics, self.config.heartbeat);
        let outcome = self
            .reduce_step(reduce_fn, input, output, reporting.counters.clone())
            .await;
        let counters = reporting.finish().await;
        let (records, jobs, written) = outcome?;
        let summary = StreamSummary {
            records,
            jobs,
            written,
            counters: counters?,
        };
        info!(records, jobs, written, "reduce step finished");
        Ok(summary)
    }

    async fn reduce_step<W>(
        &self,
        reduce_fn: ReduceFn,
        input: &Input,
        output: W,
        counters: CounterSender,
    ) -> Result<(u64, u64, u64)>
    where
        W: AsyncWrite + Unpin,
    {
        let cancel = CancellationToken::new();
        let (records_tx, records_rx) = mpsc::channel(self.config.capacity);
        let (jobs_tx, jobs_rx) = handoff::channel();
        let (output_tx, output_rx) = mpsc::channel(self.config.capacity);
        let reducing = reduce::spawn_reduce_stage(
            self.config.reducers,
            self.config.capacity,
            reduce_fn,
            self.config.aux()?,
            jobs_rx,
            output_tx,
            counters.clone(),
            cancel.clone(),
        );
        let (fed, dispatched, written) = tokio::join!(
            self.feed_cancelling(input, records_tx, &counters, &cancel),
            dispatch_stream(records_rx, jobs_tx, &cancel),
            sink::write_lines(output_rx, output),
        );
        let reduced = reducing.await?;

        let records = settle_feed(fed)?;
        let written = written?;
        reduced?;
        let stats = dispatched?;
        debug!(jobs = stats.jobs, values = stats.values, "dispatch finished");
        Ok((records.ok_or(Error::Closed)?, stats.jobs, written))
    }

    /// Feed `input` into `records`, cancelling the step if that fails.
    async fn feed_cancelling(
        &self,
        input: &Input,
        records: mpsc::Sender<KeyValue>,
        counters: &CounterSender,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let fed = if input.indirect {
            self.feed_indirect(&input.source, &records, counters).await
        } else {
            self.feed_direct(&input.source, input.encoding, &records).await
        };
        if let Err(err) = &fed {
            if !matches!(err, Error::Closed) {
                cancel.cancel();
            }
        }
        fed
    }

    async fn feed_direct(
        &self,
        source: &InputSource,
        encoding: Option<Encoding>,
        records: &mpsc::Sender<KeyValue>,
    ) -> Result<u64> {
        let (reader, encoding) = self.fetcher.open(source, encoding).await?;
        debug!(%source, ?encoding, "streaming");
        scan::scan(reader, encoding, protocol::parse_line, records.clone()).await
    }

    async fn feed_indirect(
        &self,
        index: &InputSource,
        records: &mpsc::Sender<KeyValue>,
        counters: &CounterSender,
    ) -> Result<u64> {
        let (reader, encoding) = self.fetcher.open(index, None).await?;
        let (lines_tx, mut lines) = mpsc::channel(self.config.capacity);
        let listing = tokio::spawn(scan::scan(
            reader,
            encoding,
            |line: &[u8]| protocol::trim_line_end(line).to_vec(),
            lines_tx,
        ));

        let mut total = 0;
        while let Some(line) = lines.recv().await {
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            let entry: IndirectEntry = match serde_json::from_slice(&line) {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(%err, "skipping malformed indirect line");
                    counters.increment(ENGINE_GROUP, "bad indirect lines");
                    continue;
                }
            };
            match self.feed_entry(&entry, records).await {
                Ok(n) => total += n,
                Err(Error::Closed) => return Err(Error::Closed),
                Err(err) => {
                    warn!(url = %entry.url, "skipping source: {err}");
                    counters.increment(ENGINE_GROUP, "fetch failures");
                }
            }
        }
        listing.await??;
        Ok(total)
    }

    /// Stream one named source, retrying the open.
    async fn feed_entry(
        &self,
        entry: &IndirectEntry,
        records: &mpsc::Sender<KeyValue>,
    ) -> Result<u64> {
        let source: InputSource = entry.url.parse()?;
        let fetcher = &self.fetcher;
        let named = &source;
        let hint = entry.encoding;
        let (reader, encoding) = self
            .config
            .retry
            .run(&format!("opening {source}"), move || fetcher.open(named, hint))
            .await?;
        debug!(%source, ?encoding, "streaming");
        scan::scan(reader, encoding, protocol::parse_line, records.clone()).await
    }
}

/// A failed feed cancels the step, so its error outranks whatever the
/// cancellation caused downstream. A feed that found its queue closed
/// failed because of downstream, and yields `None`.
fn settle_feed(fed: Result<u64>) -> Result<Option<u64>> {
    match fed {
        Ok(records) => Ok(Some(records)),
        Err(Error::Closed) => Ok(None),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use crate::{emit, ReduceJob, TaskContext, Value};
    use dashmap::DashMap;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;

    fn streaming(reducers: usize) -> Streaming {
        let config = StreamingConfig {
            reducers,
            heartbeat: Duration::from_secs(3600),
            retry: RetryPolicy::none(),
            ..StreamingConfig::default()
        };
        Streaming::new(config, Fetcher::new())
    }

    fn write_file(dir: &Path, name: &str, content: &[u8]) -> InputSource {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        InputSource::File(path)
    }

    /// Records every job's values and emits `key TAB count`.
    fn observing_reducer(seen: Arc<DashMap<String, Vec<Value>>>) -> ReduceFn {
        Arc::new(move |job: &mut ReduceJob, _ctx: &TaskContext| {
            let values: Vec<Value> = job.values.by_ref().collect();
            let n = values.len();
            seen.entry(job.key_lossy()).or_default().extend(values);
            emit([KeyValue::new(job.key.clone(), n.to_string())])
        })
    }

    #[tokio::test]
    async fn reduce_groups_sorted_lines() {
        let dir = tempfile::tempdir().unwrap();
        let source = write_file(dir.path(), "part-0", b"a\t1\na\t2\nb\t3\n");
        let seen = Arc::new(DashMap::new());

        let mut out = Vec::new();
        let summary = streaming(1)
            .reduce(
                observing_reducer(Arc::clone(&seen)),
                &Input::direct(source),
                &mut out,
                tokio::io::sink(),
            )
            .await
            .unwrap();

        assert_eq!(summary.records, 3);
        assert_eq!(summary.jobs, 2);
        assert_eq!(out, b"a\t2\nb\t1\n");
        assert_eq!(
            seen.get("a").unwrap().clone(),
            vec![Value::from("1"), Value::from("2")]
        );
        assert_eq!(seen.get("b").unwrap().clone(), vec![Value::from("3")]);
    }

    #[tokio::test]
    async fn bare_key_is_one_job_with_empty_value() {
        let dir = tempfile::tempdir().unwrap();
        let source = write_file(dir.path(), "part-0", b"onlykey\n");
        let seen = Arc::new(DashMap::new());

        let mut out = Vec::new();
        let summary = streaming(1)
            .reduce(
                observing_reducer(Arc::clone(&seen)),
                &Input::direct(source),
                &mut out,
                tokio::io::sink(),
            )
            .await
            .unwrap();
        assert_eq!(summary.jobs, 1);
        assert_eq!(seen.get("onlykey").unwrap().clone(), vec![Value::from("")]);
    }

    #[tokio::test]
    async fn gzip_input_is_decompressed_by_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"x\t1\nx\t1\ny\t1\n").unwrap();
        let source = write_file(dir.path(), "part-0.gz", &encoder.finish().unwrap());

        let mut out = Vec::new();
        let summary = streaming(3)
            .reduce(
                observing_reducer(Arc::new(DashMap::new())),
                &Input::direct(source),
                &mut out,
                tokio::io::sink(),
            )
            .await
            .unwrap();
        assert_eq!(summary.jobs, 2);
        let mut lines: Vec<&[u8]> = out.split(|&b| b == b'\n').filter(|l| !l.is_empty()).collect();
        lines.sort();
        assert_eq!(lines, vec![&b"x\t2"[..], &b"y\t1"[..]]);
    }

    #[tokio::test]
    async fn map_writes_every_emission() {
        let dir = tempfile::tempdir().unwrap();
        let source = write_file(dir.path(), "in", b"k1\tv\nk2\tv\n");
        let map_fn: MapFn = Arc::new(|kv: KeyValue, _ctx: &TaskContext| {
            emit([KeyValue::new(kv.key.clone(), "seen"), KeyValue::new(kv.key, "")])
        });

        let mut out = Vec::new();
        let summary = streaming(1)
            .map(map_fn, &Input::direct(source), &mut out, tokio::io::sink())
            .await
            .unwrap();
        assert_eq!(summary.records, 2);
        assert_eq!(summary.written, 4);
        assert_eq!(out, b"k1\tseen\nk1\nk2\tseen\nk2\n");
        assert_eq!(summary.counters.get(ENGINE_GROUP, "map input records"), 2);
    }

    #[test]
    fn map_step_needs_few_blocking_threads() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .max_blocking_threads(2)
            .enable_all()
            .build()
            .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let source = write_file(dir.path(), "in", b"k1\tv\nk2\tv\nk3\tv\n");
        let config = StreamingConfig {
            mappers: 4,
            heartbeat: Duration::from_secs(3600),
            ..StreamingConfig::default()
        };
        let map_fn: MapFn = Arc::new(|kv: KeyValue, _ctx: &TaskContext| emit([kv]));

        let mut out = Vec::new();
        let step = Streaming::new(config, Fetcher::new());
        let summary = runtime
            .block_on(async {
                tokio::time::timeout(
                    Duration::from_secs(30),
                    step.map(map_fn, &Input::direct(source), &mut out, tokio::io::sink()),
                )
                .await
            })
            .expect("map step stalled")
            .unwrap();
        assert_eq!(summary.written, 3);
    }

    #[tokio::test]
    async fn indirect_skips_failed_sources_and_bad_lines() {
        let dir = tempfile::tempdir().unwrap();
        let first = write_file(dir.path(), "a", b"a\t1\n");
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"b\t1\nb\t1\n").unwrap();
        let second = write_file(dir.path(), "b.gz", &encoder.finish().unwrap());
        let missing = dir.path().join("missing");

        let index = [
            serde_json::json!({ "url": first.to_string() }).to_string(),
            "{ not json".to_string(),
            serde_json::json!({ "url": missing.display().to_string() }).to_string(),
            String::new(),
            serde_json::json!({ "url": second.to_string(), "encoding": "gzip" }).to_string(),
        ]
        .join("\n");
        let index = write_file(dir.path(), "index.json", index.as_bytes());

        let mut out = Vec::new();
        let summary = streaming(1)
            .reduce(
                observing_reducer(Arc::new(DashMap::new())),
                &Input::indirect(index),
                &mut out,
                tokio::io::sink(),
            )
            .await
            .unwrap();
        assert_eq!(summary.records, 3);
        assert_eq!(out, b"a\t1\nb\t2\n");
        assert_eq!(summary.counters.get(ENGINE_GROUP, "fetch failures"), 1);
        assert_eq!(summary.counters.get(ENGINE_GROUP, "bad indirect lines"), 1);
    }

    #[tokio::test]
    async fn counters_reach_the_diagnostic_stream() {
        let dir = tempfile::tempdir().unwrap();
        let source = write_file(dir.path(), "in", b"a\t1\n");
        let diagnostics = dir.path().join("stderr");
        let reduce_fn: ReduceFn = Arc::new(|job: &mut ReduceJob, ctx: &TaskContext| {
            ctx.count("my,group", "", job.values.by_ref().count() as i64);
            crate::emit_none()
        });

        let mut out = Vec::new();
        streaming(1)
            .reduce(
                reduce_fn,
                &Input::direct(source),
                &mut out,
                tokio::fs::File::create(&diagnostics).await.unwrap(),
            )
            .await
            .unwrap();
        let reported = std::fs::read_to_string(&diagnostics).unwrap();
        assert!(reported.contains("reporter:counter:mygroup,job,1\n"));
        assert!(reported.contains("reporter:counter:heartbeat,ticks,0\n"));
        assert!(reported.ends_with("reporter:counter:heartbeat,done,1\n"));
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn missing_direct_source_fails_the_step() {
        let dir = tempfile::tempdir().unwrap();
        let source = InputSource::File(dir.path().join("absent"));
        let result = streaming(2)
            .reduce(
                observing_reducer(Arc::new(DashMap::new())),
                &Input::direct(source),
                Vec::new(),
                tokio::io::sink(),
            )
            .await;
        assert!(matches!(result, Err(Error::Io(_))));
    }
}
